pub mod alerts;
pub mod backoff;
pub mod config;
pub mod config_loader;
pub mod error;
pub mod traits;

pub use alerts::{AlertKind, AlertSink, RateLimitedAlerts, TracingAlertSink};
pub use backoff::{with_retry, BackoffPolicy, RetryOptions};
pub use config::{
    AppConfig, DatabaseConfig, EngineConfig, LockConfig, SchedulerConfig, WatchdogConfig,
};
pub use config_loader::ConfigLoader;
pub use error::ConfigError;
pub use traits::{CostEstimator, LegPosition, LegVenue, PriceOracle, PriceQuote};
