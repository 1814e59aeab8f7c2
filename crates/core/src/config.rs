use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

/// Distributed lock lease settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Resource name the lock guards. One live controller per resource.
    #[serde(default = "default_lock_resource")]
    pub resource: String,
    #[serde(default = "default_lock_ttl_secs")]
    pub ttl_secs: u64,
    /// Renewal cadence; must be shorter than the TTL.
    #[serde(default = "default_lock_renew_secs")]
    pub renew_interval_secs: u64,
}

/// Thresholds consumed by the rebalance decision engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Net delta drift, as a fraction of gross leg A exposure, that triggers
    /// a rebalance.
    #[serde(default = "default_drift_threshold")]
    pub drift_threshold: f64,
    /// How long leg A may sit out of range before the hedge is unwound.
    #[serde(default = "default_max_out_of_range_secs")]
    pub max_out_of_range_secs: u64,
    /// Estimated execution cost ceiling, in quote currency.
    #[serde(default = "default_max_rebalance_cost")]
    pub max_rebalance_cost: f64,
    /// Start of the quiet window (UTC hour, inclusive). No window when unset.
    #[serde(default)]
    pub quiet_start_hour: Option<u32>,
    /// End of the quiet window (UTC hour, exclusive).
    #[serde(default)]
    pub quiet_end_hour: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_cycle_interval_secs")]
    pub cycle_interval_secs: u64,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Consecutive cycle failures before the state machine escalates to
    /// error recovery.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Hard budget for graceful shutdown before the process is terminated.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default = "default_watchdog_poll_secs")]
    pub poll_interval_secs: u64,
    /// Heartbeat older than this is treated as a dead or wedged controller.
    #[serde(default = "default_max_heartbeat_age_secs")]
    pub max_heartbeat_age_secs: u64,
    /// Minimum spacing between alerts of the same kind.
    #[serde(default = "default_alert_min_interval_secs")]
    pub alert_min_interval_secs: u64,
}

fn default_database_url() -> String {
    "sqlite://delta_hedge.db".to_string()
}

const fn default_max_connections() -> u32 {
    5
}

fn default_lock_resource() -> String {
    "delta-hedge".to_string()
}

const fn default_lock_ttl_secs() -> u64 {
    30
}

const fn default_lock_renew_secs() -> u64 {
    10
}

const fn default_drift_threshold() -> f64 {
    0.05 // 5%
}

const fn default_max_out_of_range_secs() -> u64 {
    1800 // 30 minutes
}

const fn default_max_rebalance_cost() -> f64 {
    5.0
}

const fn default_cycle_interval_secs() -> u64 {
    60
}

const fn default_backoff_initial_ms() -> u64 {
    1000
}

const fn default_backoff_max_ms() -> u64 {
    60_000
}

const fn default_backoff_multiplier() -> f64 {
    2.0
}

const fn default_max_consecutive_failures() -> u32 {
    5
}

const fn default_shutdown_grace_secs() -> u64 {
    15
}

const fn default_watchdog_poll_secs() -> u64 {
    30
}

const fn default_max_heartbeat_age_secs() -> u64 {
    180
}

const fn default_alert_min_interval_secs() -> u64 {
    300
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            lock: LockConfig::default(),
            engine: EngineConfig::default(),
            scheduler: SchedulerConfig::default(),
            watchdog: WatchdogConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            resource: default_lock_resource(),
            ttl_secs: default_lock_ttl_secs(),
            renew_interval_secs: default_lock_renew_secs(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            drift_threshold: default_drift_threshold(),
            max_out_of_range_secs: default_max_out_of_range_secs(),
            max_rebalance_cost: default_max_rebalance_cost(),
            quiet_start_hour: None,
            quiet_end_hour: None,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: default_cycle_interval_secs(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_consecutive_failures: default_max_consecutive_failures(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_watchdog_poll_secs(),
            max_heartbeat_age_secs: default_max_heartbeat_age_secs(),
            alert_min_interval_secs: default_alert_min_interval_secs(),
        }
    }
}

impl AppConfig {
    /// Validates cross-field constraints that serde defaults cannot express.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` describing the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock.ttl_secs == 0 {
            return Err(ConfigError::Invalid("lock.ttl_secs must be positive".into()));
        }
        if self.lock.renew_interval_secs >= self.lock.ttl_secs {
            return Err(ConfigError::Invalid(
                "lock.renew_interval_secs must be shorter than lock.ttl_secs".into(),
            ));
        }
        if self.engine.drift_threshold <= 0.0 {
            return Err(ConfigError::Invalid(
                "engine.drift_threshold must be positive".into(),
            ));
        }
        if self.scheduler.backoff_multiplier <= 1.0 {
            return Err(ConfigError::Invalid(
                "scheduler.backoff_multiplier must exceed 1.0".into(),
            ));
        }
        if self.scheduler.backoff_initial_ms == 0
            || self.scheduler.backoff_max_ms < self.scheduler.backoff_initial_ms
        {
            return Err(ConfigError::Invalid(
                "scheduler backoff delays must satisfy 0 < initial <= max".into(),
            ));
        }
        if self.scheduler.max_consecutive_failures == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.max_consecutive_failures must be positive".into(),
            ));
        }
        match (self.engine.quiet_start_hour, self.engine.quiet_end_hour) {
            (Some(s), Some(e)) if s < 24 && e < 24 => {}
            (None, None) => {}
            _ => {
                return Err(ConfigError::Invalid(
                    "quiet window hours must both be set and within 0..24".into(),
                ));
            }
        }
        Ok(())
    }
}
