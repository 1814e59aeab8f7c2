//! Outward alerting with per-kind rate limiting.
//!
//! Severe conditions are pushed through an [`AlertSink`]; the rate limiter
//! keeps a sustained failure from turning into a notification storm.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Stable alert categories; rate limiting is applied per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertKind {
    /// Lock ownership was lost mid-run (split-brain guard tripped).
    LockLost,
    /// The state machine escalated to error recovery.
    ErrorRecovery,
    /// A rebalance dispatch failed.
    DispatchFailed,
    /// The controller heartbeat is missing or stale.
    StaleHeartbeat,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LockLost => "lock_lost",
            Self::ErrorRecovery => "error_recovery",
            Self::DispatchFailed => "dispatch_failed",
            Self::StaleHeartbeat => "stale_heartbeat",
        };
        f.write_str(name)
    }
}

/// Destination for outward notifications (pager, chat webhook, log).
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, kind: AlertKind, message: &str);
}

/// Sink that writes alerts to the tracing log at error level.
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn send(&self, kind: AlertKind, message: &str) {
        tracing::error!(alert = %kind, "{message}");
    }
}

/// Wraps a sink and drops repeats of the same alert kind that arrive within
/// the minimum interval.
pub struct RateLimitedAlerts {
    inner: Arc<dyn AlertSink>,
    min_interval: Duration,
    last_sent: Mutex<HashMap<AlertKind, Instant>>,
}

impl RateLimitedAlerts {
    #[must_use]
    pub fn new(inner: Arc<dyn AlertSink>, min_interval: Duration) -> Self {
        Self {
            inner,
            min_interval,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Forwards the alert unless one of the same kind was sent too recently.
    /// Returns whether the alert was forwarded.
    pub async fn send(&self, kind: AlertKind, message: &str) -> bool {
        let now = Instant::now();
        {
            let mut last_sent = self.last_sent.lock().await;
            if let Some(last) = last_sent.get(&kind) {
                if now.duration_since(*last) < self.min_interval {
                    tracing::debug!(alert = %kind, "alert suppressed by rate limit");
                    return false;
                }
            }
            last_sent.insert(kind, now);
        }
        self.inner.send(kind, message).await;
        true
    }
}
