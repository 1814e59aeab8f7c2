//! Independent liveness watchdog.
//!
//! Runs as a separate process from the orchestrator, consuming the same
//! state store. It never mutates state; it only raises rate-limited alerts
//! when the controller looks dead, wedged, or escalated.

use anyhow::Result;
use chrono::Utc;
use delta_hedge_core::alerts::{AlertKind, RateLimitedAlerts};
use delta_hedge_core::config::WatchdogConfig;
use delta_hedge_state::{StateStore, TradingState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub struct Watchdog {
    store: Arc<dyn StateStore>,
    state_key: String,
    heartbeat_key: String,
    config: WatchdogConfig,
    failure_threshold: u32,
    alerts: Arc<RateLimitedAlerts>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Watchdog {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        store: Arc<dyn StateStore>,
        state_key: impl Into<String>,
        heartbeat_key: impl Into<String>,
        config: WatchdogConfig,
        failure_threshold: u32,
        alerts: Arc<RateLimitedAlerts>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            state_key: state_key.into(),
            heartbeat_key: heartbeat_key.into(),
            config,
            failure_threshold,
            alerts,
            shutdown_rx,
        }
    }

    /// Polls until shutdown.
    ///
    /// # Errors
    ///
    /// Never returns an error today; the Result keeps the signature stable
    /// for store backends that may need to fail fatally.
    pub async fn run(mut self) -> Result<()> {
        tracing::info!(
            poll_interval_secs = self.config.poll_interval_secs,
            max_heartbeat_age_secs = self.config.max_heartbeat_age_secs,
            "watchdog started"
        );

        loop {
            if *self.shutdown_rx.borrow() {
                tracing::info!("watchdog stopped");
                return Ok(());
            }

            self.poll_once().await;

            let mut shutdown_rx = self.shutdown_rx.clone();
            tokio::select! {
                () = tokio::time::sleep(Duration::from_secs(self.config.poll_interval_secs)) => {}
                _ = shutdown_rx.changed() => {}
            }
        }
    }

    /// One observation pass. Store errors are logged and alerted as a stale
    /// heartbeat, since an unreachable store and a dead controller are
    /// indistinguishable from here.
    pub async fn poll_once(&self) {
        match self.store.get_heartbeat(&self.heartbeat_key).await {
            Ok(Some(beat_at)) => {
                let age = Utc::now().signed_duration_since(beat_at);
                let max_age = chrono::Duration::seconds(
                    i64::try_from(self.config.max_heartbeat_age_secs).unwrap_or(i64::MAX),
                );
                if age > max_age {
                    self.alerts
                        .send(
                            AlertKind::StaleHeartbeat,
                            &format!(
                                "controller heartbeat is {}s old (max {}s)",
                                age.num_seconds(),
                                self.config.max_heartbeat_age_secs
                            ),
                        )
                        .await;
                }
            }
            Ok(None) => {
                self.alerts
                    .send(
                        AlertKind::StaleHeartbeat,
                        "controller heartbeat has never been written",
                    )
                    .await;
            }
            Err(e) => {
                tracing::warn!("heartbeat read failed: {e}");
                self.alerts
                    .send(
                        AlertKind::StaleHeartbeat,
                        &format!("heartbeat unreadable: {e}"),
                    )
                    .await;
            }
        }

        match self.store.get(&self.state_key).await {
            Ok(Some(state)) => {
                if state.current_state == TradingState::ErrorRecovery {
                    self.alerts
                        .send(
                            AlertKind::ErrorRecovery,
                            &format!(
                                "controller is in ERROR_RECOVERY after {} failures: {}",
                                state.consecutive_failures,
                                state.last_error.as_deref().unwrap_or("unknown error")
                            ),
                        )
                        .await;
                } else if state.consecutive_failures >= self.failure_threshold {
                    self.alerts
                        .send(
                            AlertKind::ErrorRecovery,
                            &format!(
                                "controller reports {} consecutive failures",
                                state.consecutive_failures
                            ),
                        )
                        .await;
                }
            }
            Ok(None) => {
                tracing::debug!("no persisted controller state yet");
            }
            Err(e) => {
                tracing::warn!("state read failed: {e}");
            }
        }
    }
}
