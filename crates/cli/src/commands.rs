//! Composition root for each subcommand.
//!
//! This is the only place that loads configuration, opens the database, and
//! decides how fatal conditions map to process exit codes.

use crate::venues::{FixedPriceOracle, FlatCostEstimator, PaperLegVenue};
use anyhow::{Context, Result};
use delta_hedge_bot_orchestrator::{
    Collaborators, CycleSettings, Orchestrator, OrchestratorError,
};
use delta_hedge_core::alerts::{RateLimitedAlerts, TracingAlertSink};
use delta_hedge_core::backoff::BackoffPolicy;
use delta_hedge_core::config::AppConfig;
use delta_hedge_core::ConfigLoader;
use delta_hedge_engine::{DecisionConfig, QuietWindow};
use delta_hedge_lock::{DistributedLock, SqliteLockStore};
use delta_hedge_state::{SqliteStateStore, StateMachine, StateStore};
use delta_hedge_watchdog::Watchdog;
use rust_decimal::Decimal;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Process exit code when another instance already holds the lock.
const EXIT_LOCK_CONTENDED: i32 = 2;
/// Process exit code when lock ownership is lost mid-run.
const EXIT_LOCK_LOST: i32 = 3;

async fn open_pool(config: &AppConfig) -> Result<SqlitePool> {
    SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .context(format!("failed to open database {}", config.database.url))
}

fn state_key(config: &AppConfig) -> String {
    format!("{}:state", config.lock.resource)
}

fn heartbeat_key(config: &AppConfig) -> String {
    format!("{}:heartbeat", config.lock.resource)
}

fn decision_config(config: &AppConfig) -> Result<DecisionConfig> {
    let quiet_window = match (config.engine.quiet_start_hour, config.engine.quiet_end_hour) {
        (Some(start), Some(end)) => Some(QuietWindow::new(start, end)),
        _ => None,
    };
    let max_estimated_cost = Decimal::try_from(config.engine.max_rebalance_cost)
        .context("engine.max_rebalance_cost is not representable")?;

    Ok(DecisionConfig {
        drift_threshold: config.engine.drift_threshold,
        max_out_of_range: Duration::from_secs(config.engine.max_out_of_range_secs),
        max_estimated_cost,
        quiet_window,
    })
}

/// Routes termination signals into the shutdown channel and arms the hard
/// abort timer for a wedged graceful shutdown.
fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>, grace: Duration) -> Result<()> {
    #[cfg(unix)]
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;

    tokio::spawn(async move {
        #[cfg(unix)]
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        #[cfg(not(unix))]
        let _ = tokio::signal::ctrl_c().await;

        tracing::info!("termination signal received, shutting down");
        let _ = shutdown_tx.send(true);

        tokio::time::sleep(grace).await;
        tracing::error!(
            grace_secs = grace.as_secs(),
            "graceful shutdown budget exceeded, terminating"
        );
        std::process::exit(1);
    });
    Ok(())
}

/// Runs the hedge controller until shutdown or a fatal condition.
pub async fn run(config_path: &str) -> Result<()> {
    let config = ConfigLoader::load(config_path)?;
    let pool = open_pool(&config).await?;

    let lock_store = Arc::new(SqliteLockStore::new(pool.clone()).await?);
    let state_store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::new(pool).await?);

    let lock = Arc::new(DistributedLock::new(
        lock_store,
        config.lock.resource.clone(),
        Duration::from_secs(config.lock.ttl_secs),
        Duration::from_secs(config.lock.renew_interval_secs),
    ));
    let machine = StateMachine::new(
        state_store.clone(),
        state_key(&config),
        config.scheduler.max_consecutive_failures,
    );

    // Paper collaborators: simulated fills, no real venue connectivity.
    // Protocol clients are injected here when wired for live trading.
    let collaborators = Collaborators {
        leg_a: Arc::new(PaperLegVenue::new("leg-a")),
        leg_b: Arc::new(PaperLegVenue::new("leg-b")),
        oracle: Arc::new(FixedPriceOracle::new(Decimal::ONE)),
        cost: Arc::new(FlatCostEstimator::new(Decimal::ZERO)),
    };

    let alerts = Arc::new(RateLimitedAlerts::new(
        Arc::new(TracingAlertSink),
        Duration::from_secs(config.watchdog.alert_min_interval_secs),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(
        shutdown_tx,
        Duration::from_secs(config.scheduler.shutdown_grace_secs),
    )?;

    let orchestrator = Orchestrator::new(
        lock,
        machine,
        state_store,
        collaborators,
        decision_config(&config)?,
        CycleSettings {
            cycle_interval: Duration::from_secs(config.scheduler.cycle_interval_secs),
            backoff: BackoffPolicy::new(
                Duration::from_millis(config.scheduler.backoff_initial_ms),
                Duration::from_millis(config.scheduler.backoff_max_ms),
                config.scheduler.backoff_multiplier,
            ),
            heartbeat_key: heartbeat_key(&config),
        },
        alerts,
        shutdown_rx,
    );

    match orchestrator.run().await {
        Ok(()) => Ok(()),
        Err(e @ OrchestratorError::LockContended { .. }) => {
            tracing::error!("{e}");
            std::process::exit(EXIT_LOCK_CONTENDED);
        }
        Err(e @ OrchestratorError::LockLost { .. }) => {
            tracing::error!("{e}");
            std::process::exit(EXIT_LOCK_LOST);
        }
        Err(e) => Err(e.into()),
    }
}

/// Runs the liveness watchdog until shutdown.
pub async fn watchdog(config_path: &str) -> Result<()> {
    let config = ConfigLoader::load(config_path)?;
    let pool = open_pool(&config).await?;
    let state_store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::new(pool).await?);

    let alerts = Arc::new(RateLimitedAlerts::new(
        Arc::new(TracingAlertSink),
        Duration::from_secs(config.watchdog.alert_min_interval_secs),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx, Duration::from_secs(5))?;

    Watchdog::new(
        state_store,
        state_key(&config),
        heartbeat_key(&config),
        config.watchdog.clone(),
        config.scheduler.max_consecutive_failures,
        alerts,
        shutdown_rx,
    )
    .run()
    .await
}

/// Prints the persisted snapshot and heartbeat.
pub async fn state_show(config_path: &str) -> Result<()> {
    let config = ConfigLoader::load(config_path)?;
    let pool = open_pool(&config).await?;
    let store = SqliteStateStore::new(pool).await?;

    match store.get(&state_key(&config)).await {
        Ok(Some(state)) => println!("{}", serde_json::to_string_pretty(&state)?),
        Ok(None) => println!("no persisted state"),
        Err(e) => println!("persisted state unreadable: {e}"),
    }

    match store.get_heartbeat(&heartbeat_key(&config)).await? {
        Some(beat_at) => println!("heartbeat: {beat_at}"),
        None => println!("heartbeat: never written"),
    }
    Ok(())
}

/// Deletes the persisted snapshot.
pub async fn state_clear(config_path: &str) -> Result<()> {
    let config = ConfigLoader::load(config_path)?;
    let pool = open_pool(&config).await?;
    let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::new(pool).await?);

    let machine = StateMachine::new(
        store,
        state_key(&config),
        config.scheduler.max_consecutive_failures,
    );
    machine.clear().await?;
    println!("persisted state cleared");
    Ok(())
}
