//! The control loop.
//!
//! A single sequential cycle scheduler: cycles never overlap, and the next
//! cycle does not begin until the previous cycle and its post-cycle sleep
//! have completed. Collaborator failures degrade the cycle's inputs; only an
//! error that escapes the whole cycle body counts as a cycle failure.

use crate::error::OrchestratorError;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use delta_hedge_core::alerts::{AlertKind, RateLimitedAlerts};
use delta_hedge_core::backoff::BackoffPolicy;
use delta_hedge_core::traits::{CostEstimator, LegVenue, PriceOracle};
use delta_hedge_engine::{evaluate, DecisionConfig, DecisionInputs, DecisionReason};
use delta_hedge_lock::DistributedLock;
use delta_hedge_state::{BotState, StateMachine, StateStore, StateUpdates, TradingState};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// External collaborators the loop consumes.
///
/// Leg A is the liquidity-style position with a price range; leg B is the
/// directional hedge.
pub struct Collaborators {
    pub leg_a: Arc<dyn LegVenue>,
    pub leg_b: Arc<dyn LegVenue>,
    pub oracle: Arc<dyn PriceOracle>,
    pub cost: Arc<dyn CostEstimator>,
}

/// Pacing and identity settings for the loop.
pub struct CycleSettings {
    /// Target wall-clock interval between cycle starts.
    pub cycle_interval: Duration,
    /// Delay source after an escaped cycle error.
    pub backoff: BackoffPolicy,
    /// Store key the heartbeat timestamp is written to.
    pub heartbeat_key: String,
}

/// Everything observed from collaborators in one cycle, already degraded
/// per-source.
struct Observation {
    leg_a_delta: Decimal,
    leg_b_delta: Decimal,
    /// `None` when the range status could not be read this cycle.
    leg_a_in_range: Option<bool>,
    leg_a_position_id: Option<String>,
    leg_b_position_id: Option<String>,
    estimated_cost: Decimal,
}

pub struct Orchestrator {
    lock: Arc<DistributedLock>,
    machine: StateMachine,
    store: Arc<dyn StateStore>,
    collaborators: Collaborators,
    decision_config: DecisionConfig,
    settings: CycleSettings,
    alerts: Arc<RateLimitedAlerts>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        lock: Arc<DistributedLock>,
        machine: StateMachine,
        store: Arc<dyn StateStore>,
        collaborators: Collaborators,
        decision_config: DecisionConfig,
        settings: CycleSettings,
        alerts: Arc<RateLimitedAlerts>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            lock,
            machine,
            store,
            collaborators,
            decision_config,
            settings,
            alerts,
            shutdown_rx,
        }
    }

    /// Acquires the lock, loads state, and runs the cycle loop until
    /// shutdown or a fatal condition.
    ///
    /// # Errors
    ///
    /// `LockContended` if another instance is active, `LockLost` if
    /// ownership is lost mid-run, or a state error if the snapshot cannot be
    /// persisted.
    pub async fn run(mut self) -> Result<(), OrchestratorError> {
        if !self.lock.acquire().await? {
            return Err(OrchestratorError::LockContended {
                resource: self.lock.resource().to_string(),
            });
        }
        let mut lost_rx = self.lock.lost();

        let mut state = self.machine.load().await;
        if state.current_state != TradingState::Idle {
            tracing::warn!(
                state = %state.current_state,
                "resuming from a non-idle persisted state"
            );
        }
        tracing::info!(state = %state.current_state, "orchestrator started");

        let outcome = self.control_loop(&mut state, &mut lost_rx).await;
        match outcome {
            Ok(()) => {
                if StateMachine::can_operate(&state) {
                    self.machine
                        .transition(&state, TradingState::ShuttingDown, StateUpdates::default())
                        .await?;
                }
                self.lock.release().await?;
                tracing::info!("orchestrator stopped");
                Ok(())
            }
            Err(e) => {
                if matches!(e, OrchestratorError::LockLost { .. }) {
                    // The record is no longer ours; there is nothing to
                    // release.
                    self.alerts.send(AlertKind::LockLost, &e.to_string()).await;
                } else {
                    let _ = self.lock.release().await;
                }
                Err(e)
            }
        }
    }

    async fn control_loop(
        &mut self,
        state: &mut BotState,
        lost_rx: &mut watch::Receiver<bool>,
    ) -> Result<(), OrchestratorError> {
        loop {
            if *self.shutdown_rx.borrow() {
                tracing::info!("shutdown requested, leaving cycle loop");
                return Ok(());
            }
            if *lost_rx.borrow() {
                return Err(OrchestratorError::LockLost {
                    resource: self.lock.resource().to_string(),
                });
            }

            let cycle_start = Instant::now();
            match self.run_cycle(state).await {
                Ok(()) => {
                    *state = self.machine.record_success(state).await?;
                    self.settings.backoff.reset();
                    let wait = self
                        .settings
                        .cycle_interval
                        .saturating_sub(cycle_start.elapsed());
                    self.pause(wait, lost_rx).await;
                }
                Err(e) => {
                    tracing::warn!("cycle failed: {e:#}");
                    *state = self.machine.record_failure(state, &format!("{e:#}")).await?;
                    if state.current_state == TradingState::ErrorRecovery {
                        self.alerts
                            .send(
                                AlertKind::ErrorRecovery,
                                &format!(
                                    "escalated to error recovery after {} consecutive failures: {e:#}",
                                    state.consecutive_failures
                                ),
                            )
                            .await;
                    }
                    let delay = self.settings.backoff.next_delay();
                    tracing::info!(?delay, "backing off before next cycle");
                    self.pause(delay, lost_rx).await;
                }
            }
        }
    }

    /// Sleeps, waking early on shutdown or lock loss.
    async fn pause(&self, duration: Duration, lost_rx: &mut watch::Receiver<bool>) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            () = tokio::time::sleep(duration) => {}
            _ = shutdown_rx.changed() => {}
            _ = lost_rx.changed() => {}
        }
    }

    /// One cycle: heartbeat, observe, decide, dispatch.
    ///
    /// Collaborator errors are caught per source and degrade the inputs; an
    /// error returned from here is an escaped cycle failure and is counted
    /// by the caller.
    async fn run_cycle(&self, state: &mut BotState) -> Result<()> {
        if let Err(e) = self
            .store
            .set_heartbeat(&self.settings.heartbeat_key, Utc::now())
            .await
        {
            tracing::warn!("heartbeat write failed: {e}");
        }

        if !StateMachine::can_operate(state) {
            tracing::debug!(state = %state.current_state, "state blocks cycle work, skipping");
            return Ok(());
        }

        let now = Utc::now();
        let observed = self.observe(state).await;
        let out_of_range_since = next_out_of_range_since(state, &observed, now);

        *state = self
            .machine
            .transition(
                state,
                state.current_state,
                StateUpdates {
                    leg_a_position_id: Some(observed.leg_a_position_id.clone()),
                    leg_b_position_id: Some(observed.leg_b_position_id.clone()),
                    last_leg_a_delta: Some(observed.leg_a_delta),
                    last_leg_b_delta: Some(observed.leg_b_delta),
                    out_of_range_since: Some(out_of_range_since),
                    ..StateUpdates::default()
                },
            )
            .await?;

        let decision = evaluate(
            &DecisionInputs {
                state,
                leg_a_delta: observed.leg_a_delta,
                leg_b_delta: observed.leg_b_delta,
                estimated_cost: observed.estimated_cost,
                // An unknown range reading must not trigger the unwind; the
                // carried stamp means the clock keeps running regardless.
                leg_a_in_range: observed.leg_a_in_range.unwrap_or(true),
            },
            &self.decision_config,
            now,
        );

        if decision.blocked {
            tracing::debug!(
                reason = %decision.reason,
                block_reason = ?decision.block_reason,
                "decision blocked"
            );
            return Ok(());
        }
        if !decision.should_rebalance {
            tracing::debug!(delta = %decision.current_delta, "within threshold, no action");
            return Ok(());
        }

        tracing::info!(
            reason = %decision.reason,
            delta = %decision.current_delta,
            size = %decision.size_to_adjust,
            "rebalance triggered"
        );

        *state = self
            .machine
            .transition(state, TradingState::Rebalancing, StateUpdates::default())
            .await?;

        match self.dispatch(decision.reason, decision.size_to_adjust, state).await {
            Ok(hedge_id) => {
                *state = self
                    .machine
                    .transition(
                        state,
                        TradingState::Idle,
                        StateUpdates {
                            leg_b_position_id: Some(hedge_id),
                            last_rebalance_time: Some(Utc::now()),
                            ..StateUpdates::default()
                        },
                    )
                    .await?;
                Ok(())
            }
            Err(e) => {
                self.alerts
                    .send(AlertKind::DispatchFailed, &format!("rebalance dispatch failed: {e:#}"))
                    .await;
                // Back to IDLE so the next cycle re-evaluates from scratch
                // instead of wedging in REBALANCING.
                *state = self
                    .machine
                    .transition(state, TradingState::Idle, StateUpdates::default())
                    .await?;
                Err(e)
            }
        }
    }

    /// Fetches each exposure source independently; a failed source degrades
    /// to a zero/partial value rather than aborting the cycle.
    async fn observe(&self, state: &BotState) -> Observation {
        let price = match self.collaborators.oracle.get_price().await {
            Ok(quote) => Some(quote.price),
            Err(e) => {
                tracing::warn!("price oracle unavailable: {e:#}");
                None
            }
        };

        let (leg_a_delta, leg_a_in_range, leg_a_position_id) = match self
            .collaborators
            .leg_a
            .fetch_positions()
            .await
        {
            Ok(positions) => match positions.first() {
                Some(position) => {
                    let delta = match price {
                        Some(price) => self
                            .leg_delta(&self.collaborators.leg_a, position, price, "leg A")
                            .await,
                        None => Decimal::ZERO,
                    };
                    let in_range = match self.collaborators.leg_a.is_in_range(position).await {
                        Ok(in_range) => Some(in_range),
                        Err(e) => {
                            tracing::warn!("leg A range check failed: {e:#}");
                            None
                        }
                    };
                    (delta, in_range, Some(position.id.clone()))
                }
                None => (Decimal::ZERO, Some(true), None),
            },
            Err(e) => {
                tracing::warn!("leg A fetch failed: {e:#}");
                (Decimal::ZERO, None, state.leg_a_position_id.clone())
            }
        };

        let (leg_b_delta, leg_b_position_id) =
            match self.collaborators.leg_b.fetch_positions().await {
                Ok(positions) => match positions.first() {
                    Some(position) => {
                        let delta = match price {
                            Some(price) => self
                                .leg_delta(&self.collaborators.leg_b, position, price, "leg B")
                                .await,
                            None => Decimal::ZERO,
                        };
                        (delta, Some(position.id.clone()))
                    }
                    None => (Decimal::ZERO, None),
                },
                Err(e) => {
                    tracing::warn!("leg B fetch failed: {e:#}");
                    (Decimal::ZERO, state.leg_b_position_id.clone())
                }
            };

        let estimated_cost = match self.collaborators.cost.estimate_rebalance_cost().await {
            Ok(cost) => cost,
            Err(e) => {
                tracing::warn!("cost estimate unavailable: {e:#}");
                Decimal::ZERO
            }
        };

        Observation {
            leg_a_delta,
            leg_b_delta,
            leg_a_in_range,
            leg_a_position_id,
            leg_b_position_id,
            estimated_cost,
        }
    }

    async fn leg_delta(
        &self,
        venue: &Arc<dyn LegVenue>,
        position: &delta_hedge_core::traits::LegPosition,
        price: Decimal,
        label: &str,
    ) -> Decimal {
        match venue.calculate_delta(position, price).await {
            Ok(delta) => delta,
            Err(e) => {
                tracing::warn!("{label} delta calculation failed: {e:#}");
                Decimal::ZERO
            }
        }
    }

    /// Sends the triggered adjustment to the hedge venue. Returns the
    /// resulting hedge position id.
    async fn dispatch(
        &self,
        reason: DecisionReason,
        size: Decimal,
        state: &BotState,
    ) -> Result<Option<String>> {
        match reason {
            DecisionReason::OutOfRangeTooLong => {
                if let Some(ref id) = state.leg_b_position_id {
                    let closed = self
                        .collaborators
                        .leg_b
                        .close(id)
                        .await
                        .context("closing hedge leg")?;
                    tracing::info!(position = %id, closed = closed.is_some(), "hedge unwound");
                    Ok(None)
                } else {
                    // No live hedge position; apply the signed unwind size
                    // directly.
                    let position = self
                        .collaborators
                        .leg_b
                        .open(size)
                        .await
                        .context("unwinding hedge exposure")?;
                    Ok(position.map(|p| p.id))
                }
            }
            DecisionReason::DeltaDrift => {
                // A positive size means the hedge is short of offsetting
                // exposure; the venue takes a signed delta adjustment, so the
                // hedge leg moves by the negated net.
                let position = self
                    .collaborators
                    .leg_b
                    .open(-size)
                    .await
                    .context("adjusting hedge exposure")?;
                Ok(position.map(|p| p.id))
            }
            // Blocked and no-action reasons never reach dispatch.
            _ => Ok(state.leg_b_position_id.clone()),
        }
    }
}

/// Out-of-range bookkeeping: stamp when the leg first leaves range, keep the
/// stamp while it stays out, clear it the moment it is confirmed back in
/// range. An unreadable range status carries the stamp forward unchanged, so
/// a flapping source cannot keep resetting the clock.
fn next_out_of_range_since(
    state: &BotState,
    observed: &Observation,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if observed.leg_a_position_id.is_none() {
        return None;
    }
    match observed.leg_a_in_range {
        Some(true) => None,
        Some(false) => state.out_of_range_since.or(Some(now)),
        None => state.out_of_range_since,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn observation(in_range: Option<bool>, with_position: bool) -> Observation {
        Observation {
            leg_a_delta: dec!(1000),
            leg_b_delta: dec!(-1000),
            leg_a_in_range: in_range,
            leg_a_position_id: with_position.then(|| "lp-1".to_string()),
            leg_b_position_id: None,
            estimated_cost: Decimal::ZERO,
        }
    }

    #[test]
    fn out_of_range_stamp_is_set_once_and_held() {
        let now = Utc::now();
        let mut state = BotState::default();

        let stamped = next_out_of_range_since(&state, &observation(Some(false), true), now);
        assert_eq!(stamped, Some(now));

        state.out_of_range_since = stamped;
        let later = now + chrono::Duration::minutes(10);
        let held = next_out_of_range_since(&state, &observation(Some(false), true), later);
        assert_eq!(held, Some(now));
    }

    #[test]
    fn out_of_range_stamp_clears_when_back_in_range() {
        let now = Utc::now();
        let state = BotState {
            out_of_range_since: Some(now - chrono::Duration::hours(1)),
            ..BotState::default()
        };
        assert_eq!(
            next_out_of_range_since(&state, &observation(Some(true), true), now),
            None
        );
    }

    #[test]
    fn unreadable_range_status_carries_the_stamp_forward() {
        let now = Utc::now();
        let stamp = now - chrono::Duration::hours(2);
        let state = BotState {
            out_of_range_since: Some(stamp),
            leg_a_position_id: Some("lp-1".to_string()),
            ..BotState::default()
        };

        assert_eq!(
            next_out_of_range_since(&state, &observation(None, true), now),
            Some(stamp)
        );
        // And a degraded cycle never starts the clock on its own.
        assert_eq!(
            next_out_of_range_since(&BotState::default(), &observation(None, true), now),
            None
        );
    }

    #[test]
    fn no_position_means_no_out_of_range_tracking() {
        let now = Utc::now();
        let state = BotState::default();
        assert_eq!(
            next_out_of_range_since(&state, &observation(Some(false), false), now),
            None
        );
    }
}
