//! End-to-end control loop scenarios against in-memory stores and scripted
//! venues.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use delta_hedge_bot_orchestrator::{
    Collaborators, CycleSettings, Orchestrator, OrchestratorError,
};
use delta_hedge_core::alerts::{RateLimitedAlerts, TracingAlertSink};
use delta_hedge_core::backoff::BackoffPolicy;
use delta_hedge_core::traits::{
    CostEstimator, LegPosition, LegVenue, PriceOracle, PriceQuote,
};
use delta_hedge_engine::DecisionConfig;
use delta_hedge_lock::{DistributedLock, LockStore, MemoryLockStore};
use delta_hedge_state::{
    BotState, MemoryStateStore, StateMachine, StateStore, TradingState,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

const RESOURCE: &str = "hedge";
const STATE_KEY: &str = "hedge:state";
const HEARTBEAT_KEY: &str = "hedge:heartbeat";
const ESCALATION_THRESHOLD: u32 = 5;

/// Liquidity-side venue with a fixed position. Delta is size times price.
struct FixedLeg {
    position: Option<LegPosition>,
}

impl FixedLeg {
    fn with_size(size: Decimal) -> Self {
        Self {
            position: Some(LegPosition {
                id: "lp-1".to_string(),
                size,
            }),
        }
    }
}

#[async_trait]
impl LegVenue for FixedLeg {
    async fn fetch_positions(&self) -> Result<Vec<LegPosition>> {
        Ok(self.position.iter().cloned().collect())
    }

    async fn calculate_delta(&self, position: &LegPosition, price: Decimal) -> Result<Decimal> {
        Ok(position.size * price)
    }

    async fn is_in_range(&self, _position: &LegPosition) -> Result<bool> {
        Ok(true)
    }

    async fn open(&self, _size: Decimal) -> Result<Option<LegPosition>> {
        Err(anyhow!("liquidity leg is fixed in these scenarios"))
    }

    async fn close(&self, _position_id: &str) -> Result<Option<LegPosition>> {
        Err(anyhow!("liquidity leg is fixed in these scenarios"))
    }
}

/// Hedge-side venue whose fills can be scripted to fail. Adjustments are
/// applied as signed delta changes.
struct ScriptedHedge {
    position: Mutex<Option<LegPosition>>,
    fail_opens: AtomicBool,
    opens: AtomicU32,
}

impl ScriptedHedge {
    fn with_size(size: Decimal) -> Self {
        Self {
            position: Mutex::new(Some(LegPosition {
                id: "hedge-1".to_string(),
                size,
            })),
            fail_opens: AtomicBool::new(false),
            opens: AtomicU32::new(0),
        }
    }

    fn failing_with_size(size: Decimal) -> Self {
        let venue = Self::with_size(size);
        venue.fail_opens.store(true, Ordering::SeqCst);
        venue
    }

    fn open_count(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    fn lock_position(&self) -> std::sync::MutexGuard<'_, Option<LegPosition>> {
        self.position.lock().unwrap()
    }
}

#[async_trait]
impl LegVenue for ScriptedHedge {
    async fn fetch_positions(&self) -> Result<Vec<LegPosition>> {
        Ok(self.lock_position().iter().cloned().collect())
    }

    async fn calculate_delta(&self, position: &LegPosition, price: Decimal) -> Result<Decimal> {
        Ok(position.size * price)
    }

    async fn is_in_range(&self, _position: &LegPosition) -> Result<bool> {
        Ok(true)
    }

    async fn open(&self, size: Decimal) -> Result<Option<LegPosition>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.fail_opens.load(Ordering::SeqCst) {
            return Err(anyhow!("venue rejected the order"));
        }
        let mut slot = self.lock_position();
        let merged = match slot.take() {
            Some(existing) => LegPosition {
                id: existing.id,
                size: existing.size + size,
            },
            None => LegPosition {
                id: "hedge-1".to_string(),
                size,
            },
        };
        if merged.size.is_zero() {
            return Ok(None);
        }
        *slot = Some(merged.clone());
        Ok(Some(merged))
    }

    async fn close(&self, position_id: &str) -> Result<Option<LegPosition>> {
        let mut slot = self.lock_position();
        match slot.take() {
            Some(position) if position.id == position_id => Ok(Some(position)),
            other => {
                *slot = other;
                Ok(None)
            }
        }
    }
}

struct UnitOracle;

#[async_trait]
impl PriceOracle for UnitOracle {
    async fn get_price(&self) -> Result<PriceQuote> {
        Ok(PriceQuote {
            price: Decimal::ONE,
            confidence: Decimal::ZERO,
            publish_time: chrono::Utc::now(),
        })
    }
}

struct FreeCost;

#[async_trait]
impl CostEstimator for FreeCost {
    async fn estimate_rebalance_cost(&self) -> Result<Decimal> {
        Ok(Decimal::ZERO)
    }
}

struct Harness {
    lock_store: Arc<MemoryLockStore>,
    state_store: Arc<MemoryStateStore>,
    shutdown_tx: watch::Sender<bool>,
}

impl Harness {
    fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            lock_store: Arc::new(MemoryLockStore::new()),
            state_store: Arc::new(MemoryStateStore::new()),
            shutdown_tx,
        }
    }

    fn lock(&self, ttl: Duration, renew: Duration) -> Arc<DistributedLock> {
        Arc::new(DistributedLock::new(
            self.lock_store.clone(),
            RESOURCE,
            ttl,
            renew,
        ))
    }

    fn orchestrator(
        &self,
        lock: Arc<DistributedLock>,
        leg_a: Arc<dyn LegVenue>,
        leg_b: Arc<dyn LegVenue>,
    ) -> Orchestrator {
        let machine = StateMachine::new(
            self.state_store.clone(),
            STATE_KEY,
            ESCALATION_THRESHOLD,
        );
        Orchestrator::new(
            lock,
            machine,
            self.state_store.clone(),
            Collaborators {
                leg_a,
                leg_b,
                oracle: Arc::new(UnitOracle),
                cost: Arc::new(FreeCost),
            },
            DecisionConfig {
                drift_threshold: 0.05,
                max_out_of_range: Duration::from_secs(1800),
                max_estimated_cost: dec!(5),
                quiet_window: None,
            },
            CycleSettings {
                cycle_interval: Duration::from_millis(10),
                backoff: BackoffPolicy::new(
                    Duration::from_millis(5),
                    Duration::from_millis(20),
                    2.0,
                ),
                heartbeat_key: HEARTBEAT_KEY.to_string(),
            },
            Arc::new(RateLimitedAlerts::new(
                Arc::new(TracingAlertSink),
                Duration::from_secs(60),
            )),
            self.shutdown_tx.subscribe(),
        )
    }

    /// Polls the persisted snapshot until `predicate` holds.
    async fn wait_for_state(&self, predicate: impl Fn(&BotState) -> bool) -> BotState {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Ok(Some(state)) = self.state_store.get(STATE_KEY).await {
                if predicate(&state) {
                    return state;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for persisted state to settle"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[tokio::test]
async fn drift_trigger_rebalances_and_persists_the_fill() {
    let harness = Harness::new();
    let hedge = Arc::new(ScriptedHedge::with_size(dec!(-900)));
    let orchestrator = harness.orchestrator(
        harness.lock(Duration::from_secs(2), Duration::from_millis(200)),
        Arc::new(FixedLeg::with_size(dec!(1000))),
        hedge.clone(),
    );
    let handle = tokio::spawn(orchestrator.run());

    let rebalanced = harness
        .wait_for_state(|state| state.last_rebalance_time.is_some())
        .await;
    assert_eq!(rebalanced.leg_b_position_id.as_deref(), Some("hedge-1"));
    assert_eq!(rebalanced.consecutive_failures, 0);

    // The fill restored neutrality: +100 of offsetting exposure on a -900
    // hedge against a +1000 liquidity leg.
    let settled = harness
        .wait_for_state(|state| state.last_leg_b_delta == dec!(-1000))
        .await;
    assert_eq!(settled.current_state, TradingState::Idle);
    assert_eq!(settled.last_leg_a_delta, dec!(1000));

    harness.shutdown_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    let final_state = harness.state_store.get(STATE_KEY).await.unwrap().unwrap();
    assert_eq!(final_state.current_state, TradingState::ShuttingDown);
    assert_eq!(hedge.open_count(), 1);
}

#[tokio::test]
async fn heartbeat_is_written_every_cycle() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator(
        harness.lock(Duration::from_secs(2), Duration::from_millis(200)),
        Arc::new(FixedLeg::with_size(dec!(1000))),
        Arc::new(ScriptedHedge::with_size(dec!(-1000))),
    );
    let handle = tokio::spawn(orchestrator.run());

    harness.wait_for_state(|_| true).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(Some(_)) = harness.state_store.get_heartbeat(HEARTBEAT_KEY).await {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "heartbeat never written"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    harness.shutdown_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn repeated_dispatch_failures_escalate_and_halt_trading() {
    let harness = Harness::new();
    let hedge = Arc::new(ScriptedHedge::failing_with_size(dec!(-900)));
    let orchestrator = harness.orchestrator(
        harness.lock(Duration::from_secs(2), Duration::from_millis(200)),
        Arc::new(FixedLeg::with_size(dec!(1000))),
        hedge.clone(),
    );
    let handle = tokio::spawn(orchestrator.run());

    let escalated = harness
        .wait_for_state(|state| state.current_state == TradingState::ErrorRecovery)
        .await;
    assert_eq!(escalated.consecutive_failures, ESCALATION_THRESHOLD);
    assert!(escalated
        .last_error
        .as_deref()
        .unwrap()
        .contains("venue rejected the order"));
    assert_eq!(hedge.open_count(), ESCALATION_THRESHOLD);

    // Escalation halts dispatching; cycles keep running but do no work.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hedge.open_count(), ESCALATION_THRESHOLD);
    let still_escalated = harness.state_store.get(STATE_KEY).await.unwrap().unwrap();
    assert_eq!(still_escalated.current_state, TradingState::ErrorRecovery);
    assert_eq!(still_escalated.consecutive_failures, ESCALATION_THRESHOLD);

    harness.shutdown_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    // Shutdown from a blocked state leaves the blocked state persisted for
    // the operator.
    let final_state = harness.state_store.get(STATE_KEY).await.unwrap().unwrap();
    assert_eq!(final_state.current_state, TradingState::ErrorRecovery);
}

#[tokio::test]
async fn contended_lock_refuses_to_start() {
    let harness = Harness::new();
    harness
        .lock_store
        .try_set_if_absent(RESOURCE, "someone-else", Duration::from_secs(30))
        .await
        .unwrap();

    let orchestrator = harness.orchestrator(
        harness.lock(Duration::from_secs(2), Duration::from_millis(200)),
        Arc::new(FixedLeg::with_size(dec!(1000))),
        Arc::new(ScriptedHedge::with_size(dec!(-1000))),
    );

    let err = orchestrator.run().await.unwrap_err();
    assert!(matches!(err, OrchestratorError::LockContended { .. }));
    // Nothing was loaded or persisted.
    assert!(harness.state_store.get(STATE_KEY).await.unwrap().is_none());
}

#[tokio::test]
async fn losing_the_lock_aborts_the_loop() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator(
        harness.lock(Duration::from_millis(200), Duration::from_millis(20)),
        Arc::new(FixedLeg::with_size(dec!(1000))),
        Arc::new(ScriptedHedge::with_size(dec!(-1000))),
    );
    let handle = tokio::spawn(orchestrator.run());
    harness.wait_for_state(|_| true).await;

    // Simulate a takeover: evict the holder and seat a foreign token.
    let holder = harness
        .lock_store
        .current_holder(RESOURCE)
        .await
        .unwrap()
        .expect("lock should be held");
    assert!(harness
        .lock_store
        .compare_and_delete(RESOURCE, &holder)
        .await
        .unwrap());
    assert!(harness
        .lock_store
        .try_set_if_absent(RESOURCE, "intruder", Duration::from_secs(30))
        .await
        .unwrap());

    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(err, OrchestratorError::LockLost { .. }));
    // The intruder's record was not torn down on the way out.
    assert_eq!(
        harness.lock_store.current_holder(RESOURCE).await.unwrap(),
        Some("intruder".to_string())
    );
}

#[tokio::test]
async fn graceful_shutdown_releases_the_lock() {
    let harness = Harness::new();
    let lock = harness.lock(Duration::from_secs(2), Duration::from_millis(200));
    let orchestrator = harness.orchestrator(
        lock,
        Arc::new(FixedLeg::with_size(dec!(1000))),
        Arc::new(ScriptedHedge::with_size(dec!(-1000))),
    );
    let handle = tokio::spawn(orchestrator.run());
    harness.wait_for_state(|_| true).await;

    harness.shutdown_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    assert_eq!(
        harness.state_store.get(STATE_KEY).await.unwrap().unwrap().current_state,
        TradingState::ShuttingDown
    );
    assert_eq!(harness.lock_store.current_holder(RESOURCE).await.unwrap(), None);
}

#[tokio::test]
async fn flapping_leg_a_source_does_not_reset_the_out_of_range_clock() {
    struct UnreachableLeg;

    #[async_trait]
    impl LegVenue for UnreachableLeg {
        async fn fetch_positions(&self) -> Result<Vec<LegPosition>> {
            Err(anyhow!("position query timed out"))
        }
        async fn calculate_delta(
            &self,
            _position: &LegPosition,
            _price: Decimal,
        ) -> Result<Decimal> {
            Err(anyhow!("position query timed out"))
        }
        async fn is_in_range(&self, _position: &LegPosition) -> Result<bool> {
            Err(anyhow!("position query timed out"))
        }
        async fn open(&self, _size: Decimal) -> Result<Option<LegPosition>> {
            Err(anyhow!("position query timed out"))
        }
        async fn close(&self, _position_id: &str) -> Result<Option<LegPosition>> {
            Err(anyhow!("position query timed out"))
        }
    }

    let harness = Harness::new();
    let stamp = chrono::Utc::now() - chrono::Duration::hours(2);
    let seeded = BotState {
        out_of_range_since: Some(stamp),
        leg_a_position_id: Some("lp-1".to_string()),
        last_leg_a_delta: dec!(1000),
        ..BotState::default()
    };
    harness.state_store.set(STATE_KEY, &seeded).await.unwrap();

    let orchestrator = harness.orchestrator(
        harness.lock(Duration::from_secs(2), Duration::from_millis(200)),
        Arc::new(UnreachableLeg),
        Arc::new(ScriptedHedge::with_size(Decimal::ZERO)),
    );
    let handle = tokio::spawn(orchestrator.run());

    // The degraded fetch zeroes the observed delta, which marks the first
    // bookkeeping write of a cycle that could not read leg A.
    let degraded = harness
        .wait_for_state(|state| state.last_leg_a_delta == Decimal::ZERO)
        .await;
    assert_eq!(degraded.out_of_range_since, Some(stamp));
    assert_eq!(degraded.leg_a_position_id.as_deref(), Some("lp-1"));

    harness.shutdown_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    let final_state = harness.state_store.get(STATE_KEY).await.unwrap().unwrap();
    assert_eq!(final_state.out_of_range_since, Some(stamp));
}

#[tokio::test]
async fn prolonged_out_of_range_unwinds_the_hedge() {
    struct OutOfRangeLeg;

    #[async_trait]
    impl LegVenue for OutOfRangeLeg {
        async fn fetch_positions(&self) -> Result<Vec<LegPosition>> {
            Ok(vec![LegPosition {
                id: "lp-1".to_string(),
                size: dec!(1000),
            }])
        }
        async fn calculate_delta(
            &self,
            position: &LegPosition,
            price: Decimal,
        ) -> Result<Decimal> {
            Ok(position.size * price)
        }
        async fn is_in_range(&self, _position: &LegPosition) -> Result<bool> {
            Ok(false)
        }
        async fn open(&self, _size: Decimal) -> Result<Option<LegPosition>> {
            Err(anyhow!("liquidity leg is fixed in these scenarios"))
        }
        async fn close(&self, _position_id: &str) -> Result<Option<LegPosition>> {
            Err(anyhow!("liquidity leg is fixed in these scenarios"))
        }
    }

    let harness = Harness::new();
    // Pre-seed a snapshot whose out-of-range stamp is already ancient, so
    // the bookkeeping carries it forward and the unwind fires immediately.
    let seeded = BotState {
        out_of_range_since: Some(chrono::Utc::now() - chrono::Duration::hours(2)),
        leg_b_position_id: Some("hedge-1".to_string()),
        ..BotState::default()
    };
    harness.state_store.set(STATE_KEY, &seeded).await.unwrap();

    // Perfectly hedged, so only the out-of-range rule can trigger.
    let hedge = Arc::new(ScriptedHedge::with_size(dec!(-1000)));
    let orchestrator = harness.orchestrator(
        harness.lock(Duration::from_secs(2), Duration::from_millis(200)),
        Arc::new(OutOfRangeLeg),
        hedge.clone(),
    );
    let handle = tokio::spawn(orchestrator.run());

    let unwound = harness
        .wait_for_state(|state| state.last_rebalance_time.is_some())
        .await;
    assert_eq!(unwound.leg_b_position_id, None);
    assert!(hedge.fetch_positions().await.unwrap().is_empty());

    harness.shutdown_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
}
