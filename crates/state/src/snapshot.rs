use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Named operating states of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradingState {
    Idle,
    OpeningLegA,
    Hedging,
    Rebalancing,
    ClosingLegA,
    ClosingHedge,
    ErrorRecovery,
    ShuttingDown,
}

impl TradingState {
    /// False iff the state blocks all cycle work until external
    /// intervention.
    #[must_use]
    pub const fn can_operate(self) -> bool {
        !matches!(self, Self::ErrorRecovery | Self::ShuttingDown)
    }
}

impl fmt::Display for TradingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "IDLE",
            Self::OpeningLegA => "OPENING_LEG_A",
            Self::Hedging => "HEDGING",
            Self::Rebalancing => "REBALANCING",
            Self::ClosingLegA => "CLOSING_LEG_A",
            Self::ClosingHedge => "CLOSING_HEDGE",
            Self::ErrorRecovery => "ERROR_RECOVERY",
            Self::ShuttingDown => "SHUTTING_DOWN",
        };
        f.write_str(name)
    }
}

/// Persisted operating snapshot.
///
/// Always replaced atomically as a whole; partial field updates outside a
/// full transition are disallowed. Cross-process consistency is delegated to
/// the distributed lock, not to the store's update semantics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotState {
    pub current_state: TradingState,
    pub leg_a_position_id: Option<String>,
    pub leg_b_position_id: Option<String>,
    pub last_leg_a_delta: Decimal,
    pub last_leg_b_delta: Decimal,
    pub last_rebalance_time: Option<DateTime<Utc>>,
    pub out_of_range_since: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl Default for BotState {
    fn default() -> Self {
        Self {
            current_state: TradingState::Idle,
            leg_a_position_id: None,
            leg_b_position_id: None,
            last_leg_a_delta: Decimal::ZERO,
            last_leg_b_delta: Decimal::ZERO,
            last_rebalance_time: None,
            out_of_range_since: None,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

/// Partial update applied during a transition. `None` leaves the field
/// unchanged; the nested `Option` on nullable fields distinguishes "set to
/// null" from "leave alone".
#[derive(Debug, Clone, Default)]
pub struct StateUpdates {
    pub leg_a_position_id: Option<Option<String>>,
    pub leg_b_position_id: Option<Option<String>>,
    pub last_leg_a_delta: Option<Decimal>,
    pub last_leg_b_delta: Option<Decimal>,
    pub last_rebalance_time: Option<DateTime<Utc>>,
    pub out_of_range_since: Option<Option<DateTime<Utc>>>,
    pub consecutive_failures: Option<u32>,
    pub last_error: Option<Option<String>>,
}

impl BotState {
    /// Builds the snapshot that a transition to `new_state` with `updates`
    /// produces, leaving `self` untouched.
    #[must_use]
    pub fn apply(&self, new_state: TradingState, updates: StateUpdates) -> Self {
        let mut next = self.clone();
        next.current_state = new_state;
        if let Some(id) = updates.leg_a_position_id {
            next.leg_a_position_id = id;
        }
        if let Some(id) = updates.leg_b_position_id {
            next.leg_b_position_id = id;
        }
        if let Some(delta) = updates.last_leg_a_delta {
            next.last_leg_a_delta = delta;
        }
        if let Some(delta) = updates.last_leg_b_delta {
            next.last_leg_b_delta = delta;
        }
        if let Some(at) = updates.last_rebalance_time {
            next.last_rebalance_time = Some(at);
        }
        if let Some(since) = updates.out_of_range_since {
            next.out_of_range_since = since;
        }
        if let Some(count) = updates.consecutive_failures {
            next.consecutive_failures = count;
        }
        if let Some(error) = updates.last_error {
            next.last_error = error;
        }
        next
    }
}
