//! Pure rebalance decision engine.
//!
//! `evaluate` maps the current snapshot and observed exposures to a decision
//! with a stable reason code. It performs no I/O and no logging, so it can be
//! exercised in tests with nothing but plain inputs; callers log and alert by
//! consuming the returned decision.

use crate::quiet::QuietWindow;
use chrono::{DateTime, Timelike, Utc};
use delta_hedge_state::BotState;
use delta_hedge_state::TradingState;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Stable, testable reason codes carried by every decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    NotIdle,
    QuietHours,
    GasTooHigh,
    OutOfRangeTooLong,
    DeltaDrift,
    WithinThreshold,
}

impl DecisionReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotIdle => "not_idle",
            Self::QuietHours => "quiet_hours",
            Self::GasTooHigh => "gas_too_high",
            Self::OutOfRangeTooLong => "out_of_range_too_long",
            Self::DeltaDrift => "delta_drift",
            Self::WithinThreshold => "within_threshold",
        }
    }
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single evaluation. Produced fresh each cycle, never
/// persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebalanceDecision {
    pub should_rebalance: bool,
    pub reason: DecisionReason,
    /// Net delta across both legs at evaluation time.
    pub current_delta: Decimal,
    /// Signed adjustment: positive means more offsetting exposure is needed,
    /// negative means excess offsetting exposure should be reduced.
    pub size_to_adjust: Decimal,
    pub blocked: bool,
    pub block_reason: Option<String>,
}

impl RebalanceDecision {
    fn blocked(reason: DecisionReason, current_delta: Decimal, block_reason: String) -> Self {
        Self {
            should_rebalance: false,
            reason,
            current_delta,
            size_to_adjust: Decimal::ZERO,
            blocked: true,
            block_reason: Some(block_reason),
        }
    }

    fn triggered(reason: DecisionReason, current_delta: Decimal, size_to_adjust: Decimal) -> Self {
        Self {
            should_rebalance: true,
            reason,
            current_delta,
            size_to_adjust,
            blocked: false,
            block_reason: None,
        }
    }

    fn no_action(current_delta: Decimal) -> Self {
        Self {
            should_rebalance: false,
            reason: DecisionReason::WithinThreshold,
            current_delta,
            size_to_adjust: Decimal::ZERO,
            blocked: false,
            block_reason: None,
        }
    }
}

/// Observed exposures for one evaluation.
#[derive(Debug, Clone)]
pub struct DecisionInputs<'a> {
    pub state: &'a BotState,
    pub leg_a_delta: Decimal,
    pub leg_b_delta: Decimal,
    pub estimated_cost: Decimal,
    pub leg_a_in_range: bool,
}

/// Thresholds the engine evaluates against.
#[derive(Debug, Clone)]
pub struct DecisionConfig {
    /// Net drift, as a fraction of gross leg A exposure, that triggers a
    /// rebalance.
    pub drift_threshold: f64,
    /// How long leg A may sit out of range before the hedge is fully
    /// unwound.
    pub max_out_of_range: Duration,
    /// Estimated execution cost ceiling.
    pub max_estimated_cost: Decimal,
    pub quiet_window: Option<QuietWindow>,
}

/// Evaluates the rebalance decision for one cycle.
///
/// Blocking checks run first in fixed precedence (not idle, quiet hours,
/// cost ceiling); a prolonged out-of-range condition takes priority over
/// drift and fully unwinds the hedge leg.
#[must_use]
pub fn evaluate(
    inputs: &DecisionInputs<'_>,
    config: &DecisionConfig,
    now: DateTime<Utc>,
) -> RebalanceDecision {
    let net_delta = inputs.leg_a_delta + inputs.leg_b_delta;
    // Gross floor of 1 guards the divide when leg A is empty.
    let gross = inputs.leg_a_delta.abs().max(Decimal::ONE);
    let drift_fraction: f64 = (net_delta.abs() / gross).try_into().unwrap_or(0.0);

    if inputs.state.current_state != TradingState::Idle {
        return RebalanceDecision::blocked(
            DecisionReason::NotIdle,
            net_delta,
            format!("current state is {}", inputs.state.current_state),
        );
    }

    if let Some(window) = config.quiet_window {
        if window.contains(now.hour()) {
            return RebalanceDecision::blocked(
                DecisionReason::QuietHours,
                net_delta,
                format!(
                    "inside quiet window {:02}:00-{:02}:00 UTC",
                    window.start_hour, window.end_hour
                ),
            );
        }
    }

    if inputs.estimated_cost > config.max_estimated_cost {
        return RebalanceDecision::blocked(
            DecisionReason::GasTooHigh,
            net_delta,
            format!(
                "estimated cost {} exceeds ceiling {}",
                inputs.estimated_cost, config.max_estimated_cost
            ),
        );
    }

    if !inputs.leg_a_in_range {
        if let Some(since) = inputs.state.out_of_range_since {
            let elapsed = now.signed_duration_since(since);
            if elapsed.to_std().unwrap_or_default() > config.max_out_of_range {
                // Full hedge unwind, regardless of drift magnitude.
                return RebalanceDecision::triggered(
                    DecisionReason::OutOfRangeTooLong,
                    net_delta,
                    -inputs.leg_b_delta,
                );
            }
        }
    }

    if drift_fraction >= config.drift_threshold {
        return RebalanceDecision::triggered(DecisionReason::DeltaDrift, net_delta, net_delta);
    }

    RebalanceDecision::no_action(net_delta)
}
