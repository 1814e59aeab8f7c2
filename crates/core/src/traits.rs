//! Collaborator seams consumed by the control loop.
//!
//! The core never owns leg data; it consumes a signed delta and an in-range
//! boolean per cycle. Protocol-specific clients implement these traits and
//! are injected at the composition root.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// A position held at a venue, referenced by opaque id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegPosition {
    pub id: String,
    /// Signed size as reported by the venue.
    pub size: Decimal,
}

/// One side of the hedged position (liquidity leg or directional hedge).
#[async_trait]
pub trait LegVenue: Send + Sync {
    async fn fetch_positions(&self) -> Result<Vec<LegPosition>>;

    /// Signed exposure of `position` to the underlying at `price`.
    async fn calculate_delta(&self, position: &LegPosition, price: Decimal) -> Result<Decimal>;

    /// Whether the position's price range currently contains the market
    /// price. Always true for venues without range semantics.
    async fn is_in_range(&self, position: &LegPosition) -> Result<bool>;

    /// Opens or adjusts exposure by the signed `size`. Returns the resulting
    /// position, or `None` when the adjustment closed it entirely.
    async fn open(&self, size: Decimal) -> Result<Option<LegPosition>>;

    /// Closes the position with the given id. Returns the closed position if
    /// the venue still knew about it.
    async fn close(&self, position_id: &str) -> Result<Option<LegPosition>>;
}

/// A price observation from an oracle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceQuote {
    pub price: Decimal,
    pub confidence: Decimal,
    pub publish_time: DateTime<Utc>,
}

#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn get_price(&self) -> Result<PriceQuote>;
}

/// Estimates the execution cost of a rebalance, in quote currency.
#[async_trait]
pub trait CostEstimator: Send + Sync {
    async fn estimate_rebalance_cost(&self) -> Result<Decimal>;
}
