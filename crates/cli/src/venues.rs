//! Paper-mode collaborators for running without venue connectivity.
//!
//! Fills are simulated in memory and every position is treated as in range,
//! so the loop exercises the full decision and dispatch path with no capital
//! at risk.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use delta_hedge_core::traits::{
    CostEstimator, LegPosition, LegVenue, PriceOracle, PriceQuote,
};
use rust_decimal::Decimal;
use std::sync::Mutex;
use uuid::Uuid;

/// Simulated venue holding at most one position.
pub struct PaperLegVenue {
    name: String,
    position: Mutex<Option<LegPosition>>,
}

impl PaperLegVenue {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            position: Mutex::new(None),
        }
    }

    fn lock_position(&self) -> std::sync::MutexGuard<'_, Option<LegPosition>> {
        // A poisoned mutex means a panic elsewhere already took the process
        // down a bad path; recovering the inner value is safe here because
        // the position is a plain value with no invariants to restore.
        self.position
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl LegVenue for PaperLegVenue {
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
        let mut slot = self.lock_position();
        let merged = match slot.take() {
            Some(existing) => LegPosition {
                id: existing.id,
                size: existing.size + size,
            },
            None => LegPosition {
                id: format!("{}-{}", self.name, Uuid::new_v4()),
                size,
            },
        };
        tracing::info!(
            venue = %self.name,
            position_id = %merged.id,
            size = %merged.size,
            "paper fill"
        );
        if merged.size.is_zero() {
            return Ok(None);
        }
        *slot = Some(merged.clone());
        Ok(Some(merged))
    }

    async fn close(&self, position_id: &str) -> Result<Option<LegPosition>> {
        let mut slot = self.lock_position();
        match slot.take() {
            Some(position) if position.id == position_id => {
                tracing::info!(
                    venue = %self.name,
                    position_id,
                    "paper close"
                );
                Ok(Some(position))
            }
            other => {
                *slot = other;
                Ok(None)
            }
        }
    }
}

/// Oracle that always reports the same price with full confidence.
pub struct FixedPriceOracle {
    price: Decimal,
}

impl FixedPriceOracle {
    #[must_use]
    pub const fn new(price: Decimal) -> Self {
        Self { price }
    }
}

#[async_trait]
impl PriceOracle for FixedPriceOracle {
    async fn get_price(&self) -> Result<PriceQuote> {
        Ok(PriceQuote {
            price: self.price,
            confidence: Decimal::ZERO,
            publish_time: Utc::now(),
        })
    }
}

/// Cost estimator that quotes a constant execution cost.
pub struct FlatCostEstimator {
    cost: Decimal,
}

impl FlatCostEstimator {
    #[must_use]
    pub const fn new(cost: Decimal) -> Self {
        Self { cost }
    }
}

#[async_trait]
impl CostEstimator for FlatCostEstimator {
    async fn estimate_rebalance_cost(&self) -> Result<Decimal> {
        Ok(self.cost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn open_merges_into_existing_position() {
        let venue = PaperLegVenue::new("test");
        let first = venue.open(dec!(100)).await.unwrap().unwrap();
        let merged = venue.open(dec!(-40)).await.unwrap().unwrap();
        assert_eq!(merged.id, first.id);
        assert_eq!(merged.size, dec!(60));
    }

    #[tokio::test]
    async fn open_to_zero_closes_the_position() {
        let venue = PaperLegVenue::new("test");
        venue.open(dec!(100)).await.unwrap();
        assert!(venue.open(dec!(-100)).await.unwrap().is_none());
        assert!(venue.fetch_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn close_requires_a_matching_id() {
        let venue = PaperLegVenue::new("test");
        let position = venue.open(dec!(50)).await.unwrap().unwrap();
        assert!(venue.close("unknown").await.unwrap().is_none());
        assert!(venue.close(&position.id).await.unwrap().is_some());
        assert!(venue.fetch_positions().await.unwrap().is_empty());
    }
}
