//! State store abstraction and the in-memory reference implementation.

use crate::snapshot::BotState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;

/// Errors from the state persistence layer.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("state store error: {0}")]
    Store(String),

    #[error("state snapshot could not be decoded: {0}")]
    Corrupt(#[from] serde_json::Error),
}

impl From<sqlx::Error> for StateError {
    fn from(e: sqlx::Error) -> Self {
        Self::Store(e.to_string())
    }
}

/// Keyed snapshot persistence plus the controller heartbeat.
///
/// The heartbeat lives in the same store so the watchdog needs exactly one
/// collaborator to observe liveness and state.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<BotState>, StateError>;
    async fn set(&self, key: &str, state: &BotState) -> Result<(), StateError>;
    async fn delete(&self, key: &str) -> Result<(), StateError>;

    async fn get_heartbeat(&self, key: &str) -> Result<Option<DateTime<Utc>>, StateError>;
    async fn set_heartbeat(&self, key: &str, at: DateTime<Utc>) -> Result<(), StateError>;
}

/// In-process state store for tests and single-process runs.
#[derive(Default)]
pub struct MemoryStateStore {
    snapshots: Mutex<HashMap<String, BotState>>,
    heartbeats: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl MemoryStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<BotState>, StateError> {
        Ok(self.snapshots.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, state: &BotState) -> Result<(), StateError> {
        self.snapshots
            .lock()
            .await
            .insert(key.to_string(), state.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StateError> {
        self.snapshots.lock().await.remove(key);
        Ok(())
    }

    async fn get_heartbeat(&self, key: &str) -> Result<Option<DateTime<Utc>>, StateError> {
        Ok(self.heartbeats.lock().await.get(key).copied())
    }

    async fn set_heartbeat(&self, key: &str, at: DateTime<Utc>) -> Result<(), StateError> {
        self.heartbeats.lock().await.insert(key.to_string(), at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::TradingState;

    #[tokio::test]
    async fn set_then_get_round_trips_snapshot() {
        let store = MemoryStateStore::new();
        let state = BotState {
            current_state: TradingState::Hedging,
            consecutive_failures: 2,
            ..BotState::default()
        };

        store.set("bot", &state).await.unwrap();
        assert_eq!(store.get("bot").await.unwrap(), Some(state));
    }

    #[tokio::test]
    async fn delete_removes_snapshot() {
        let store = MemoryStateStore::new();
        store.set("bot", &BotState::default()).await.unwrap();
        store.delete("bot").await.unwrap();
        assert_eq!(store.get("bot").await.unwrap(), None);
    }

    #[tokio::test]
    async fn heartbeat_is_keyed_independently() {
        let store = MemoryStateStore::new();
        let at = Utc::now();
        store.set_heartbeat("bot", at).await.unwrap();

        assert_eq!(store.get_heartbeat("bot").await.unwrap(), Some(at));
        assert_eq!(store.get("bot").await.unwrap(), None);
    }
}
