//! SQLite-backed state store.
//!
//! Snapshots are stored as whole JSON documents and replaced atomically by
//! upsert, matching the all-or-nothing transition contract.

use crate::snapshot::BotState;
use crate::store::{StateError, StateStore};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::SqlitePool;

#[derive(Clone)]
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    /// Creates the store and its schema if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if a schema statement fails.
    pub async fn new(pool: SqlitePool) -> Result<Self, StateError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS bot_snapshots (
                key           TEXT PRIMARY KEY,
                snapshot_json TEXT NOT NULL,
                updated_at    INTEGER NOT NULL
            )
            ",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS heartbeats (
                key     TEXT PRIMARY KEY,
                beat_at INTEGER NOT NULL
            )
            ",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn get(&self, key: &str) -> Result<Option<BotState>, StateError> {
        let row = sqlx::query_as::<_, (String,)>(
            "SELECT snapshot_json FROM bot_snapshots WHERE key = ?1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((json,)) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, state: &BotState) -> Result<(), StateError> {
        let json = serde_json::to_string(state)?;
        sqlx::query(
            r"
            INSERT INTO bot_snapshots (key, snapshot_json, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                snapshot_json = excluded.snapshot_json,
                updated_at = excluded.updated_at
            ",
        )
        .bind(key)
        .bind(json)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StateError> {
        sqlx::query("DELETE FROM bot_snapshots WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_heartbeat(&self, key: &str) -> Result<Option<DateTime<Utc>>, StateError> {
        let row = sqlx::query_as::<_, (i64,)>("SELECT beat_at FROM heartbeats WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.and_then(|(millis,)| Utc.timestamp_millis_opt(millis).single()))
    }

    async fn set_heartbeat(&self, key: &str, at: DateTime<Utc>) -> Result<(), StateError> {
        sqlx::query(
            r"
            INSERT INTO heartbeats (key, beat_at)
            VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET beat_at = excluded.beat_at
            ",
        )
        .bind(key)
        .bind(at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::TradingState;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> SqliteStateStore {
        // A single connection: every pooled connection to :memory: would
        // otherwise be a distinct database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqliteStateStore::new(pool).await.unwrap()
    }

    #[tokio::test]
    async fn snapshot_round_trips_through_json_column() {
        let store = store().await;
        let state = BotState {
            current_state: TradingState::Rebalancing,
            leg_b_position_id: Some("hedge-1".to_string()),
            consecutive_failures: 3,
            last_error: Some("venue timeout".to_string()),
            ..BotState::default()
        };

        store.set("bot", &state).await.unwrap();
        assert_eq!(store.get("bot").await.unwrap(), Some(state));
    }

    #[tokio::test]
    async fn corrupt_snapshot_surfaces_as_decode_error() {
        let store = store().await;
        sqlx::query(
            "INSERT INTO bot_snapshots (key, snapshot_json, updated_at) VALUES ('bot', '{not json', 0)",
        )
        .execute(&store.pool)
        .await
        .unwrap();

        assert!(matches!(
            store.get("bot").await,
            Err(StateError::Corrupt(_))
        ));
    }

    #[tokio::test]
    async fn heartbeat_upsert_keeps_latest() {
        let store = store().await;
        let first = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let second = first + chrono::Duration::seconds(60);

        store.set_heartbeat("bot", first).await.unwrap();
        store.set_heartbeat("bot", second).await.unwrap();
        assert_eq!(store.get_heartbeat("bot").await.unwrap(), Some(second));
    }
}
