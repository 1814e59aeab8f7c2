//! SQLite-backed lock store.
//!
//! Each conditional primitive is a single SQL statement whose WHERE clause
//! carries the token and expiry predicate, so the database provides the
//! atomicity.

use crate::store::{LockError, LockStore};
use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use std::time::Duration;

/// Lock store backed by a shared `SQLite` database.
#[derive(Clone)]
pub struct SqliteLockStore {
    pool: SqlitePool,
}

impl SqliteLockStore {
    /// Creates the store and its schema if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema statement fails.
    pub async fn new(pool: SqlitePool) -> Result<Self, LockError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS lock_records (
                key        TEXT PRIMARY KEY,
                token      TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            )
            ",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    fn now_millis() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn expiry_millis(ttl: Duration) -> i64 {
        Self::now_millis() + ttl.as_millis() as i64
    }
}

#[async_trait]
impl LockStore for SqliteLockStore {
    async fn try_set_if_absent(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        // The upsert only replaces a record whose lease has lapsed.
        let result = sqlx::query(
            r"
            INSERT INTO lock_records (key, token, expires_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                token = excluded.token,
                expires_at = excluded.expires_at
            WHERE lock_records.expires_at <= ?4
            ",
        )
        .bind(key)
        .bind(token)
        .bind(Self::expiry_millis(ttl))
        .bind(Self::now_millis())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let result = sqlx::query("DELETE FROM lock_records WHERE key = ?1 AND token = ?2")
            .bind(key)
            .bind(token)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn compare_and_extend(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let result = sqlx::query(
            r"
            UPDATE lock_records
            SET expires_at = ?3
            WHERE key = ?1 AND token = ?2 AND expires_at > ?4
            ",
        )
        .bind(key)
        .bind(token)
        .bind(Self::expiry_millis(ttl))
        .bind(Self::now_millis())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn current_holder(&self, key: &str) -> Result<Option<String>, LockError> {
        let row = sqlx::query_as::<_, (String,)>(
            "SELECT token FROM lock_records WHERE key = ?1 AND expires_at > ?2",
        )
        .bind(key)
        .bind(Self::now_millis())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(token,)| token))
    }
}
