//! Lock store abstraction and the in-memory reference implementation.
//!
//! Correctness rests entirely on three atomic conditional operations: a
//! holder may create a record only if no live record exists, and may delete
//! or extend it only while the stored token is still its own.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;

/// Errors from the lock layer.
#[derive(Debug, Error)]
pub enum LockError {
    /// Ownership was lost to another process. Fatal: the holder must stop
    /// mutating shared state immediately.
    #[error("lock ownership lost for resource '{resource}'")]
    Lost { resource: String },

    /// The backing store failed.
    #[error("lock store error: {0}")]
    Store(String),
}

impl From<sqlx::Error> for LockError {
    fn from(e: sqlx::Error) -> Self {
        Self::Store(e.to_string())
    }
}

/// Shared key-value store with atomic conditional operations over lease
/// records.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Sets `key` to `token` with the given TTL, only if no unexpired record
    /// exists. Returns whether the set happened.
    async fn try_set_if_absent(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockError>;

    /// Deletes `key` only if its stored token equals `token`. Returns whether
    /// the delete happened.
    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool, LockError>;

    /// Re-arms the TTL only if the stored token equals `token` and the record
    /// has not expired. Returns whether the extension happened.
    async fn compare_and_extend(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockError>;

    /// Current unexpired holder token, if any. Diagnostics only.
    async fn current_holder(&self, key: &str) -> Result<Option<String>, LockError>;
}

/// In-process lock store for tests and single-process runs.
///
/// Expired records are dropped lazily, on the next operation that touches
/// their key.
#[derive(Default)]
pub struct MemoryLockStore {
    records: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLockStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_set_if_absent(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let mut records = self.records.lock().await;
        let now = Instant::now();
        if let Some((_, expires_at)) = records.get(key) {
            if *expires_at > now {
                return Ok(false);
            }
        }
        records.insert(key.to_string(), (token.to_string(), now + ttl));
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let mut records = self.records.lock().await;
        match records.get(key) {
            Some((stored, _)) if stored == token => {
                records.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_extend(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let mut records = self.records.lock().await;
        let now = Instant::now();
        match records.get_mut(key) {
            Some((stored, expires_at)) if stored == token && *expires_at > now => {
                *expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn current_holder(&self, key: &str) -> Result<Option<String>, LockError> {
        let records = self.records.lock().await;
        Ok(records
            .get(key)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(token, _)| token.clone()))
    }
}
