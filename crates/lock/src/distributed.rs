//! Lease-based distributed lock with background renewal.
//!
//! At most one process may be the active controller for a resource name,
//! across restarts and hosts. Losing ownership mid-run is fatal: two live
//! controllers acting on the same external position is a correctness
//! violation, so the loss is published to the owner rather than retried.

use crate::store::{LockError, LockStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Cross-process mutual exclusion over a named resource.
pub struct DistributedLock {
    store: Arc<dyn LockStore>,
    resource: String,
    token: String,
    ttl: Duration,
    renew_interval: Duration,
    held: Arc<AtomicBool>,
    lost_tx: watch::Sender<bool>,
    lost_rx: watch::Receiver<bool>,
    renew_task: Mutex<Option<JoinHandle<()>>>,
}

impl DistributedLock {
    /// Creates an unacquired lock with a fresh holder token.
    ///
    /// The token combines pid, timestamp, and a random suffix so that no two
    /// process instances can ever present the same value.
    #[must_use]
    pub fn new(
        store: Arc<dyn LockStore>,
        resource: impl Into<String>,
        ttl: Duration,
        renew_interval: Duration,
    ) -> Self {
        let token = format!(
            "{}-{}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_millis(),
            Uuid::new_v4()
        );
        let (lost_tx, lost_rx) = watch::channel(false);
        Self {
            store,
            resource: resource.into(),
            token,
            ttl,
            renew_interval,
            held: Arc::new(AtomicBool::new(false)),
            lost_tx,
            lost_rx,
            renew_task: Mutex::new(None),
        }
    }

    /// Attempts to take the lease. On success the background renewal task is
    /// started and `true` is returned; `false` means another live holder
    /// exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock store fails.
    pub async fn acquire(&self) -> Result<bool, LockError> {
        let acquired = self
            .store
            .try_set_if_absent(&self.resource, &self.token, self.ttl)
            .await?;
        if !acquired {
            tracing::info!(
                resource = %self.resource,
                "lock already held by another instance"
            );
            return Ok(false);
        }

        self.held.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(renewal_loop(
            self.store.clone(),
            self.resource.clone(),
            self.token.clone(),
            self.ttl,
            self.renew_interval,
            self.held.clone(),
            self.lost_tx.clone(),
        ));
        *self.renew_task.lock().await = Some(handle);

        tracing::info!(resource = %self.resource, token = %self.token, "lock acquired");
        Ok(true)
    }

    /// Releases the lease. Returns whether the stored record was actually
    /// deleted; `false` means another holder already took over after expiry.
    ///
    /// The local held flag is cleared with a compare-exchange so a release
    /// racing the renewal timer cannot both act on the same lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock store fails.
    pub async fn release(&self) -> Result<bool, LockError> {
        if self
            .held
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(false);
        }

        if let Some(handle) = self.renew_task.lock().await.take() {
            handle.abort();
        }

        let deleted = self
            .store
            .compare_and_delete(&self.resource, &self.token)
            .await?;
        if deleted {
            tracing::info!(resource = %self.resource, "lock released");
        } else {
            tracing::warn!(
                resource = %self.resource,
                "lock record was no longer ours at release"
            );
        }
        Ok(deleted)
    }

    /// Whether this instance believes it holds the lock. Local flag only.
    #[must_use]
    pub fn is_held_locally(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    /// Best-effort read-only confirmation against the store. Diagnostics
    /// only; never gates a mutating action.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock store fails.
    pub async fn check_if_held(&self) -> Result<bool, LockError> {
        let holder = self.store.current_holder(&self.resource).await?;
        Ok(holder.as_deref() == Some(self.token.as_str()))
    }

    /// Channel that flips to `true` when renewal detects ownership loss.
    #[must_use]
    pub fn lost(&self) -> watch::Receiver<bool> {
        self.lost_rx.clone()
    }

    #[must_use]
    pub fn resource(&self) -> &str {
        &self.resource
    }
}

#[allow(clippy::too_many_arguments)]
async fn renewal_loop(
    store: Arc<dyn LockStore>,
    resource: String,
    token: String,
    ttl: Duration,
    renew_interval: Duration,
    held: Arc<AtomicBool>,
    lost_tx: watch::Sender<bool>,
) {
    let mut ticker = tokio::time::interval(renew_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick completes immediately; skip it so renewal starts one
    // interval after acquisition.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if !held.load(Ordering::SeqCst) {
            break;
        }

        match store.compare_and_extend(&resource, &token, ttl).await {
            Ok(true) => {
                tracing::trace!(resource = %resource, "lock lease extended");
            }
            Ok(false) => {
                // Another process owns the record now. Fatal for this
                // instance; continuing to mutate shared state would be
                // split-brain.
                held.store(false, Ordering::SeqCst);
                tracing::error!(
                    resource = %resource,
                    "lock ownership lost during renewal"
                );
                let _ = lost_tx.send(true);
                break;
            }
            Err(e) => {
                // A store hiccup is not proof of ownership loss; the next
                // tick retries. If the lease lapses meanwhile, the following
                // extend comes back false and terminates the loop.
                tracing::warn!(resource = %resource, "lock renewal attempt failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryLockStore;

    fn lock_on(store: &Arc<MemoryLockStore>, ttl_ms: u64, renew_ms: u64) -> DistributedLock {
        DistributedLock::new(
            store.clone() as Arc<dyn LockStore>,
            "hedge",
            Duration::from_millis(ttl_ms),
            Duration::from_millis(renew_ms),
        )
    }

    #[tokio::test]
    async fn only_one_of_many_concurrent_acquires_wins() {
        let store = Arc::new(MemoryLockStore::new());
        let locks: Vec<_> = (0..8).map(|_| Arc::new(lock_on(&store, 5000, 1000))).collect();

        let mut handles = Vec::new();
        for lock in &locks {
            let lock = lock.clone();
            handles.push(tokio::spawn(async move { lock.acquire().await.unwrap() }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn release_reports_whether_record_was_ours() {
        let store = Arc::new(MemoryLockStore::new());
        let lock = lock_on(&store, 5000, 1000);

        assert!(lock.acquire().await.unwrap());
        assert!(lock.release().await.unwrap());
        // Second release is a no-op on the local flag.
        assert!(!lock.release().await.unwrap());
    }

    #[tokio::test]
    async fn acquire_succeeds_after_foreign_lease_expires() {
        let store = Arc::new(MemoryLockStore::new());
        let stale = lock_on(&store, 30, 10);
        assert!(stale.acquire().await.unwrap());
        // Simulate a dead process: stop renewing without releasing.
        stale.held.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;

        let fresh = lock_on(&store, 5000, 1000);
        assert!(fresh.acquire().await.unwrap());
    }

    #[tokio::test]
    async fn renewal_loss_is_published_and_clears_held_flag() {
        let store = Arc::new(MemoryLockStore::new());
        let lock = lock_on(&store, 200, 20);
        assert!(lock.acquire().await.unwrap());

        // A foreign process steals the record out from under us.
        store.compare_and_delete("hedge", &lock.token).await.unwrap();
        store
            .try_set_if_absent("hedge", "intruder", Duration::from_secs(5))
            .await
            .unwrap();

        let mut lost = lock.lost();
        tokio::time::timeout(Duration::from_secs(1), lost.wait_for(|lost| *lost))
            .await
            .expect("renewal should detect the loss")
            .unwrap();
        assert!(!lock.is_held_locally());
    }

    #[tokio::test]
    async fn check_if_held_reads_through_to_store() {
        let store = Arc::new(MemoryLockStore::new());
        let lock = lock_on(&store, 5000, 1000);

        assert!(!lock.check_if_held().await.unwrap());
        lock.acquire().await.unwrap();
        assert!(lock.check_if_held().await.unwrap());
        lock.release().await.unwrap();
        assert!(!lock.check_if_held().await.unwrap());
    }

    #[tokio::test]
    async fn renewal_keeps_short_lease_alive() {
        let store = Arc::new(MemoryLockStore::new());
        let lock = lock_on(&store, 60, 20);
        assert!(lock.acquire().await.unwrap());

        tokio::time::sleep(Duration::from_millis(200)).await;
        // Lease would have lapsed three times over without renewal.
        assert!(lock.check_if_held().await.unwrap());
        assert!(!*lock.lost().borrow());
    }
}
