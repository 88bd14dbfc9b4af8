//! Leased mutual exclusion over a single store key.
//!
//! A lock is a key written with `SET NX PX` holding a value unique to one
//! acquisition. Release deletes the key only while it still holds that
//! value, so a holder whose lease already expired never frees a lease that
//! another process acquired since.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::config::LockOptions;
use crate::error::{FleetError, Result};
use crate::keys::KeySpace;
use crate::store::Store;

/// One acquisition attempt of a named lock.
pub struct Lock<S: Store> {
    store: S,
    key: String,
    value: String,
    lease: Duration,
}

impl<S: Store> Lock<S> {
    /// Store key of the lock.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Value written on acquisition.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Try to acquire the lease. Returns whether this attempt now holds it.
    pub async fn lock(&self) -> Result<bool> {
        self.store
            .set_nx_px(&self.key, &self.value, self.lease.as_millis() as u64)
            .await
    }

    /// Remaining lease in milliseconds, 0 when expired or absent.
    pub async fn ttl(&self) -> Result<u64> {
        let ms = self.store.pttl(&self.key).await?;
        Ok(if ms > 0 { ms as u64 } else { 0 })
    }

    /// Delete the key if it still holds this attempt's value. Returns the
    /// number of deleted keys, or -1 when the lease belongs to someone else.
    pub async fn unlock(&self) -> Result<i64> {
        if self.store.get(&self.key).await?.as_deref() != Some(self.value.as_str()) {
            return Ok(-1);
        }
        let deleted = self.store.del(std::slice::from_ref(&self.key)).await?;
        Ok(deleted as i64)
    }
}

/// Hands out locks and runs critical sections under them.
///
/// Each manager owns the counter that makes lock values unique within the
/// process; clones share it.
#[derive(Clone)]
pub struct LockManager<S: Store + Clone> {
    store: S,
    space: KeySpace,
    host: String,
    counter: Arc<AtomicU64>,
}

impl<S: Store + Clone> LockManager<S> {
    /// Create a manager.
    pub fn new(store: S, space: KeySpace) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            store,
            space,
            host,
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A fresh acquisition attempt for `id`.
    pub fn lock(&self, id: &str, lease: Duration) -> Lock<S> {
        let series = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Lock {
            store: self.store.clone(),
            key: self.space.lock(id),
            value: format!("{}-{}-{}", self.host, series, Uuid::new_v4()),
            lease,
        }
    }

    /// Wait for the lock, polling every `options.poll_interval`, run `work`
    /// and release the lock. A failed release is logged; the lease then
    /// simply expires.
    pub async fn start<T, F, Fut>(&self, id: &str, options: LockOptions, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self.lock(id, options.lease);
        while !lock.lock().await? {
            tokio::time::sleep(options.poll_interval).await;
        }

        let output = work().await;
        release(&lock).await;
        Ok(output)
    }

    /// Like [`start`](Self::start) but fails with [`FleetError::LockBusy`]
    /// instead of waiting when the lock is held.
    pub async fn try_start<T, F, Fut>(&self, id: &str, lease: Duration, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self.lock(id, lease);
        if !lock.lock().await? {
            return Err(FleetError::LockBusy {
                key: lock.key().to_string(),
            });
        }

        let output = work().await;
        release(&lock).await;
        Ok(output)
    }

    /// Run `work` at most once per `lease` across every caller of `id`.
    ///
    /// A blocked caller sleeps for the remaining lease before retrying. The
    /// lock is never released: its expiry is what spaces the runs.
    pub async fn throttle<T, F, Fut>(&self, id: &str, lease: Duration, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self.lock(id, lease);
        while !lock.lock().await? {
            // A key left without expiry reports no remaining lease.
            let wait = match lock.ttl().await? {
                0 => LockOptions::default().poll_interval,
                ttl => Duration::from_millis(ttl),
            };
            tokio::time::sleep(wait).await;
        }

        Ok(work().await)
    }
}

async fn release<S: Store>(lock: &Lock<S>) {
    match lock.unlock().await {
        Ok(-1) => {
            tracing::warn!(key = %lock.key(), "Lock lease expired before release");
        }
        Ok(_) => {}
        Err(e) => {
            tracing::warn!(key = %lock.key(), error = %e, "Failed to release lock");
        }
    }
}
