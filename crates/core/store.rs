//! Store abstraction consumed by every coordination primitive.
//!
//! The trait mirrors the small set of atomic operations a Redis-like store
//! offers: conditional set with expiry, list push / blocking move, hash
//! set-if-absent, and a few pipelined batches. Pipelines give no atomicity
//! beyond what each individual command provides; every caller is written to
//! tolerate concurrent writers between the commands of a batch.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::Result;

/// Key/value, list and hash operations shared by queues, locks, cron and cache.
///
/// Implementations must be thread-safe (Send + Sync). Cloning a store is
/// expected to be cheap and to share the underlying connection.
#[async_trait]
pub trait Store: Send + Sync {
    /// Handle that shares this store but owns its own connection for
    /// [`block_move`](Store::block_move), so a blocked read never stalls
    /// other commands.
    fn duplicate(&self) -> Self
    where
        Self: Sized;

    // ========== Strings ==========

    /// `SET key value PX ttl_ms NX`. Returns whether the key was written.
    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool>;

    /// Read a string key.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Atomically replace a string key, returning the previous value.
    async fn get_set(&self, key: &str, value: &str) -> Result<Option<String>>;

    /// Delete keys, returning how many existed.
    async fn del(&self, keys: &[String]) -> Result<usize>;

    /// Remaining time to live in milliseconds (`-2` missing, `-1` no expiry).
    async fn pttl(&self, key: &str) -> Result<i64>;

    /// Keys matching a glob pattern.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    // ========== Lists ==========

    /// Push values onto the head of a list, returning the new length.
    async fn lpush(&self, key: &str, values: &[String]) -> Result<usize>;

    /// Atomically pop the tail of `source` and push it onto the head of
    /// `destination`, waiting indefinitely for an element.
    async fn block_move(&self, source: &str, destination: &str) -> Result<Option<String>>;

    /// Every element of a list, head first.
    async fn lrange_all(&self, key: &str) -> Result<Vec<String>>;

    /// Remove every occurrence of `value` from a list.
    async fn lrem_all(&self, key: &str, value: &str) -> Result<usize>;

    /// Length of a list.
    async fn llen(&self, key: &str) -> Result<usize>;

    // ========== Hashes ==========

    /// Set a hash field unconditionally.
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;

    /// Set a hash field only if absent. Returns whether it was written.
    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<bool>;

    /// Set several hash fields at once.
    async fn hset_multiple(&self, key: &str, entries: &[(String, String)]) -> Result<()>;

    /// Read one hash field.
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    /// Read several hash fields, in request order.
    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>>;

    /// Read a whole hash.
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Field names of a hash.
    async fn hkeys(&self, key: &str) -> Result<Vec<String>>;

    /// Delete hash fields, returning how many existed.
    async fn hdel(&self, key: &str, fields: &[String]) -> Result<usize>;

    // ========== Pipelines ==========

    /// Read a whole list and a whole hash in one round trip.
    async fn read_list_and_hash(
        &self,
        list: &str,
        hash: &str,
    ) -> Result<(Vec<String>, HashMap<String, String>)> {
        let items = self.lrange_all(list).await?;
        let map = self.hgetall(hash).await?;
        Ok((items, map))
    }

    /// Drop a finished token: delete its hash field and remove it from the list.
    async fn release_claim(&self, hash: &str, list: &str, token: &str) -> Result<()> {
        self.hdel(hash, &[token.to_string()]).await?;
        self.lrem_all(list, token).await?;
        Ok(())
    }

    /// Forget the hash fields of `tokens` and push them back onto `list`.
    async fn requeue(&self, hash: &str, list: &str, tokens: &[String]) -> Result<()> {
        if tokens.is_empty() {
            return Ok(());
        }
        self.hdel(hash, tokens).await?;
        self.lpush(list, tokens).await?;
        Ok(())
    }

    /// Batch of deletes: listed hash fields, or the whole key when no field
    /// is given. Returns the summed delete counts.
    async fn delete_batch(&self, targets: &[(String, Vec<String>)]) -> Result<usize> {
        let mut deleted = 0;
        for (key, fields) in targets {
            deleted += if fields.is_empty() {
                self.del(std::slice::from_ref(key)).await?
            } else {
                self.hdel(key, fields).await?
            };
        }
        Ok(deleted)
    }
}
