//! Redis store for fleet.
//!
//! This crate provides the production [`Store`] implementation used by every
//! fleet primitive.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use fleet_core::{KeySpace, Payload, Queue};
//! use fleet_redis::{RedisConfig, RedisStore};
//!
//! #[tokio::main]
//! async fn main() -> fleet_core::Result<()> {
//!     let config = RedisConfig::builder().prefix("myapp").build();
//!     let store = RedisStore::connect(&config).await?;
//!     let queue = Queue::new(store, &KeySpace::new(&config.prefix), "mail");
//!     queue.push("send", "1001", Payload::none()).await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use fleet_core::{FleetError, Result, Store};
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, RedisError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

const SCAN_COUNT: usize = 1000;

/// Connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisConfig {
    /// Connection URL, e.g. `redis://:password@127.0.0.1:6379/0`.
    pub url: String,
    /// Prefix of every key written by fleet.
    pub prefix: String,
    /// Log every command at trace level.
    pub trace: bool,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            prefix: "fleet".to_string(),
            trace: false,
        }
    }
}

impl RedisConfig {
    /// Create a new builder.
    pub fn builder() -> RedisConfigBuilder {
        RedisConfigBuilder::default()
    }

    /// Read `REDIS_URL`, `REDIS_PREFIX` and `REDIS_TRACE`, falling back to
    /// the defaults for unset variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("REDIS_URL") {
            config.url = url;
        }
        if let Ok(prefix) = std::env::var("REDIS_PREFIX") {
            config.prefix = prefix;
        }
        if let Ok(trace) = std::env::var("REDIS_TRACE") {
            config.trace = parse_flag(&trace).ok_or_else(|| {
                FleetError::Config(format!("REDIS_TRACE must be a boolean, got {trace:?}"))
            })?;
        }
        Ok(config)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "" | "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Builder for RedisConfig.
#[derive(Debug, Default)]
pub struct RedisConfigBuilder {
    config: RedisConfig,
}

impl RedisConfigBuilder {
    /// Set the connection URL.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config.url = url.into();
        self
    }

    /// Set the key prefix.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.prefix = prefix.into();
        self
    }

    /// Enable command tracing.
    pub fn trace(mut self, trace: bool) -> Self {
        self.config.trace = trace;
        self
    }

    /// Build the RedisConfig.
    pub fn build(self) -> RedisConfig {
        self.config
    }
}

fn store_err(e: RedisError) -> FleetError {
    FleetError::Store(e.to_string())
}

/// Redis-backed [`Store`].
///
/// Ordinary commands go through a shared [`ConnectionManager`]. The blocking
/// `BRPOPLPUSH` runs on a dedicated connection opened on first use; each
/// [`duplicate`](Store::duplicate) gets its own.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
    reader: Arc<Mutex<Option<MultiplexedConnection>>>,
    trace: bool,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("trace", &self.trace)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect using `config`.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str()).map_err(store_err)?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(store_err)?;

        tracing::info!(prefix = %config.prefix, "Connected to Redis");
        Ok(Self {
            client,
            conn,
            reader: Arc::new(Mutex::new(None)),
            trace: config.trace,
        })
    }

    /// Connect to `url` with tracing disabled.
    pub async fn new(url: &str) -> Result<Self> {
        Self::connect(&RedisConfig::builder().url(url).build()).await
    }

    fn trace(&self, command: &str, key: &str) {
        if self.trace {
            tracing::trace!(command, key, "redis");
        }
    }

    async fn reader(&self) -> Result<MultiplexedConnection> {
        let mut slot = self.reader.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(store_err)?;
        *slot = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl Store for RedisStore {
    fn duplicate(&self) -> Self {
        Self {
            client: self.client.clone(),
            conn: self.conn.clone(),
            reader: Arc::new(Mutex::new(None)),
            trace: self.trace,
        }
    }

    // ========== Strings ==========

    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool> {
        self.trace("SET NX PX", key);
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_ms)
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.trace("GET", key);
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(store_err)
    }

    async fn get_set(&self, key: &str, value: &str) -> Result<Option<String>> {
        self.trace("GETSET", key);
        let mut conn = self.conn.clone();
        conn.getset(key, value).await.map_err(store_err)
    }

    async fn del(&self, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.trace("DEL", &keys.join(" "));
        let mut conn = self.conn.clone();
        conn.del(keys).await.map_err(store_err)
    }

    async fn pttl(&self, key: &str) -> Result<i64> {
        self.trace("PTTL", key);
        let mut conn = self.conn.clone();
        conn.pttl(key).await.map_err(store_err)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.trace("SCAN", pattern);
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(store_err)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once.
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    // ========== Lists ==========

    async fn lpush(&self, key: &str, values: &[String]) -> Result<usize> {
        if values.is_empty() {
            return self.llen(key).await;
        }
        self.trace("LPUSH", key);
        let mut conn = self.conn.clone();
        conn.lpush(key, values).await.map_err(store_err)
    }

    async fn block_move(&self, source: &str, destination: &str) -> Result<Option<String>> {
        self.trace("BRPOPLPUSH", source);
        let mut conn = self.reader().await?;
        let result: std::result::Result<Option<String>, RedisError> = redis::cmd("BRPOPLPUSH")
            .arg(source)
            .arg(destination)
            .arg(0)
            .query_async(&mut conn)
            .await;

        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                // Reconnect on the next call.
                *self.reader.lock().await = None;
                Err(store_err(e))
            }
        }
    }

    async fn lrange_all(&self, key: &str) -> Result<Vec<String>> {
        self.trace("LRANGE", key);
        let mut conn = self.conn.clone();
        conn.lrange(key, 0, -1).await.map_err(store_err)
    }

    async fn lrem_all(&self, key: &str, value: &str) -> Result<usize> {
        self.trace("LREM", key);
        let mut conn = self.conn.clone();
        conn.lrem(key, 0, value).await.map_err(store_err)
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        self.trace("LLEN", key);
        let mut conn = self.conn.clone();
        conn.llen(key).await.map_err(store_err)
    }

    // ========== Hashes ==========

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.trace("HSET", key);
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(key, field, value)
            .await
            .map_err(store_err)
    }

    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        self.trace("HSETNX", key);
        let mut conn = self.conn.clone();
        conn.hset_nx(key, field, value).await.map_err(store_err)
    }

    async fn hset_multiple(&self, key: &str, entries: &[(String, String)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.trace("HMSET", key);
        let mut conn = self.conn.clone();
        conn.hset_multiple::<_, _, _, ()>(key, entries)
            .await
            .map_err(store_err)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.trace("HGET", key);
        let mut conn = self.conn.clone();
        conn.hget(key, field).await.map_err(store_err)
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        self.trace("HMGET", key);
        let mut conn = self.conn.clone();
        redis::cmd("HMGET")
            .arg(key)
            .arg(fields)
            .query_async(&mut conn)
            .await
            .map_err(store_err)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.trace("HGETALL", key);
        let mut conn = self.conn.clone();
        conn.hgetall(key).await.map_err(store_err)
    }

    async fn hkeys(&self, key: &str) -> Result<Vec<String>> {
        self.trace("HKEYS", key);
        let mut conn = self.conn.clone();
        conn.hkeys(key).await.map_err(store_err)
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<usize> {
        if fields.is_empty() {
            return Ok(0);
        }
        self.trace("HDEL", key);
        let mut conn = self.conn.clone();
        conn.hdel(key, fields).await.map_err(store_err)
    }

    // ========== Pipelines ==========

    async fn read_list_and_hash(
        &self,
        list: &str,
        hash: &str,
    ) -> Result<(Vec<String>, HashMap<String, String>)> {
        self.trace("LRANGE+HGETALL", list);
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.lrange(list, 0, -1).hgetall(hash);

        pipe.query_async(&mut conn).await.map_err(store_err)
    }

    async fn release_claim(&self, hash: &str, list: &str, token: &str) -> Result<()> {
        self.trace("HDEL+LREM", list);
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().hdel(hash, token).lrem(list, 0, token);

        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(store_err)
    }

    async fn requeue(&self, hash: &str, list: &str, tokens: &[String]) -> Result<()> {
        if tokens.is_empty() {
            return Ok(());
        }
        self.trace("HDEL+LPUSH", list);
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().hdel(hash, tokens).lpush(list, tokens);

        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(store_err)
    }

    async fn delete_batch(&self, targets: &[(String, Vec<String>)]) -> Result<usize> {
        if targets.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for (key, fields) in targets {
            self.trace(if fields.is_empty() { "DEL" } else { "HDEL" }, key);
            if fields.is_empty() {
                pipe.del(key);
            } else {
                pipe.hdel(key, fields);
            }
        }

        let counts: Vec<usize> = pipe.query_async(&mut conn).await.map_err(store_err)?;
        Ok(counts.into_iter().sum())
    }
}


// ========== Integration Tests (require Redis) ==========
