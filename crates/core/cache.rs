//! TTL cache kept in store hashes.
//!
//! Each namespace is one hash at `{prefix}:{nsp}`; each field holds the JSON
//! array `[expireAtMs, value]`. Expired entries read as misses and are
//! removed by [`Cache::clear_expired`].

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use crate::clock::now_millis;
use crate::error::{FleetError, Result};
use crate::keys::KeySpace;
use crate::store::Store;

/// TTL applied when callers have no better idea: 30 days.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 24 * 3600);

const CLEAR_CHUNK: usize = 1000;

/// Namespaced TTL cache.
#[derive(Clone)]
pub struct Cache<S: Store + Clone> {
    store: S,
    space: KeySpace,
}

impl<S: Store + Clone> Cache<S> {
    /// Create a cache.
    pub fn new(store: S, space: KeySpace) -> Self {
        Self { store, space }
    }

    /// Hash key of a namespace.
    pub fn key(&self, nsp: &str) -> String {
        self.space.cache(nsp)
    }

    /// Store one value for `ttl`.
    pub async fn set<T: Serialize>(&self, nsp: &str, id: &str, value: &T, ttl: Duration) -> Result<()> {
        let expire = expire_at(ttl)?;
        let data = encode(value, expire)?;
        self.store.hset(&self.key(nsp), id, &data).await
    }

    /// Store several values sharing one `ttl`.
    pub async fn mset<T: Serialize>(
        &self,
        nsp: &str,
        values: &HashMap<String, T>,
        ttl: Duration,
    ) -> Result<()> {
        let expire = expire_at(ttl)?;
        if values.is_empty() {
            return Err(FleetError::InvalidArgument(
                "cache values must not be empty".to_string(),
            ));
        }

        let entries = values
            .iter()
            .map(|(id, value)| Ok((id.clone(), encode(value, expire)?)))
            .collect::<Result<Vec<_>>>()?;
        self.store.hset_multiple(&self.key(nsp), &entries).await
    }

    /// Read one value. Missing, expired and unreadable entries are `None`.
    pub async fn get<T: DeserializeOwned>(&self, nsp: &str, id: &str) -> Result<Option<T>> {
        let raw = self.store.hget(&self.key(nsp), id).await?;
        match decode(raw.as_deref(), now_millis()) {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Read several values; only hits appear in the result.
    pub async fn mget<T: DeserializeOwned>(
        &self,
        nsp: &str,
        ids: &[String],
    ) -> Result<HashMap<String, T>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let raw = self.store.hmget(&self.key(nsp), ids).await?;
        let now = now_millis();
        let mut result = HashMap::new();
        for (id, raw) in ids.iter().zip(raw) {
            if let Some(value) = decode(raw.as_deref(), now) {
                result.insert(id.clone(), serde_json::from_value(value)?);
            }
        }
        Ok(result)
    }

    /// Read-through: return the cached value, or compute it with `work`
    /// (always when `force`) and cache it. A zero `ttl` skips the write.
    pub async fn wrap<T, E, F, Fut>(
        &self,
        nsp: &str,
        id: &str,
        ttl: Duration,
        force: bool,
        work: F,
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<FleetError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if !force {
            if let Some(value) = self.get(nsp, id).await? {
                return Ok(value);
            }
        }

        let value = work().await?;
        if !ttl.is_zero() {
            self.set(nsp, id, &value, ttl).await?;
        }
        Ok(value)
    }

    /// Batch read-through. `work` receives only the missing ids; ids it
    /// does not return are cached as `null` and come back as `None`.
    pub async fn mwrap<T, E, F, Fut>(
        &self,
        nsp: &str,
        ids: &[String],
        ttl: Duration,
        force: bool,
        work: F,
    ) -> std::result::Result<HashMap<String, Option<T>>, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<FleetError>,
        F: FnOnce(Vec<String>) -> Fut,
        Fut: Future<Output = std::result::Result<HashMap<String, T>, E>>,
    {
        let mut result: HashMap<String, Option<T>> = if force {
            HashMap::new()
        } else {
            self.mget(nsp, ids).await?
        };

        let missing: Vec<String> = ids
            .iter()
            .filter(|id| !result.contains_key(id.as_str()))
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(result);
        }

        let mut computed = work(missing.clone()).await?;
        let fresh: HashMap<String, Option<T>> = missing
            .into_iter()
            .map(|id| {
                let value = computed.remove(&id);
                (id, value)
            })
            .collect();

        if !ttl.is_zero() {
            self.mset(nsp, &fresh, ttl).await?;
        }
        result.extend(fresh);
        Ok(result)
    }

    /// Delete fields of a namespace, or the whole namespace when `ids` is
    /// empty. Returns the number of deleted fields or keys.
    pub async fn delete(&self, nsp: &str, ids: &[String]) -> Result<usize> {
        let key = self.key(nsp);
        if ids.is_empty() {
            self.store.del(&[key]).await
        } else {
            self.store.hdel(&key, ids).await
        }
    }

    /// Several [`delete`](Self::delete)s in one batch.
    pub async fn mdelete(&self, targets: &[(String, Vec<String>)]) -> Result<usize> {
        match targets {
            [] => Ok(0),
            [(nsp, ids)] => self.delete(nsp, ids).await,
            _ => {
                let targets: Vec<(String, Vec<String>)> = targets
                    .iter()
                    .map(|(nsp, ids)| (self.key(nsp), ids.clone()))
                    .collect();
                self.store.delete_batch(&targets).await
            }
        }
    }

    /// Remove expired or unreadable fields from every namespace matching
    /// `pattern`. Returns `(deleted, total)` per hash key.
    pub async fn clear_expired(&self, pattern: &str) -> Result<HashMap<String, (usize, usize)>> {
        let now = now_millis();
        let mut result = HashMap::new();

        for key in self.store.keys(&self.key(pattern)).await? {
            let fields = self.store.hkeys(&key).await?;
            let mut deleted = 0;

            for chunk in fields.chunks(CLEAR_CHUNK) {
                let values = self.store.hmget(&key, chunk).await?;
                let expired: Vec<String> = chunk
                    .iter()
                    .zip(values)
                    .filter(|(_, raw)| expire_of(raw.as_deref()) < now)
                    .map(|(field, _)| field.clone())
                    .collect();
                if !expired.is_empty() {
                    deleted += self.store.hdel(&key, &expired).await?;
                }
            }

            tracing::debug!(key = %key, deleted, total = fields.len(), "Cleared expired cache entries");
            result.insert(key, (deleted, fields.len()));
        }
        Ok(result)
    }

    /// Delete every namespace whose name starts with `nsp`.
    pub async fn clear(&self, nsp: &str) -> Result<usize> {
        let keys = self.store.keys(&self.key(&format!("{nsp}*"))).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        self.store.del(&keys).await
    }
}

fn expire_at(ttl: Duration) -> Result<i64> {
    if ttl.is_zero() {
        return Err(FleetError::InvalidArgument(
            "cache ttl must be greater than 0".to_string(),
        ));
    }
    Ok(now_millis() + ttl.as_millis() as i64)
}

fn encode<T: Serialize>(value: &T, expire: i64) -> Result<String> {
    Ok(serde_json::to_string(&(expire, value))?)
}

fn decode(raw: Option<&str>, now: i64) -> Option<Value> {
    let (expire, value): (i64, Value) = serde_json::from_str(raw?).ok()?;
    (expire >= now).then_some(value)
}

fn expire_of(raw: Option<&str>) -> i64 {
    raw.and_then(|raw| serde_json::from_str::<(i64, Value)>(raw).ok())
        .map_or(0, |(expire, _)| expire)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use serde_json::json;

    fn cache() -> Cache<MemoryStore> {
        Cache::new(MemoryStore::new(), KeySpace::new("app"))
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let cache = cache();
        cache.set("users", "1", &json!({"name": "a"}), DEFAULT_TTL).await.unwrap();

        let value: Option<Value> = cache.get("users", "1").await.unwrap();
        assert_eq!(value, Some(json!({"name": "a"})));
        assert_eq!(cache.get::<Value>("users", "2").await.unwrap(), None);

        let raw = cache.store.hget("app:users", "1").await.unwrap().unwrap();
        assert!(raw.starts_with('['));
        assert!(raw.ends_with(r#",{"name":"a"}]"#));
    }

    #[tokio::test]
    async fn test_ttl_must_be_positive() {
        let cache = cache();
        let err = cache.set("users", "1", &1, Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, FleetError::InvalidArgument(_)));

        let err = cache
            .mset::<i32>("users", &HashMap::new(), DEFAULT_TTL)
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_expired_entries_read_as_missing() {
        let cache = cache();
        cache.set("users", "1", &1, Duration::from_millis(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cache.get::<i32>("users", "1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_null_is_a_hit() {
        let cache = cache();
        cache.set("users", "1", &Value::Null, DEFAULT_TTL).await.unwrap();
        assert_eq!(cache.get::<Value>("users", "1").await.unwrap(), Some(Value::Null));
        assert_eq!(cache.get::<Option<i32>>("users", "1").await.unwrap(), Some(None));
    }

    #[tokio::test]
    async fn test_mset_and_mget() {
        let cache = cache();
        let values: HashMap<String, i32> =
            [("a".to_string(), 1), ("b".to_string(), 2)].into_iter().collect();
        cache.mset("nums", &values, DEFAULT_TTL).await.unwrap();
        cache.store.hset("app:nums", "broken", "not json").await.unwrap();

        let got: HashMap<String, i32> = cache.mget("nums", &ids(&["a", "b", "c", "broken"])).await.unwrap();
        assert_eq!(got, values);
    }

    #[tokio::test]
    async fn test_wrap() {
        let cache = cache();
        let first: std::result::Result<i32, FleetError> = cache
            .wrap("calc", "x", DEFAULT_TTL, false, || async { Ok(1) })
            .await;
        assert_eq!(first.unwrap(), 1);

        let cached: std::result::Result<i32, FleetError> = cache
            .wrap("calc", "x", DEFAULT_TTL, false, || async { Ok(2) })
            .await;
        assert_eq!(cached.unwrap(), 1);

        let forced: std::result::Result<i32, FleetError> = cache
            .wrap("calc", "x", DEFAULT_TTL, true, || async { Ok(3) })
            .await;
        assert_eq!(forced.unwrap(), 3);
        assert_eq!(cache.get::<i32>("calc", "x").await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_mwrap_caches_missing_as_null() {
        let cache = cache();
        cache.set("users", "a", &"cached", DEFAULT_TTL).await.unwrap();

        let result: std::result::Result<HashMap<String, Option<String>>, FleetError> = cache
            .mwrap("users", &ids(&["a", "b", "c"]), DEFAULT_TTL, false, |missing| async move {
                assert_eq!(missing, ids(&["b", "c"]));
                Ok([("b".to_string(), "fresh".to_string())].into_iter().collect())
            })
            .await;
        let result = result.unwrap();
        assert_eq!(result["a"], Some("cached".to_string()));
        assert_eq!(result["b"], Some("fresh".to_string()));
        assert_eq!(result["c"], None);

        // "c" is now a cached null, so nothing is recomputed.
        let again: std::result::Result<HashMap<String, Option<String>>, FleetError> = cache
            .mwrap("users", &ids(&["a", "b", "c"]), DEFAULT_TTL, false, |missing| async move {
                Err(FleetError::InvalidArgument(format!("recomputed {missing:?}")))
            })
            .await;
        assert_eq!(again.unwrap(), result);
    }

    #[tokio::test]
    async fn test_delete_and_mdelete() {
        let cache = cache();
        for nsp in ["a", "b", "c"] {
            cache.set(nsp, "1", &1, DEFAULT_TTL).await.unwrap();
            cache.set(nsp, "2", &2, DEFAULT_TTL).await.unwrap();
        }

        assert_eq!(cache.delete("a", &ids(&["1"])).await.unwrap(), 1);
        assert_eq!(cache.get::<i32>("a", "2").await.unwrap(), Some(2));
        assert_eq!(cache.delete("a", &[]).await.unwrap(), 1);

        let deleted = cache
            .mdelete(&[("b".to_string(), ids(&["1", "2"])), ("c".to_string(), vec![])])
            .await
            .unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(cache.mdelete(&[]).await.unwrap(), 0);
        assert!(cache.store.keys("app:*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_expired() {
        let cache = cache();
        let short: HashMap<String, i32> = [("a".to_string(), 1), ("b".to_string(), 2)].into_iter().collect();
        cache.mset("nsp", &short, Duration::from_millis(1)).await.unwrap();
        cache.set("nsp", "c", &3, DEFAULT_TTL).await.unwrap();
        cache.store.hset("app:nsp", "broken", "???").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let result = cache.clear_expired("*").await.unwrap();
        assert_eq!(result.get("app:nsp"), Some(&(3, 4)));
        assert_eq!(cache.store.hkeys("app:nsp").await.unwrap(), ids(&["c"]));
    }

    #[tokio::test]
    async fn test_clear() {
        let cache = cache();
        cache.set("mod1", "1", &1, DEFAULT_TTL).await.unwrap();
        cache.set("mod1-sub", "1", &1, DEFAULT_TTL).await.unwrap();
        cache.set("mod2", "1", &1, DEFAULT_TTL).await.unwrap();

        assert_eq!(cache.clear("mod1").await.unwrap(), 2);
        assert_eq!(cache.store.keys("app:*").await.unwrap(), ids(&["app:mod2"]));
        assert_eq!(cache.clear("none").await.unwrap(), 0);
    }
}
