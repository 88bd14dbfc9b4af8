//! In-process [`Store`] with Redis semantics.
//!
//! Every clone shares the same data, so one `MemoryStore` stands in for one
//! remote store shared by many workers. Expiry uses `tokio::time::Instant`
//! and therefore follows a paused test clock.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::time::{Duration, Instant};

use crate::error::{FleetError, Result};
use crate::store::Store;

#[derive(Default)]
struct State {
    strings: HashMap<String, (String, Option<Instant>)>,
    lists: HashMap<String, VecDeque<String>>,
    hashes: HashMap<String, HashMap<String, String>>,
}

impl State {
    fn evict_expired(&mut self, key: &str) {
        let expired = self
            .strings
            .get(key)
            .and_then(|(_, expires_at)| *expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            self.strings.remove(key);
        }
    }

    fn exists(&mut self, key: &str) -> bool {
        self.evict_expired(key);
        self.strings.contains_key(key) || self.lists.contains_key(key) || self.hashes.contains_key(key)
    }

    fn string(&mut self, key: &str) -> Option<String> {
        self.evict_expired(key);
        self.strings.get(key).map(|(value, _)| value.clone())
    }

    fn remove(&mut self, key: &str) -> bool {
        self.evict_expired(key);
        let string = self.strings.remove(key).is_some();
        let list = self.lists.remove(key).is_some();
        let hash = self.hashes.remove(key).is_some();
        string || list || hash
    }

    fn all_keys(&mut self) -> Vec<String> {
        let now = Instant::now();
        self.strings
            .retain(|_, (_, expires_at)| expires_at.map_or(true, |at| at > now));
        self.strings
            .keys()
            .chain(self.lists.keys())
            .chain(self.hashes.keys())
            .cloned()
            .collect()
    }

    fn pop_push(&mut self, source: &str, destination: &str) -> Option<String> {
        let list = self.lists.get_mut(source)?;
        let value = list.pop_back()?;
        if list.is_empty() {
            self.lists.remove(source);
        }
        self.lists
            .entry(destination.to_string())
            .or_default()
            .push_front(value.clone());
        Some(value)
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    pushed: Notify,
}

/// Store kept in process memory.
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn duplicate(&self) -> Self {
        self.clone()
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool> {
        if ttl_ms == 0 {
            return Err(FleetError::Store(
                "invalid expire time in 'set' command".to_string(),
            ));
        }
        let mut state = self.shared.state.lock().await;
        if state.exists(key) {
            return Ok(false);
        }
        let expires_at = Instant::now() + Duration::from_millis(ttl_ms);
        state
            .strings
            .insert(key.to_string(), (value.to_string(), Some(expires_at)));
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.shared.state.lock().await.string(key))
    }

    async fn get_set(&self, key: &str, value: &str) -> Result<Option<String>> {
        let mut state = self.shared.state.lock().await;
        let previous = state.string(key);
        state
            .strings
            .insert(key.to_string(), (value.to_string(), None));
        Ok(previous)
    }

    async fn del(&self, keys: &[String]) -> Result<usize> {
        let mut state = self.shared.state.lock().await;
        Ok(keys.iter().filter(|key| state.remove(key)).count())
    }

    async fn pttl(&self, key: &str) -> Result<i64> {
        let mut state = self.shared.state.lock().await;
        if !state.exists(key) {
            return Ok(-2);
        }
        let remaining = state
            .strings
            .get(key)
            .and_then(|(_, expires_at)| *expires_at)
            .map(|at| at.saturating_duration_since(Instant::now()).as_millis() as i64);
        Ok(remaining.unwrap_or(-1))
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut state = self.shared.state.lock().await;
        let mut keys: Vec<String> = state
            .all_keys()
            .into_iter()
            .filter(|key| glob_match(pattern, key))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn lpush(&self, key: &str, values: &[String]) -> Result<usize> {
        let len = {
            let mut state = self.shared.state.lock().await;
            let list = state.lists.entry(key.to_string()).or_default();
            for value in values {
                list.push_front(value.clone());
            }
            list.len()
        };
        self.shared.pushed.notify_waiters();
        Ok(len)
    }

    async fn block_move(&self, source: &str, destination: &str) -> Result<Option<String>> {
        loop {
            let pushed = self.shared.pushed.notified();
            tokio::pin!(pushed);
            pushed.as_mut().enable();

            if let Some(value) = self.shared.state.lock().await.pop_push(source, destination) {
                return Ok(Some(value));
            }
            pushed.await;
        }
    }

    async fn lrange_all(&self, key: &str) -> Result<Vec<String>> {
        let state = self.shared.state.lock().await;
        Ok(state
            .lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn lrem_all(&self, key: &str, value: &str) -> Result<usize> {
        let mut state = self.shared.state.lock().await;
        let Some(list) = state.lists.get_mut(key) else {
            return Ok(0);
        };
        let before = list.len();
        list.retain(|item| item != value);
        let removed = before - list.len();
        if list.is_empty() {
            state.lists.remove(key);
        }
        Ok(removed)
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        let state = self.shared.state.lock().await;
        Ok(state.lists.get(key).map_or(0, VecDeque::len))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        state
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        let mut state = self.shared.state.lock().await;
        let hash = state.hashes.entry(key.to_string()).or_default();
        if hash.contains_key(field) {
            return Ok(false);
        }
        hash.insert(field.to_string(), value.to_string());
        Ok(true)
    }

    async fn hset_multiple(&self, key: &str, entries: &[(String, String)]) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        let hash = state.hashes.entry(key.to_string()).or_default();
        for (field, value) in entries {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let state = self.shared.state.lock().await;
        Ok(state.hashes.get(key).and_then(|hash| hash.get(field)).cloned())
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>> {
        let state = self.shared.state.lock().await;
        let hash = state.hashes.get(key);
        Ok(fields
            .iter()
            .map(|field| hash.and_then(|hash| hash.get(field)).cloned())
            .collect())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let state = self.shared.state.lock().await;
        Ok(state.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hkeys(&self, key: &str) -> Result<Vec<String>> {
        let state = self.shared.state.lock().await;
        Ok(state
            .hashes
            .get(key)
            .map(|hash| hash.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<usize> {
        let mut state = self.shared.state.lock().await;
        let Some(hash) = state.hashes.get_mut(key) else {
            return Ok(0);
        };
        let removed = fields
            .iter()
            .filter(|field| hash.remove(field.as_str()).is_some())
            .count();
        if hash.is_empty() {
            state.hashes.remove(key);
        }
        Ok(removed)
    }
}

/// Redis-style glob match supporting `*` and `?`.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some('*') => {
                star = Some((p, t));
                p += 1;
            }
            Some('?') => {
                p += 1;
                t += 1;
            }
            Some(c) if *c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match star {
                Some((star_p, star_t)) => {
                    p = star_p + 1;
                    t = star_t + 1;
                    star = Some((star_p, star_t + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_nx_px_and_expiry() {
        let store = MemoryStore::new();
        assert!(store.set_nx_px("k", "a", 1000).await.unwrap());
        assert!(!store.set_nx_px("k", "b", 1000).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some("a".to_string()));
        assert_eq!(store.pttl("k").await.unwrap(), 1000);

        tokio::time::advance(Duration::from_millis(400)).await;
        assert_eq!(store.pttl("k").await.unwrap(), 600);

        tokio::time::advance(Duration::from_millis(600)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.pttl("k").await.unwrap(), -2);
        assert!(store.set_nx_px("k", "b", 1000).await.unwrap());
    }

    #[tokio::test]
    async fn test_set_nx_px_rejects_zero_ttl() {
        let store = MemoryStore::new();
        let err = store.set_nx_px("k", "a", 0).await.unwrap_err();
        assert!(matches!(err, FleetError::Store(_)));
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_get_set() {
        let store = MemoryStore::new();
        assert_eq!(store.get_set("last", "1").await.unwrap(), None);
        assert_eq!(store.get_set("last", "2").await.unwrap(), Some("1".to_string()));
        assert_eq!(store.pttl("last").await.unwrap(), -1);
    }

    #[tokio::test]
    async fn test_lists() {
        let store = MemoryStore::new();
        assert_eq!(store.lpush("l", &strings(&["a", "b"])).await.unwrap(), 2);
        assert_eq!(store.lrange_all("l").await.unwrap(), strings(&["b", "a"]));

        let moved = store.block_move("l", "d").await.unwrap();
        assert_eq!(moved, Some("a".to_string()));
        assert_eq!(store.llen("l").await.unwrap(), 1);
        assert_eq!(store.lrange_all("d").await.unwrap(), strings(&["a"]));

        store.lpush("d", &strings(&["a"])).await.unwrap();
        assert_eq!(store.lrem_all("d", "a").await.unwrap(), 2);
        assert_eq!(store.llen("d").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_block_move_waits_for_push() {
        let store = MemoryStore::new();
        let consumer = store.duplicate();
        let handle = tokio::spawn(async move { consumer.block_move("src", "dst").await });

        tokio::task::yield_now().await;
        store.lpush("src", &strings(&["job"])).await.unwrap();

        let moved = handle.await.unwrap().unwrap();
        assert_eq!(moved, Some("job".to_string()));
        assert_eq!(store.lrange_all("dst").await.unwrap(), strings(&["job"]));
    }

    #[tokio::test]
    async fn test_hashes() {
        let store = MemoryStore::new();
        assert!(store.hset_nx("h", "f", "1").await.unwrap());
        assert!(!store.hset_nx("h", "f", "2").await.unwrap());
        store.hset("h", "g", "3").await.unwrap();
        store
            .hset_multiple("h", &[("x".to_string(), "9".to_string())])
            .await
            .unwrap();

        assert_eq!(store.hget("h", "f").await.unwrap(), Some("1".to_string()));
        assert_eq!(
            store.hmget("h", &strings(&["g", "missing"])).await.unwrap(),
            vec![Some("3".to_string()), None]
        );
        let mut fields = store.hkeys("h").await.unwrap();
        fields.sort();
        assert_eq!(fields, strings(&["f", "g", "x"]));
        assert_eq!(store.hgetall("h").await.unwrap().len(), 3);

        assert_eq!(store.hdel("h", &strings(&["f", "nope"])).await.unwrap(), 1);
        assert_eq!(store.del(&strings(&["h", "nope"])).await.unwrap(), 1);
        assert!(store.hgetall("h").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_keys_glob() {
        let store = MemoryStore::new();
        store.hset("app:users", "1", "a").await.unwrap();
        store.hset("app:posts", "1", "a").await.unwrap();
        store.get_set("other", "x").await.unwrap();

        assert_eq!(
            store.keys("app:*").await.unwrap(),
            strings(&["app:posts", "app:users"])
        );
        assert_eq!(store.keys("app:u?ers").await.unwrap(), strings(&["app:users"]));
        assert_eq!(store.keys("*").await.unwrap().len(), 3);
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("a*c", "abbbc"));
        assert!(glob_match("*", ""));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "ac"));
        assert!(!glob_match("a*d", "abc"));
        assert!(glob_match("*b*", "abc"));
    }

    #[tokio::test]
    async fn test_default_pipelines() {
        let store = MemoryStore::new();
        store.lpush("doing", &strings(&["t1", "t2"])).await.unwrap();
        store.hset("map", "t1", "100").await.unwrap();

        let (items, map) = store.read_list_and_hash("doing", "map").await.unwrap();
        assert_eq!(items, strings(&["t2", "t1"]));
        assert_eq!(map.get("t1"), Some(&"100".to_string()));

        store.release_claim("map", "doing", "t1").await.unwrap();
        assert_eq!(store.lrange_all("doing").await.unwrap(), strings(&["t2"]));
        assert!(store.hgetall("map").await.unwrap().is_empty());

        store.hset("map", "t2", "1").await.unwrap();
        store.requeue("map", "pending", &strings(&["t2"])).await.unwrap();
        assert_eq!(store.lrange_all("pending").await.unwrap(), strings(&["t2"]));
        assert!(store.hget("map", "t2").await.unwrap().is_none());
    }
}
