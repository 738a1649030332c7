//! Pluggable key-value persistence with TTL semantics.
//!
//! The broker only ever writes through [`KvStore`]; when no store is
//! configured it runs memory-only.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;

pub const MESSAGE_INDEX_KEY: &str = "a2a:messages";
pub const DEAD_LETTER_INDEX_KEY: &str = "a2a:dead_letters";
/// Index lists keep only their most recent entries.
pub const INDEX_LIST_LIMIT: usize = 10_000;

pub fn message_key(message_id: &str) -> String {
    format!("a2a:message:{}", message_id)
}

pub fn dead_letter_key(message_id: &str, subscription_id: &str) -> String {
    format!("a2a:dead_letter:{}:{}", message_id, subscription_id)
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Appends and trims the list to its newest `INDEX_LIST_LIMIT` entries.
    async fn list_push(&self, key: &str, value: &str) -> Result<()>;

    /// Inclusive range with Redis `LRANGE` index semantics (negative counts from the end).
    async fn list_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// In-process store. Expired values are dropped on every write and on read.
pub struct MemoryStore {
    values: Mutex<HashMap<String, (String, Instant)>>,
    lists: Mutex<HashMap<String, Vec<String>>>,
    list_limit: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_list_limit(INDEX_LIST_LIMIT)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_list_limit(list_limit: usize) -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            lists: Mutex::new(HashMap::new()),
            list_limit: list_limit.max(1),
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.retain(|_, (_, deadline)| *deadline > now);
        values.insert(key.to_string(), (value.to_string(), now + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        match values.get(key) {
            Some((_, deadline)) if *deadline <= Instant::now() => {
                values.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<()> {
        let mut lists = self.lists.lock().unwrap_or_else(|e| e.into_inner());
        let list = lists.entry(key.to_string()).or_default();
        list.push(value.to_string());
        if list.len() > self.list_limit {
            let excess = list.len() - self.list_limit;
            list.drain(..excess);
        }
        Ok(())
    }

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let lists = self.lists.lock().unwrap_or_else(|e| e.into_inner());
        let Some(list) = lists.get(key) else {
            return Ok(Vec::new());
        };
        Ok(redis_range(list, start, stop).to_vec())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        self.lists
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }
}

fn redis_range(list: &[String], start: isize, stop: isize) -> &[String] {
    let len = list.len() as isize;
    let resolve = |index: isize| if index < 0 { len + index } else { index };
    let start = resolve(start).max(0);
    let stop = resolve(stop).min(len - 1);
    if len == 0 || start > stop {
        return &[];
    }
    &list[start as usize..=stop as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn values_expire_after_ttl() {
        let store = MemoryStore::new();
        store
            .set_with_expiry("short", "v", Duration::from_millis(20))
            .await
            .unwrap();
        store
            .set_with_expiry("long", "v", Duration::from_secs(60))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(store.get("short").await.unwrap(), None);
        assert_eq!(store.get("long").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn list_range_follows_redis_indexing() {
        let store = MemoryStore::new();
        for v in ["a", "b", "c", "d"] {
            store.list_push("l", v).await.unwrap();
        }

        assert_eq!(store.list_range("l", 0, -1).await.unwrap(), ["a", "b", "c", "d"]);
        assert_eq!(store.list_range("l", 1, 2).await.unwrap(), ["b", "c"]);
        assert_eq!(store.list_range("l", -2, -1).await.unwrap(), ["c", "d"]);
        assert_eq!(store.list_range("l", 3, 1).await.unwrap(), Vec::<String>::new());
        assert_eq!(store.list_range("l", 0, 100).await.unwrap().len(), 4);
        assert!(store.list_range("missing", 0, -1).await.unwrap().is_empty());

        store.delete("l").await.unwrap();
        assert!(store.list_range("l", 0, -1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_values_are_reclaimed_on_write() {
        let store = MemoryStore::new();
        for i in 0..1000 {
            store
                .set_with_expiry(&format!("k{}", i), "v", Duration::from_millis(1))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        store
            .set_with_expiry("fresh", "v", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.values.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn index_lists_keep_newest_entries() {
        let store = MemoryStore::with_list_limit(3);
        for i in 0..1000 {
            store.list_push("l", &i.to_string()).await.unwrap();
        }

        assert_eq!(store.list_range("l", 0, -1).await.unwrap(), ["997", "998", "999"]);
    }
}
