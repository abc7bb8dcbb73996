use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use super::{KvPage, KvStore};
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct KvEntry {
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

impl KvEntry {
    fn is_live(&self, now: u64) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Ordered key space with lazy expiry, shared by the memory and file backends.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub(crate) struct KvMap {
    entries: BTreeMap<String, KvEntry>,
}

impl KvMap {
    pub fn get(&self, key: &str, now: u64) -> Option<String> {
        self.entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone())
    }

    pub fn put(&mut self, key: &str, value: &str, ttl_secs: Option<u64>, now: u64) {
        self.entries.insert(
            key.to_string(),
            KvEntry {
                value: value.to_string(),
                expires_at: ttl_secs.map(|ttl| now + ttl),
            },
        );
    }

    pub fn delete(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Drop expired entries; returns true if anything was removed.
    pub fn evict_expired(&mut self, now: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.is_live(now));
        before != self.entries.len()
    }

    /// Cursor is the last key of the previous page.
    pub fn list(&self, prefix: &str, limit: usize, cursor: Option<&str>, now: u64) -> KvPage {
        let limit = limit.max(1);
        let mut keys = Vec::new();
        let mut more = false;

        let live = self
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(k, _)| cursor.is_none_or(|c| k.as_str() > c))
            .filter(|(_, e)| e.is_live(now));

        for (key, _) in live {
            if keys.len() == limit {
                more = true;
                break;
            }
            keys.push(key.clone());
        }

        let cursor = if more { keys.last().cloned() } else { None };
        KvPage {
            keys,
            cursor,
            list_complete: !more,
        }
    }
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Process-local store. Contents vanish on exit.
#[derive(Default)]
pub struct MemoryKv {
    map: Mutex<KvMap>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.map.lock().get(key, now_secs()))
    }

    async fn put(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()> {
        let now = now_secs();
        let mut map = self.map.lock();
        map.evict_expired(now);
        map.put(key, value, ttl_secs, now);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.map.lock().delete(key);
        Ok(())
    }

    async fn list(&self, prefix: &str, limit: usize, cursor: Option<&str>) -> Result<KvPage> {
        Ok(self.map.lock().list(prefix, limit, cursor, now_secs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_ttl_expiry() {
        let mut map = KvMap::default();
        map.put("a", "1", Some(60), 1000);
        map.put("b", "2", None, 1000);

        assert_eq!(map.get("a", 1059).as_deref(), Some("1"));
        assert_eq!(map.get("a", 1060), None);
        assert_eq!(map.get("b", 999_999).as_deref(), Some("2"));

        assert!(map.evict_expired(2000));
        assert!(!map.evict_expired(2000));
    }

    #[test]
    fn test_map_list_pages() {
        let mut map = KvMap::default();
        for key in ["user:a", "user:b", "user:c", "usr:x", "cred:a"] {
            map.put(key, "", None, 0);
        }

        let first = map.list("user:", 2, None, 0);
        assert_eq!(first.keys, vec!["user:a", "user:b"]);
        assert!(!first.list_complete);
        assert_eq!(first.cursor.as_deref(), Some("user:b"));

        let second = map.list("user:", 2, first.cursor.as_deref(), 0);
        assert_eq!(second.keys, vec!["user:c"]);
        assert!(second.list_complete);
        assert!(second.cursor.is_none());
    }

    #[test]
    fn test_map_list_skips_expired() {
        let mut map = KvMap::default();
        map.put("token:a", "", Some(10), 0);
        map.put("token:b", "", None, 0);
        let page = map.list("token:", 10, None, 50);
        assert_eq!(page.keys, vec!["token:b"]);
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let kv = MemoryKv::new();
        assert!(kv.get("missing").await.unwrap().is_none());

        kv.put("k", "v", None).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));

        kv.put("k", "v2", Some(3600)).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v2"));

        kv.delete("k").await.unwrap();
        assert!(kv.get("k").await.unwrap().is_none());
    }
}
