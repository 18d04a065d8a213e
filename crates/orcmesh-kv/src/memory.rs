//! Default, in-process [`KvStore`] implementation.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::KvResult;
use crate::store::KvStore;

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        matches!(self.expires_at, Some(at) if Instant::now() >= at)
    }
}

/// An in-memory [`KvStore`] backed by a single `RwLock<HashMap>`.
///
/// This is the default backend: no external dependency, no persistence
/// across process restarts. Expired entries are removed lazily (on `get`,
/// `keys`, and `size`) rather than by a background sweep, matching the
/// core's "abstract key/value" contract -- periodic eviction of knowledge
/// entries is the Knowledge Store's job, not the KV store's.
#[derive(Default)]
pub struct MemoryKv {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryKv {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> KvResult<()> {
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.entries
            .write()
            .await
            .insert(key.to_owned(), Entry { value, expires_at });
        Ok(())
    }

    async fn get(&self, key: &str) -> KvResult<Option<Vec<u8>>> {
        // Fast path under a read lock; only escalate to a write lock when we
        // actually need to prune an expired entry.
        let expired = {
            let guard = self.entries.read().await;
            match guard.get(key) {
                Some(entry) if entry.is_expired() => true,
                Some(entry) => return Ok(Some(entry.value.clone())),
                None => return Ok(None),
            }
        };
        if expired {
            self.entries.write().await.remove(key);
        }
        Ok(None)
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn keys(&self) -> KvResult<Vec<String>> {
        let mut guard = self.entries.write().await;
        guard.retain(|_, entry| !entry.is_expired());
        Ok(guard.keys().cloned().collect())
    }

    async fn size(&self) -> KvResult<usize> {
        let mut guard = self.entries.write().await;
        guard.retain(|_, entry| !entry.is_expired());
        Ok(guard.len())
    }

    async fn clear(&self) -> KvResult<()> {
        self.entries.write().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_roundtrips() {
        let kv = MemoryKv::new();
        kv.set("a", b"hello".to_vec(), None).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn get_missing_returns_none() {
        let kv = MemoryKv::new();
        assert_eq!(kv.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_overwrites() {
        let kv = MemoryKv::new();
        kv.set("a", b"one".to_vec(), None).await.unwrap();
        kv.set("a", b"two".to_vec(), None).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), Some(b"two".to_vec()));
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let kv = MemoryKv::new();
        kv.set("a", b"one".to_vec(), None).await.unwrap();
        kv.delete("a").await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_missing_is_noop() {
        let kv = MemoryKv::new();
        kv.delete("missing").await.unwrap();
    }

    #[tokio::test]
    async fn keys_and_size_reflect_contents() {
        let kv = MemoryKv::new();
        kv.set("a", b"1".to_vec(), None).await.unwrap();
        kv.set("b", b"2".to_vec(), None).await.unwrap();
        assert_eq!(kv.size().await.unwrap(), 2);
        let mut keys = kv.keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let kv = MemoryKv::new();
        kv.set("a", b"1".to_vec(), None).await.unwrap();
        kv.clear().await.unwrap();
        assert_eq!(kv.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn ttl_expires_entry() {
        let kv = MemoryKv::new();
        kv.set("a", b"1".to_vec(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert_eq!(kv.get("a").await.unwrap(), Some(b"1".to_vec()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(kv.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_entry_excluded_from_keys_and_size() {
        let kv = MemoryKv::new();
        kv.set("a", b"1".to_vec(), Some(Duration::from_millis(5)))
            .await
            .unwrap();
        kv.set("b", b"2".to_vec(), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(kv.size().await.unwrap(), 1);
        assert_eq!(kv.keys().await.unwrap(), vec!["b".to_string()]);
    }
}
