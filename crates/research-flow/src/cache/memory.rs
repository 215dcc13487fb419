//! In-process cache with per-entry expiry

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::KeyValueCache;
use crate::error::CacheError;

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// HashMap-backed cache. Expired entries are dropped on read and swept on
/// every write, so keys that are never read again do not accumulate.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl KeyValueCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if entry.expires_at > now => return Ok(Some(entry.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }

        // Expired: take the write lock and evict
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|e| e.expires_at <= now) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let now = Instant::now();
        let entry = Entry {
            value: value.to_vec(),
            expires_at: now + ttl,
        };
        let mut entries = self.entries.write().await;
        entries.retain(|_, e| e.expires_at > now);
        entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let cache = MemoryCache::new();
        cache.put("a", b"1", Duration::from_secs(60)).await.unwrap();

        assert_eq!(cache.get("a").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(cache.len().await, 1);

        cache.delete("a").await.unwrap();
        assert_eq!(cache.get("a").await.unwrap(), None);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let cache = MemoryCache::new();
        cache.put("short", b"x", Duration::from_millis(20)).await.unwrap();
        cache.put("long", b"y", Duration::from_secs(60)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(cache.get("short").await.unwrap(), None);
        assert_eq!(cache.get("long").await.unwrap(), Some(b"y".to_vec()));
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_write_sweeps_expired_entries() {
        let cache = MemoryCache::new();
        for i in 0..1000 {
            let key = format!("embedding:{}", i);
            cache.put(&key, b"v", Duration::from_millis(1)).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.put("fresh", b"v", Duration::from_secs(60)).await.unwrap();

        assert_eq!(cache.entries.read().await.len(), 1);
        assert_eq!(cache.len().await, 1);
    }
}
