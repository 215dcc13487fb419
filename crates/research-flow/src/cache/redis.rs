//! Redis cache transport
//!
//! Entries are written with `SET key value EX ttl`; Redis handles expiry.
//! Values may be zstd-compressed, which pays off for embedding vectors and
//! search payloads.
//!
//! ```ignore
//! let cache = RedisCache::new("redis://localhost:6379").await?.with_compression(true);
//! let exec = CachedExecution::new(Arc::new(cache));
//! ```

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;

use super::KeyValueCache;
use crate::error::CacheError;

/// Redis-backed [`KeyValueCache`]
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    compression: bool,
}

impl RedisCache {
    /// Connect to Redis. Fails fast when the server is unreachable.
    pub async fn new(url: impl AsRef<str>) -> Result<Self, CacheError> {
        let client = redis::Client::open(url.as_ref())
            .map_err(|e| CacheError::Unavailable(format!("Invalid Redis URL: {}", e)))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| CacheError::Unavailable(format!("Failed to connect to Redis: {}", e)))?;

        Ok(Self {
            conn,
            compression: false,
        })
    }

    pub fn with_compression(mut self, compression: bool) -> Self {
        self.compression = compression;
        self
    }

    fn compress(data: &[u8]) -> Result<Vec<u8>, CacheError> {
        zstd::stream::encode_all(data, 3)
            .map_err(|e| CacheError::Serialization(format!("Compression failed: {}", e)))
    }

    fn decompress(key: &str, data: &[u8]) -> Result<Vec<u8>, CacheError> {
        zstd::stream::decode_all(data).map_err(|e| CacheError::Corrupt {
            key: key.to_string(),
            message: format!("Decompression failed: {}", e),
        })
    }
}

#[async_trait]
impl KeyValueCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.conn.clone();
        let data: Option<Vec<u8>> = conn
            .get(key)
            .await
            .map_err(|e| CacheError::Unavailable(format!("GET {} failed: {}", key, e)))?;

        match data {
            Some(bytes) if self.compression => Self::decompress(key, &bytes).map(Some),
            other => Ok(other),
        }
    }

    async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let data = if self.compression {
            Self::compress(value)?
        } else {
            value.to_vec()
        };

        // EX 0 is rejected by Redis
        let seconds = ttl.as_secs().max(1);
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, data, seconds)
            .await
            .map_err(|e| CacheError::Unavailable(format!("SET {} failed: {}", key, e)))
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| CacheError::Unavailable(format!("DEL {} failed: {}", key, e)))
    }
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache")
            .field("compression", &self.compression)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_round_trip() {
        let payload = serde_json::to_vec(&vec![0.25f32; 256]).unwrap();
        let packed = RedisCache::compress(&payload).unwrap();
        assert!(packed.len() < payload.len());
        assert_eq!(RedisCache::decompress("k", &packed).unwrap(), payload);
    }

    #[test]
    fn test_decompress_garbage_is_corrupt() {
        let err = RedisCache::decompress("k", b"plain text").unwrap_err();
        assert!(matches!(err, CacheError::Corrupt { .. }));
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn test_redis_put_get() {
        let cache = RedisCache::new("redis://127.0.0.1:6379").await.unwrap();
        cache.put("research-flow:test", b"v", Duration::from_secs(5)).await.unwrap();
        assert_eq!(
            cache.get("research-flow:test").await.unwrap(),
            Some(b"v".to_vec())
        );
        cache.delete("research-flow:test").await.unwrap();
    }
}
