//! Cache-augmented execution
//!
//! Wraps any stage call with a key-value cache lookup:
//!
//! ```text
//!            ┌──────────── hit ────────────┐
//! key ──▶ cache.get ──▶ miss ──▶ call ──▶ cache.put(ttl) ──▶ result
//!            └── error / corrupt entry ──▶ treated as miss
//! ```
//!
//! Keys are `namespace:` followed by the hex SHA-256 of the length-prefixed
//! input parts, so they are stable across processes and platforms.
//!
//! # Transports
//!
//! - [`MemoryCache`]: in-process map with per-entry expiry
//! - `RedisCache`: Redis `SET EX`, behind the `cache-redis` feature

mod memory;
#[cfg(feature = "cache-redis")]
mod redis;

pub use memory::MemoryCache;
#[cfg(feature = "cache-redis")]
pub use self::redis::RedisCache;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::CacheError;

/// Hex SHA-256 over length-prefixed parts.
///
/// Length prefixes keep `["ab", "c"]` and `["a", "bc"]` apart.
pub fn content_hash(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Canonical form of free text used in cache keys: trimmed, lowercased,
/// whitespace collapsed.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// A cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive a key from the semantically relevant inputs of a call
    pub fn derive(namespace: &str, parts: &[&str]) -> Self {
        Self(format!("{}:{}", namespace, content_hash(parts)))
    }

    /// Use a literal key (e.g. `research:{id}:state`)
    pub fn literal(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key-value store consumed by the cache wrapper.
///
/// Values are opaque bytes; entries are immutable once written.
#[async_trait]
pub trait KeyValueCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// Whether a result came from the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOutcome {
    Hit,
    Miss,
}

/// A result plus the hit/miss signal
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<T> {
    pub value: T,
    pub outcome: CacheOutcome,
}

impl<T> Cached<T> {
    pub fn is_hit(&self) -> bool {
        self.outcome == CacheOutcome::Hit
    }
}

/// Running hit/miss counters
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

impl CacheStats {
    fn record(&self, outcome: CacheOutcome) {
        match outcome {
            CacheOutcome::Hit => self.hits.fetch_add(1, Ordering::Relaxed),
            CacheOutcome::Miss => self.misses.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStatsSnapshot {
            hits,
            misses,
            errors: self.errors.load(Ordering::Relaxed),
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
        }
    }
}

/// Point-in-time copy of [`CacheStats`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub hit_rate: f64,
}

/// Cache-first execution around arbitrary calls.
///
/// Cache faults never block the underlying call: a failed read is a miss and
/// a failed write is logged and dropped. Errors from the call itself are
/// returned as-is and nothing is stored.
#[derive(Clone)]
pub struct CachedExecution {
    cache: Arc<dyn KeyValueCache>,
    stats: Arc<CacheStats>,
}

impl CachedExecution {
    pub fn new(cache: Arc<dyn KeyValueCache>) -> Self {
        Self {
            cache,
            stats: Arc::new(CacheStats::default()),
        }
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// Read and decode an entry. Any fault is reported as `None`.
    pub async fn lookup<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let bytes = match self.cache.get(key.as_str()).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache read failed, treating as miss");
                self.stats.record_error();
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                let err = CacheError::Corrupt {
                    key: key.to_string(),
                    message: e.to_string(),
                };
                warn!(error = %err, "Discarding corrupt cache entry");
                self.stats.record_error();
                None
            }
        }
    }

    /// Encode and write an entry. Faults are logged, never returned.
    pub async fn store<T: Serialize + ?Sized>(&self, key: &CacheKey, value: &T, ttl: Duration) {
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key = %key, error = %CacheError::Serialization(e.to_string()), "Cache write skipped");
                self.stats.record_error();
                return;
            }
        };
        if let Err(e) = self.cache.put(key.as_str(), &bytes, ttl).await {
            warn!(key = %key, error = %e, "Cache write failed");
            self.stats.record_error();
        }
    }

    /// Return the cached value for `key`, or run `call` and cache its result.
    pub async fn execute<T, E, F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        call: F,
    ) -> Result<Cached<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.lookup::<T>(key).await {
            debug!(key = %key, "Cache hit");
            self.stats.record(CacheOutcome::Hit);
            return Ok(Cached {
                value,
                outcome: CacheOutcome::Hit,
            });
        }

        self.stats.record(CacheOutcome::Miss);
        let value = call().await?;
        self.store(key, &value, ttl).await;

        Ok(Cached {
            value,
            outcome: CacheOutcome::Miss,
        })
    }
}

impl std::fmt::Debug for CachedExecution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedExecution")
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Cache whose every operation fails
    struct BrokenCache;

    #[async_trait]
    impl KeyValueCache for BrokenCache {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }

        async fn put(&self, _key: &str, _value: &[u8], _ttl: Duration) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }

        async fn delete(&self, _key: &str) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
    }

    #[test]
    fn test_content_hash_is_stable_and_prefix_safe() {
        assert_eq!(content_hash(&["a", "b"]), content_hash(&["a", "b"]));
        assert_ne!(content_hash(&["ab", "c"]), content_hash(&["a", "bc"]));
        assert_eq!(content_hash(&["x"]).len(), 64);
    }

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("  Grid   Storage\tCosts "), "grid storage costs");
    }

    #[test]
    fn test_cache_key_derive() {
        let key = CacheKey::derive("search", &["battery chemistry"]);
        assert!(key.as_str().starts_with("search:"));
        assert_eq!(key, CacheKey::derive("search", &["battery chemistry"]));
        assert_ne!(key, CacheKey::derive("embedding", &["battery chemistry"]));
    }

    #[tokio::test]
    async fn test_hit_and_miss_return_equal_values() {
        let exec = CachedExecution::new(Arc::new(MemoryCache::new()));
        let key = CacheKey::derive("queries", &["topic", "1"]);
        let calls = AtomicUsize::new(0);

        let first: Cached<Vec<String>> = exec
            .execute(&key, Duration::from_secs(60), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, CacheError>(vec!["q1".to_string(), "q2".to_string()])
            })
            .await
            .unwrap();
        let second: Cached<Vec<String>> = exec
            .execute(&key, Duration::from_secs(60), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, CacheError>(vec!["different".to_string()])
            })
            .await
            .unwrap();

        assert_eq!(first.outcome, CacheOutcome::Miss);
        assert!(second.is_hit());
        assert_eq!(first.value, second.value);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = exec.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_broken_cache_degrades_to_miss() {
        let exec = CachedExecution::new(Arc::new(BrokenCache));
        let key = CacheKey::literal("k");

        let result: Cached<u32> = exec
            .execute(&key, Duration::from_secs(1), || async { Ok::<_, CacheError>(7) })
            .await
            .unwrap();

        assert_eq!(result.value, 7);
        assert_eq!(result.outcome, CacheOutcome::Miss);
        assert_eq!(exec.stats().errors, 2);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_forced_miss() {
        let cache = Arc::new(MemoryCache::new());
        cache.put("k", b"not json", Duration::from_secs(60)).await.unwrap();
        let exec = CachedExecution::new(cache);

        let result: Cached<u32> = exec
            .execute(&CacheKey::literal("k"), Duration::from_secs(60), || async {
                Ok::<_, CacheError>(3)
            })
            .await
            .unwrap();

        assert_eq!(result.value, 3);
        assert_eq!(result.outcome, CacheOutcome::Miss);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let exec = CachedExecution::new(Arc::new(MemoryCache::new()));
        let key = CacheKey::literal("k");

        let failed: Result<Cached<u32>, &str> = exec
            .execute(&key, Duration::from_secs(60), || async { Err("upstream down") })
            .await;
        assert!(failed.is_err());

        let result: Cached<u32> = exec
            .execute(&key, Duration::from_secs(60), || async { Ok::<_, &str>(9) })
            .await
            .unwrap();
        assert_eq!(result.outcome, CacheOutcome::Miss);
        assert_eq!(result.value, 9);
    }
}
