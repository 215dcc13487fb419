//! Cache-first query generation
//!
//! Query plans are keyed by topic, clarifications and iteration, so a repeat
//! run of the same research reuses its earlier plans instead of asking the
//! model again.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use super::{QueryContext, QueryGenerator};
use crate::cache::{normalize_text, CacheKey, CachedExecution};
use crate::error::AdapterError;
use crate::state::{render_clarifications, QueryPlan};

/// Cache namespace for query plans
pub const QUERY_NAMESPACE: &str = "queries";

/// Wraps a [`QueryGenerator`] with [`CachedExecution`].
///
/// Only successful plans are written; failures always reach the caller.
#[derive(Debug, Clone)]
pub struct CachedQueryGenerator<G> {
    inner: G,
    cache: CachedExecution,
    ttl: Duration,
}

impl<G> CachedQueryGenerator<G> {
    pub fn new(inner: G, cache: CachedExecution, ttl: Duration) -> Self {
        Self { inner, cache, ttl }
    }

    fn key(ctx: &QueryContext<'_>) -> CacheKey {
        let iteration = ctx.iteration.to_string();
        CacheKey::derive(
            QUERY_NAMESPACE,
            &[
                &normalize_text(ctx.topic),
                &render_clarifications(ctx.clarifications),
                &iteration,
            ],
        )
    }
}

#[async_trait]
impl<G: QueryGenerator> QueryGenerator for CachedQueryGenerator<G> {
    async fn generate_queries(&self, ctx: QueryContext<'_>) -> Result<QueryPlan, AdapterError> {
        let key = Self::key(&ctx);
        let cached = self
            .cache
            .execute(&key, self.ttl, || self.inner.generate_queries(ctx))
            .await?;
        debug!(key = %key, outcome = ?cached.outcome, "Query plan resolved");
        Ok(cached.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::state::Clarifications;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl QueryGenerator for Counting {
        async fn generate_queries(&self, ctx: QueryContext<'_>) -> Result<QueryPlan, AdapterError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(QueryPlan::new(
                vec![format!("{} #{}", ctx.topic, n)],
                "counting",
            ))
        }
    }

    fn ctx<'a>(topic: &'a str, clarifications: &'a Clarifications, iteration: u32) -> QueryContext<'a> {
        QueryContext {
            topic,
            clarifications,
            prior_findings: &[],
            iteration,
        }
    }

    #[tokio::test]
    async fn test_repeat_call_is_served_from_cache() {
        let exec = CachedExecution::new(Arc::new(MemoryCache::new()));
        let generator = CachedQueryGenerator::new(Counting::default(), exec.clone(), Duration::from_secs(60));
        let clarifications = Clarifications::new();

        let first = generator.generate_queries(ctx("ocean acidification", &clarifications, 1)).await.unwrap();
        let second = generator.generate_queries(ctx("  Ocean   Acidification", &clarifications, 1)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(generator.inner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(exec.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_iteration_and_clarifications_change_the_key() {
        let exec = CachedExecution::new(Arc::new(MemoryCache::new()));
        let generator = CachedQueryGenerator::new(Counting::default(), exec, Duration::from_secs(60));
        let none = Clarifications::new();
        let mut scoped = Clarifications::new();
        scoped.insert("region".to_string(), "EU".to_string());

        generator.generate_queries(ctx("t", &none, 1)).await.unwrap();
        generator.generate_queries(ctx("t", &none, 2)).await.unwrap();
        generator.generate_queries(ctx("t", &scoped, 1)).await.unwrap();

        assert_eq!(generator.inner.calls.load(Ordering::SeqCst), 3);
    }
}
