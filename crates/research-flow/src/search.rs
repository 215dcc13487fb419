//! Concurrent multi-query search
//!
//! [`ConcurrentSearch`] implements the search stage on top of two smaller
//! collaborators:
//!
//! - a [`SearchProvider`] that answers one query at a time
//! - a [`SourceIngestor`] that turns a raw hit into a [`Finding`]
//!
//! ```text
//! queries ──▶ buffered(max_concurrent) ──▶ per-query hits (query order)
//!                 │ cache "search:"            │
//!                 ▼                            ▼
//!            provider.search          drop processed / duplicate URLs
//!                                              │
//!                                              ▼
//!                                     ingest ──▶ SearchOutcome
//! ```

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::adapters::Searcher;
use crate::cache::{normalize_text, CacheKey, CachedExecution};
use crate::config::ResearchConfig;
use crate::error::AdapterError;
use crate::state::{Finding, SearchOutcome};

/// Cache namespace for per-query search results
pub const SEARCH_NAMESPACE: &str = "search";

/// Cache namespace for content embeddings
pub const EMBEDDING_NAMESPACE: &str = "embedding";

/// One result returned by a search provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    pub content: String,
    #[serde(default)]
    pub published_date: Option<String>,
    pub relevance_score: f32,
}

impl SearchHit {
    pub fn new(url: impl Into<String>, content: impl Into<String>, relevance_score: f32) -> Self {
        Self {
            url: url.into(),
            title: None,
            content: content.into(),
            published_date: None,
            relevance_score,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// A web search backend answering a single query
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>, AdapterError>;
}

/// Turns a raw search hit into a finding
#[async_trait]
pub trait SourceIngestor: Send + Sync {
    async fn ingest(&self, hit: SearchHit) -> Result<Finding, AdapterError>;
}

/// Produces embedding vectors for finding content
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AdapterError>;
}

/// Truncate to at most `max_chars` characters, on a char boundary
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Keeps the hit as-is apart from truncating its content
#[derive(Debug, Clone)]
pub struct PassthroughIngestor {
    max_chars: usize,
}

impl PassthroughIngestor {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }
}

impl Default for PassthroughIngestor {
    fn default() -> Self {
        Self::new(ResearchConfig::default().max_finding_chars)
    }
}

#[async_trait]
impl SourceIngestor for PassthroughIngestor {
    async fn ingest(&self, hit: SearchHit) -> Result<Finding, AdapterError> {
        if hit.content.trim().is_empty() {
            return Err(AdapterError::call(format!("empty content for {}", hit.url)));
        }

        let content = truncate_chars(&hit.content, self.max_chars);
        let mut finding = Finding::new(hit.url.as_str(), content, hit.relevance_score);
        finding.title = hit.title;
        finding.published_date = hit.published_date;
        Ok(finding)
    }
}

/// Passthrough ingestion plus a content embedding.
///
/// Embeddings go through the `embedding:` cache namespace when a cache is
/// attached.
pub struct EmbeddingIngestor<E> {
    base: PassthroughIngestor,
    embedder: E,
    cache: Option<(CachedExecution, Duration)>,
}

impl<E: Embedder> EmbeddingIngestor<E> {
    pub fn new(embedder: E, max_chars: usize) -> Self {
        Self {
            base: PassthroughIngestor::new(max_chars),
            embedder,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: CachedExecution, ttl: Duration) -> Self {
        self.cache = Some((cache, ttl));
        self
    }
}

#[async_trait]
impl<E: Embedder> SourceIngestor for EmbeddingIngestor<E> {
    async fn ingest(&self, hit: SearchHit) -> Result<Finding, AdapterError> {
        let finding = self.base.ingest(hit).await?;

        let embedding = match &self.cache {
            Some((cache, ttl)) => {
                let key = CacheKey::derive(EMBEDDING_NAMESPACE, &[&normalize_text(&finding.content)]);
                cache
                    .execute(&key, *ttl, || self.embedder.embed(&finding.content))
                    .await?
                    .value
            }
            None => self.embedder.embed(&finding.content).await?,
        };

        Ok(finding.with_embedding(embedding))
    }
}

/// The search stage: fan out over all queries with bounded concurrency.
pub struct ConcurrentSearch<P, I = PassthroughIngestor> {
    provider: P,
    ingestor: I,
    cache: Option<(CachedExecution, Duration)>,
    max_concurrent: usize,
    max_results: usize,
}

impl<P: SearchProvider> ConcurrentSearch<P, PassthroughIngestor> {
    /// Build from a provider using the configured bounds
    pub fn new(provider: P, config: &ResearchConfig) -> Self {
        Self::with_ingestor(provider, PassthroughIngestor::new(config.max_finding_chars), config)
    }
}

impl<P: SearchProvider, I: SourceIngestor> ConcurrentSearch<P, I> {
    pub fn with_ingestor(provider: P, ingestor: I, config: &ResearchConfig) -> Self {
        Self {
            provider,
            ingestor,
            cache: None,
            max_concurrent: config.max_concurrent_searches.max(1),
            max_results: config.max_search_results,
        }
    }

    /// Cache per-query provider results
    pub fn with_cache(mut self, cache: CachedExecution, ttl: Duration) -> Self {
        self.cache = Some((cache, ttl));
        self
    }

    /// Hits for one query. A failed query contributes nothing.
    async fn fetch(&self, query: &str) -> Vec<SearchHit> {
        let result = match &self.cache {
            Some((cache, ttl)) => {
                let max_results = self.max_results.to_string();
                let key = CacheKey::derive(SEARCH_NAMESPACE, &[&normalize_text(query), &max_results]);
                cache
                    .execute(&key, *ttl, || self.provider.search(query, self.max_results))
                    .await
                    .map(|cached| cached.value)
            }
            None => self.provider.search(query, self.max_results).await,
        };

        match result {
            Ok(hits) => {
                debug!(query, hits = hits.len(), "Query answered");
                hits
            }
            Err(e) => {
                warn!(query, error = %e, "Search failed for query, skipping");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl<P: SearchProvider, I: SourceIngestor> Searcher for ConcurrentSearch<P, I> {
    async fn search(
        &self,
        queries: &[String],
        processed_urls: &[String],
    ) -> Result<SearchOutcome, AdapterError> {
        // buffered() yields in input order regardless of completion order
        let per_query: Vec<Vec<SearchHit>> = stream::iter(queries.iter().cloned())
            .map(|query| async move { self.fetch(&query).await })
            .buffered(self.max_concurrent)
            .collect()
            .await;

        let mut seen: HashSet<String> = processed_urls.iter().cloned().collect();
        let fresh: Vec<SearchHit> = per_query
            .into_iter()
            .flatten()
            .filter(|hit| !hit.url.is_empty() && seen.insert(hit.url.clone()))
            .collect();

        let ingested: Vec<(String, Result<Finding, AdapterError>)> = stream::iter(fresh)
            .map(|hit| async move {
                let url = hit.url.clone();
                (url, self.ingestor.ingest(hit).await)
            })
            .buffered(self.max_concurrent)
            .collect()
            .await;

        let mut outcome = SearchOutcome::default();
        for (url, result) in ingested {
            match result {
                Ok(finding) => {
                    outcome.new_urls.push(url);
                    outcome.new_findings.push(finding);
                }
                Err(e) => warn!(url = %url, error = %e, "Ingestion failed, dropping source"),
            }
        }

        info!(
            queries = queries.len(),
            new_sources = outcome.new_urls.len(),
            "Search stage complete"
        );
        Ok(outcome)
    }
}
