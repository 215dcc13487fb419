//! Research run configuration
//!
//! Bounds for the iteration loop, search fan-out and source size, plus the
//! TTLs of each cache namespace.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::WorkflowError;

/// Longest topic accepted by the orchestrator, in characters
pub const MAX_TOPIC_CHARS: usize = 500;

/// Shortest topic accepted by the orchestrator, in characters
pub const MIN_TOPIC_CHARS: usize = 3;

/// Research workflow configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResearchConfig {
    /// Iteration bound applied when a request does not set one
    pub max_iterations: u32,

    /// Per-query fetches in flight at once
    pub max_concurrent_searches: usize,

    /// Results requested from the provider per query
    pub max_search_results: usize,

    /// Finding content is truncated to this many characters
    pub max_finding_chars: usize,

    /// Cache lifetimes per namespace
    pub cache_ttl: CacheTtls,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            max_concurrent_searches: 3,
            max_search_results: 10,
            max_finding_chars: 2000,
            cache_ttl: CacheTtls::default(),
        }
    }
}

impl ResearchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    /// Set search fan-out (at least 1)
    pub fn with_max_concurrent_searches(mut self, n: usize) -> Self {
        self.max_concurrent_searches = n.max(1);
        self
    }

    pub fn with_max_search_results(mut self, n: usize) -> Self {
        self.max_search_results = n;
        self
    }

    pub fn with_max_finding_chars(mut self, n: usize) -> Self {
        self.max_finding_chars = n;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: CacheTtls) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.max_iterations == 0 {
            return Err(WorkflowError::config("max_iterations must be at least 1"));
        }
        if self.max_concurrent_searches == 0 {
            return Err(WorkflowError::config("max_concurrent_searches must be at least 1"));
        }
        if self.max_search_results == 0 {
            return Err(WorkflowError::config("max_search_results must be at least 1"));
        }
        if self.max_finding_chars == 0 {
            return Err(WorkflowError::config("max_finding_chars must be at least 1"));
        }
        self.cache_ttl.validate()
    }
}

/// TTL for each cache namespace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheTtls {
    #[serde(with = "humantime_serde")]
    pub queries: Duration,

    #[serde(with = "humantime_serde")]
    pub search: Duration,

    #[serde(with = "humantime_serde")]
    pub embedding: Duration,

    /// Final research results and live snapshots
    #[serde(with = "humantime_serde")]
    pub result: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            queries: Duration::from_secs(3600),
            search: Duration::from_secs(3600),
            embedding: Duration::from_secs(86400),
            result: Duration::from_secs(3600),
        }
    }
}

impl CacheTtls {
    /// Same TTL for queries, search and results; embeddings keep their own
    pub fn uniform(ttl: Duration) -> Self {
        Self {
            queries: ttl,
            search: ttl,
            result: ttl,
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<(), WorkflowError> {
        let ttls = [
            ("queries", self.queries),
            ("search", self.search),
            ("embedding", self.embedding),
            ("result", self.result),
        ];
        match ttls.iter().find(|(_, ttl)| ttl.is_zero()) {
            Some((name, _)) => Err(WorkflowError::config(format!("{} cache TTL must be non-zero", name))),
            None => Ok(()),
        }
    }
}
