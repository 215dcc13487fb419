//! Stage adapter contracts
//!
//! The engine delegates all domain work through five narrow traits, one per
//! stage. Each call receives only the slice of state the stage needs.
//!
//! ```text
//! GenerateQueries  topic, clarifications, prior findings, iteration  → QueryPlan
//! Search           queries, processed urls                           → SearchOutcome
//! Analyze          topic, clarifications, findings, queries, iter.   → AnalysisResult
//! Validate         findings, topic                                   → ValidationResult
//! GenerateReport   topic, clarifications, findings, analysis, valid. → String
//! ```
//!
//! Concrete adapters live with the collaborators (model-backed generators,
//! search providers). [`WithFallback`] adds each stage's conservative
//! fallback, and [`CachedQueryGenerator`] consults the key-value cache.

mod cached;
mod fallback;

pub use cached::CachedQueryGenerator;
pub use fallback::{
    fallback_analysis, fallback_queries, fallback_report, fallback_validation, WithFallback,
    FALLBACK_SUFFICIENT_FINDINGS,
};

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::AdapterError;
use crate::state::{
    AnalysisResult, Clarifications, Finding, QueryPlan, SearchOutcome, ValidationResult,
};

/// Inputs for query generation
#[derive(Debug, Clone, Copy)]
pub struct QueryContext<'a> {
    pub topic: &'a str,
    pub clarifications: &'a Clarifications,
    pub prior_findings: &'a [Finding],
    pub iteration: u32,
}

/// Inputs for coverage analysis
#[derive(Debug, Clone, Copy)]
pub struct AnalysisContext<'a> {
    pub topic: &'a str,
    pub clarifications: &'a Clarifications,
    pub findings: &'a [Finding],
    pub queries: &'a [String],
    pub iteration: u32,
}

/// Inputs for the final report
#[derive(Debug, Clone, Copy)]
pub struct ReportContext<'a> {
    pub topic: &'a str,
    pub clarifications: &'a Clarifications,
    pub findings: &'a [Finding],
    pub analysis: Option<&'a AnalysisResult>,
    pub validation: Option<&'a ValidationResult>,
}

/// Generates the search queries for one iteration
#[async_trait]
pub trait QueryGenerator: Send + Sync {
    async fn generate_queries(&self, ctx: QueryContext<'_>) -> Result<QueryPlan, AdapterError>;
}

/// Fetches sources for a set of queries and turns them into findings.
///
/// Must never return a finding whose URL is in `processed_urls`.
#[async_trait]
pub trait Searcher: Send + Sync {
    async fn search(
        &self,
        queries: &[String],
        processed_urls: &[String],
    ) -> Result<SearchOutcome, AdapterError>;
}

/// Judges coverage and sufficiency of the findings so far
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, ctx: AnalysisContext<'_>) -> Result<AnalysisResult, AdapterError>;
}

/// Judges reliability of the findings so far
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, findings: &[Finding], topic: &str) -> Result<ValidationResult, AdapterError>;
}

/// Writes the final report
#[async_trait]
pub trait ReportWriter: Send + Sync {
    async fn generate_report(&self, ctx: ReportContext<'_>) -> Result<String, AdapterError>;
}

/// The full set of adapters a run needs.
///
/// Cheap to clone; every run gets its own handle to the shared adapters.
#[derive(Clone)]
pub struct StageAdapters {
    pub(crate) query_generator: Arc<dyn QueryGenerator>,
    pub(crate) searcher: Arc<dyn Searcher>,
    pub(crate) analyzer: Arc<dyn Analyzer>,
    pub(crate) validator: Arc<dyn Validator>,
    pub(crate) report_writer: Arc<dyn ReportWriter>,
}

impl StageAdapters {
    /// Use the adapters as given. Any error they return ends the run.
    pub fn new(
        query_generator: impl QueryGenerator + 'static,
        searcher: impl Searcher + 'static,
        analyzer: impl Analyzer + 'static,
        validator: impl Validator + 'static,
        report_writer: impl ReportWriter + 'static,
    ) -> Self {
        Self {
            query_generator: Arc::new(query_generator),
            searcher: Arc::new(searcher),
            analyzer: Arc::new(analyzer),
            validator: Arc::new(validator),
            report_writer: Arc::new(report_writer),
        }
    }

    /// Wrap query generation, analysis, validation and reporting in their
    /// stage fallbacks. Search has no fallback.
    pub fn with_fallbacks(
        query_generator: impl QueryGenerator + 'static,
        searcher: impl Searcher + 'static,
        analyzer: impl Analyzer + 'static,
        validator: impl Validator + 'static,
        report_writer: impl ReportWriter + 'static,
    ) -> Self {
        Self::new(
            WithFallback::new(query_generator),
            searcher,
            WithFallback::new(analyzer),
            WithFallback::new(validator),
            WithFallback::new(report_writer),
        )
    }
}

impl std::fmt::Debug for StageAdapters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageAdapters").finish_non_exhaustive()
    }
}
