//! research-flow: iterative research workflow engine
//!
//! A run moves a [`ResearchState`] through five stages (query generation,
//! search, analysis, validation, report) and loops until the findings are
//! sufficient and valid, or the iteration budget is spent.
//!
//! - [`WorkflowEngine`]: the state machine, exposed as a lazy event stream
//! - [`decide`]: the pure continuation policy
//! - Stage adapter traits ([`QueryGenerator`], [`Searcher`], [`Analyzer`],
//!   [`Validator`], [`ReportWriter`]) with [`WithFallback`] and caching
//! - [`ConcurrentSearch`]: bounded fan-out over a [`SearchProvider`]
//! - [`ResearchOrchestrator`]: request validation, persistence, snapshots
//!
//! ```rust,ignore
//! use research_flow::{ResearchOrchestrator, ResearchRequest, StageAdapters};
//! use futures::StreamExt;
//!
//! let adapters = StageAdapters::with_fallbacks(queries, search, analyzer, validator, writer);
//! let orchestrator = ResearchOrchestrator::new(adapters, store, cache, ResearchConfig::default())?;
//!
//! let record = orchestrator.initialize_research(ResearchRequest::new("grid-scale storage")).await?;
//! let mut run = orchestrator.execute_research(&record.id).await?;
//! while let Some(event) = run.next().await {
//!     println!("{}", event.to_json()?);
//! }
//! ```

pub mod adapters;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod policy;
pub mod progress;
pub mod search;
pub mod state;
pub mod store;

pub use adapters::{
    AnalysisContext, Analyzer, CachedQueryGenerator, QueryContext, QueryGenerator, ReportContext,
    ReportWriter, Searcher, StageAdapters, Validator, WithFallback,
};
pub use cache::{
    CacheKey, CacheOutcome, CacheStats, CacheStatsSnapshot, Cached, CachedExecution, KeyValueCache,
    MemoryCache,
};
#[cfg(feature = "cache-redis")]
pub use cache::RedisCache;
pub use config::{CacheTtls, ResearchConfig};
pub use engine::{EngineEvent, WorkflowEngine};
pub use error::{AdapterError, CacheError, StoreError, WorkflowError};
pub use orchestrator::{ResearchOrchestrator, ResearchRequest, ResearchRun};
pub use policy::{decide, Decision};
pub use progress::{ProgressEvent, StagePayload};
pub use search::{
    ConcurrentSearch, Embedder, EmbeddingIngestor, PassthroughIngestor, SearchHit, SearchProvider,
    SourceIngestor,
};
pub use state::{
    AnalysisResult, Clarifications, Finding, QueryPlan, ResearchState, ResearchStatus,
    SearchOutcome, Stage, StageUpdate, ValidationResult,
};
pub use store::{FileStore, MemoryStore, ResearchRecord, ResearchStore};
