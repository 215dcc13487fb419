//! Research orchestrator
//!
//! Caller-level wrapper around the engine. It owns the things a single run
//! should not know about:
//!
//! - request validation and record creation in the [`ResearchStore`]
//! - publishing each snapshot (watch channel + `research:{id}:state`)
//! - the terminal status write, and the result cache
//!
//! ```text
//! initialize_research ──▶ store.save (Initialized)
//! execute_research    ──▶ claim (store: GeneratingQueries)
//!                     ──▶ engine.run ──▶ ProgressEvent stream
//!                                         │ every event: snapshot → watch + cache
//!                                         └ terminal:    store.update_status
//! ResearchRun dropped before a terminal event ──▶ store: Failed (cancelled)
//! get_research_result ──▶ cache "research:{id}:result" ─miss─▶ store ──▶ write back
//! ```

use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::adapters::StageAdapters;
use crate::cache::{CacheKey, CacheStatsSnapshot, CachedExecution};
use crate::config::{ResearchConfig, MAX_TOPIC_CHARS, MIN_TOPIC_CHARS};
use crate::engine::{EngineEvent, WorkflowEngine};
use crate::error::WorkflowError;
use crate::progress::ProgressEvent;
use crate::state::{Clarifications, ResearchState, ResearchStatus};
use crate::store::{ResearchRecord, ResearchStore};

fn state_key(id: &str) -> CacheKey {
    CacheKey::literal(format!("research:{}:state", id))
}

fn result_key(id: &str) -> CacheKey {
    CacheKey::literal(format!("research:{}:result", id))
}

/// A request to start new research
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResearchRequest {
    pub topic: String,
    pub clarifications: Clarifications,
    pub user_id: Option<String>,
    /// Falls back to the configured bound when unset
    pub max_iterations: Option<u32>,
}

impl ResearchRequest {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Default::default()
        }
    }

    pub fn with_clarification(mut self, question: impl Into<String>, answer: impl Into<String>) -> Self {
        self.clarifications.insert(question.into(), answer.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = Some(max);
        self
    }

    pub fn validate(&self) -> Result<(), WorkflowError> {
        let chars = self.topic.trim().chars().count();
        if !(MIN_TOPIC_CHARS..=MAX_TOPIC_CHARS).contains(&chars) {
            return Err(WorkflowError::config(format!(
                "topic must be {}-{} characters, got {}",
                MIN_TOPIC_CHARS, MAX_TOPIC_CHARS, chars
            )));
        }
        if self.max_iterations == Some(0) {
            return Err(WorkflowError::config("max_iterations must be at least 1"));
        }
        Ok(())
    }
}

/// Runs research tasks end to end
pub struct ResearchOrchestrator {
    adapters: StageAdapters,
    store: Arc<dyn ResearchStore>,
    cache: CachedExecution,
    config: ResearchConfig,
    /// Ids whose claim is being written
    claiming: Arc<Mutex<HashSet<String>>>,
}

/// Holds an id in the claiming set until dropped
struct ClaimGuard {
    claiming: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl ClaimGuard {
    fn acquire(claiming: &Arc<Mutex<HashSet<String>>>, id: &str) -> Option<Self> {
        let inserted = claiming
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string());
        inserted.then(|| Self {
            claiming: Arc::clone(claiming),
            id: id.to_string(),
        })
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.claiming
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

impl ResearchOrchestrator {
    pub fn new(
        adapters: StageAdapters,
        store: Arc<dyn ResearchStore>,
        cache: CachedExecution,
        config: ResearchConfig,
    ) -> Result<Self, WorkflowError> {
        config.validate()?;
        Ok(Self {
            adapters,
            store,
            cache,
            config,
            claiming: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn config(&self) -> &ResearchConfig {
        &self.config
    }

    /// Validate a request and record it as a new research task
    pub async fn initialize_research(&self, request: ResearchRequest) -> Result<ResearchRecord, WorkflowError> {
        request.validate()?;

        let max_iterations = request.max_iterations.unwrap_or(self.config.max_iterations);
        let mut record = ResearchRecord::new(Uuid::new_v4().to_string(), request.topic.trim(), max_iterations);
        record.clarifications = request.clarifications;
        record.user_id = request.user_id;

        self.store.save_research(&record).await?;
        info!(research_id = %record.id, topic = %record.topic, "Research initialized");
        Ok(record)
    }

    /// Start executing a previously initialized task.
    ///
    /// The record is claimed (moved out of `Initialized`) before this returns,
    /// so a task runs at most once. Nothing else runs until the returned
    /// [`ResearchRun`] is polled.
    pub async fn execute_research(&self, research_id: &str) -> Result<ResearchRun, WorkflowError> {
        let Some(_claim) = ClaimGuard::acquire(&self.claiming, research_id) else {
            return Err(WorkflowError::InvalidInitialState(format!(
                "research {} is already being started",
                research_id
            )));
        };

        let record = self.store.get_research(research_id).await?;
        if record.status != ResearchStatus::Initialized {
            return Err(WorkflowError::InvalidInitialState(format!(
                "research {} is already {}",
                research_id, record.status
            )));
        }
        let record = self
            .store
            .update_status(research_id, ResearchStatus::GeneratingQueries, None, None)
            .await?;

        let initial = ResearchState::new(record.id.as_str(), record.topic.as_str())
            .with_clarifications(record.clarifications.clone())
            .with_max_iterations(record.max_iterations);

        let cancel = CancellationToken::new();
        let engine = WorkflowEngine::new(self.adapters.clone()).with_cancellation(cancel.clone());
        let (snapshots, snapshot_rx) = watch::channel(initial.clone());
        let settled = Arc::new(AtomicBool::new(false));

        let relay = Relay {
            research_id: record.id.clone(),
            events: engine.run(initial),
            store: Arc::clone(&self.store),
            cache: self.cache.clone(),
            ttl: self.config.cache_ttl.result,
            snapshots,
            settled: Arc::clone(&settled),
        };

        Ok(ResearchRun {
            research_id: record.id,
            events: stream::unfold(relay, Relay::next).boxed(),
            snapshot: snapshot_rx,
            cancel,
            store: Arc::clone(&self.store),
            settled,
        })
    }

    /// Final record of a task: result cache first, then the store.
    pub async fn get_research_result(&self, research_id: &str) -> Result<ResearchRecord, WorkflowError> {
        let key = result_key(research_id);
        if let Some(record) = self.cache.lookup::<ResearchRecord>(&key).await {
            return Ok(record);
        }

        let record = self.store.get_research(research_id).await?;
        // Only terminal records are stable enough to cache
        if record.status.is_terminal() {
            self.cache.store(&key, &record, self.config.cache_ttl.result).await;
        }
        Ok(record)
    }

    /// Last published snapshot, for observers reconnecting to a live run
    pub async fn latest_snapshot(&self, research_id: &str) -> Option<ResearchState> {
        self.cache.lookup(&state_key(research_id)).await
    }

    /// Cache counters for this orchestrator
    pub fn analytics(&self) -> CacheStatsSnapshot {
        self.cache.stats()
    }
}

impl std::fmt::Debug for ResearchOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResearchOrchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Forwards engine events as progress events and does the side effects
struct Relay {
    research_id: String,
    events: BoxStream<'static, EngineEvent>,
    store: Arc<dyn ResearchStore>,
    cache: CachedExecution,
    ttl: std::time::Duration,
    snapshots: watch::Sender<ResearchState>,
    /// Set once the terminal outcome has been written (or its write failed)
    settled: Arc<AtomicBool>,
}

impl Relay {
    async fn next(mut self) -> Option<(ProgressEvent, Relay)> {
        if self.settled.load(Ordering::SeqCst) {
            return None;
        }
        let event = self.events.next().await?;
        let stage = event.stage();
        let mut progress = ProgressEvent::from(&event);
        let mut state = event.into_state();

        if state.is_terminal() {
            let persisted = self
                .store
                .update_status(&self.research_id, state.status, state.report.clone(), state.error.clone())
                .await;
            self.settled.store(true, Ordering::SeqCst);

            match persisted {
                Ok(record) => {
                    if record.status == ResearchStatus::Completed {
                        self.cache.store(&result_key(&self.research_id), &record, self.ttl).await;
                    }
                    info!(research_id = %self.research_id, status = %record.status, "Research finished");
                }
                Err(e) => {
                    error!(research_id = %self.research_id, error = %e, "Failed to persist research outcome");
                    let err = WorkflowError::from(e);
                    progress = ProgressEvent::error(stage, err.to_string());
                    if state.status == ResearchStatus::Completed {
                        state = state.fail(&err);
                    }
                }
            }
        }

        self.publish(&state).await;
        Some((progress, self))
    }

    async fn publish(&mut self, state: &ResearchState) {
        self.snapshots.send_replace(state.clone());
        self.cache.store(&state_key(&self.research_id), state, self.ttl).await;
    }
}

/// Handle to a running research task.
///
/// A [`Stream`] of [`ProgressEvent`]s ending with a status event for the
/// report or a single error event.
pub struct ResearchRun {
    research_id: String,
    events: BoxStream<'static, ProgressEvent>,
    snapshot: watch::Receiver<ResearchState>,
    cancel: CancellationToken,
    store: Arc<dyn ResearchStore>,
    settled: Arc<AtomicBool>,
}

impl ResearchRun {
    pub fn research_id(&self) -> &str {
        &self.research_id
    }

    /// Last state emitted by the run (read only)
    pub fn latest_snapshot(&self) -> ResearchState {
        self.snapshot.borrow().clone()
    }

    /// Receiver that is notified on every new snapshot
    pub fn subscribe(&self) -> watch::Receiver<ResearchState> {
        self.snapshot.clone()
    }

    /// Stop the run at the next stage boundary
    pub fn cancel(&self) {
        warn!(research_id = %self.research_id, "Cancellation requested");
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Stream for ResearchRun {
    type Item = ProgressEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().events.poll_next_unpin(cx)
    }
}

/// Dropping a run before its terminal event stops it and records it as
/// cancelled, so the stored task never stays in a running status.
impl Drop for ResearchRun {
    fn drop(&mut self) {
        self.cancel.cancel();
        if self.settled.load(Ordering::SeqCst) {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(research_id = %self.research_id, "Run dropped outside a runtime, outcome not recorded");
            return;
        };
        let store = Arc::clone(&self.store);
        let research_id = self.research_id.clone();
        runtime.spawn(async move {
            let message = WorkflowError::Cancelled.to_string();
            match store
                .update_status(&research_id, ResearchStatus::Failed, None, Some(message))
                .await
            {
                Ok(_) => info!(research_id = %research_id, "Abandoned run recorded as cancelled"),
                Err(e) => error!(research_id = %research_id, error = %e, "Failed to record abandoned run"),
            }
        });
    }
}

impl std::fmt::Debug for ResearchRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResearchRun")
            .field("research_id", &self.research_id)
            .finish_non_exhaustive()
    }
}
