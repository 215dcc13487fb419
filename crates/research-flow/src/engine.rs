//! Workflow engine
//!
//! Drives one research run through its stages and yields a snapshot after
//! each one. The run is a lazy stream: nothing executes until the consumer
//! polls, and every stage waits for the previous one to finish.
//!
//! ```text
//!                 ┌──────────────── Continue (iteration += 1) ───────────────┐
//!                 ▼                                                          │
//! Initialized ─▶ GenerateQueries ─▶ Search ─▶ Analyze ─▶ Validate ─▶ decide ─┤
//!                                                                            │
//!                                                 Finish ─▶ GenerateReport ─▶ Completed
//!
//! any stage ── unhandled error / cancellation ──▶ Failed
//! ```
//!
//! # Contract
//!
//! - Each call to [`WorkflowEngine::run`] consumes a fresh initial state.
//!   A state that is not `Initialized` yields a single failure event.
//! - Results are checked at the boundary. A structurally invalid result ends
//!   the run as a malformed-result failure.
//! - Cancellation is observed between stages only. A call already in flight
//!   completes, but its result is discarded.
//! - The stream always ends after exactly one terminal event.

use futures::stream::{self, BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::{AnalysisContext, QueryContext, ReportContext, StageAdapters};
use crate::error::{AdapterError, WorkflowError};
use crate::policy::{decide, Decision};
use crate::state::{ResearchState, ResearchStatus, Stage, StageUpdate};

/// One step of a run as seen by the consumer
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A stage finished and its result was merged
    StageCompleted { stage: Stage, state: ResearchState },
    /// The run ended in failure. Always the last event.
    Failed {
        stage: Option<Stage>,
        error: WorkflowError,
        state: ResearchState,
    },
}

impl EngineEvent {
    /// Snapshot carried by the event
    pub fn state(&self) -> &ResearchState {
        match self {
            EngineEvent::StageCompleted { state, .. } | EngineEvent::Failed { state, .. } => state,
        }
    }

    pub fn into_state(self) -> ResearchState {
        match self {
            EngineEvent::StageCompleted { state, .. } | EngineEvent::Failed { state, .. } => state,
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            EngineEvent::StageCompleted { stage, .. } => Some(*stage),
            EngineEvent::Failed { stage, .. } => *stage,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }
}

/// Executes research runs against a set of stage adapters
#[derive(Debug, Clone)]
pub struct WorkflowEngine {
    adapters: StageAdapters,
    cancel: CancellationToken,
}

impl WorkflowEngine {
    pub fn new(adapters: StageAdapters) -> Self {
        Self {
            adapters,
            cancel: CancellationToken::new(),
        }
    }

    /// Observe an external cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that cancels runs started by this engine
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start a run. The returned stream is finite and ends after the first
    /// terminal event.
    pub fn run(&self, initial: ResearchState) -> BoxStream<'static, EngineEvent> {
        let machine = match check_initial(&initial) {
            Ok(()) => Machine {
                adapters: self.adapters.clone(),
                cancel: self.cancel.clone(),
                state: initial,
                next: Some(Stage::GenerateQueries),
                advance_pending: false,
            },
            Err(error) => {
                warn!(research_id = %initial.research_id, error = %error, "Rejecting initial state");
                let state = initial.fail(&error);
                return stream::iter([EngineEvent::Failed {
                    stage: None,
                    error,
                    state,
                }])
                .boxed();
            }
        };

        info!(
            research_id = %machine.state.research_id,
            topic = %machine.state.topic,
            max_iterations = machine.state.max_iterations,
            "Starting research run"
        );

        stream::unfold(machine, Machine::step).boxed()
    }

    /// Drive a run to the end and return its final state.
    pub async fn run_to_end(&self, initial: ResearchState) -> Result<ResearchState, WorkflowError> {
        let mut events = self.run(initial);
        let mut last = None;
        while let Some(event) = events.next().await {
            if let EngineEvent::Failed { error, .. } = event {
                return Err(error);
            }
            last = Some(event.into_state());
        }
        last.ok_or_else(|| WorkflowError::InvalidInitialState("run produced no events".to_string()))
    }
}

fn check_initial(state: &ResearchState) -> Result<(), WorkflowError> {
    if state.status != ResearchStatus::Initialized {
        return Err(WorkflowError::InvalidInitialState(format!(
            "expected status initialized, got {}",
            state.status
        )));
    }
    if state.iteration != 1 {
        return Err(WorkflowError::InvalidInitialState(format!(
            "expected iteration 1, got {}",
            state.iteration
        )));
    }
    if state.max_iterations == 0 {
        return Err(WorkflowError::InvalidInitialState(
            "max_iterations must be at least 1".to_string(),
        ));
    }
    if state.topic.trim().is_empty() {
        return Err(WorkflowError::InvalidInitialState("topic is empty".to_string()));
    }
    Ok(())
}

/// Per-run execution state, owned by the stream
struct Machine {
    adapters: StageAdapters,
    cancel: CancellationToken,
    state: ResearchState,
    /// `None` once a terminal event has been emitted
    next: Option<Stage>,
    /// Set when the policy chose Continue; applied on re-entering query generation
    advance_pending: bool,
}

impl Machine {
    async fn step(mut self) -> Option<(EngineEvent, Machine)> {
        let stage = self.next?;

        if self.cancel.is_cancelled() {
            return Some(self.fail(stage, WorkflowError::Cancelled));
        }

        if stage == Stage::GenerateQueries && self.advance_pending {
            self.state.advance_iteration();
            self.advance_pending = false;
        }
        self.state.begin_stage(stage);
        debug!(
            research_id = %self.state.research_id,
            iteration = self.state.iteration,
            stage = %stage,
            "Entering stage"
        );

        let result = self.execute(stage).await;

        if self.cancel.is_cancelled() {
            debug!(stage = %stage, "Discarding result of cancelled run");
            return Some(self.fail(stage, WorkflowError::Cancelled));
        }

        let update = match result {
            Ok(update) => update,
            Err(error) => return Some(self.fail(stage, error)),
        };

        let state = std::mem::replace(&mut self.state, ResearchState::new("", ""));
        self.state = state.apply_update(update);
        self.next = self.after(stage);

        info!(
            research_id = %self.state.research_id,
            iteration = self.state.iteration,
            stage = %stage,
            findings = self.state.findings.len(),
            "Stage completed"
        );

        let event = EngineEvent::StageCompleted {
            stage,
            state: self.state.clone(),
        };
        Some((event, self))
    }

    /// Next stage after `stage` completed
    fn after(&mut self, stage: Stage) -> Option<Stage> {
        match stage {
            Stage::GenerateQueries => Some(Stage::Search),
            Stage::Search => Some(Stage::Analyze),
            Stage::Analyze => Some(Stage::Validate),
            Stage::Validate => {
                let decision = decide(
                    self.state.sufficient,
                    self.state.validation_valid(),
                    self.state.iteration,
                    self.state.max_iterations,
                );
                debug!(
                    research_id = %self.state.research_id,
                    iteration = self.state.iteration,
                    decision = ?decision,
                    "Continuation decided"
                );
                match decision {
                    Decision::Continue => {
                        self.advance_pending = true;
                        Some(Stage::GenerateQueries)
                    }
                    Decision::Finish => Some(Stage::GenerateReport),
                }
            }
            Stage::GenerateReport => None,
        }
    }

    fn fail(mut self, stage: Stage, error: WorkflowError) -> (EngineEvent, Machine) {
        warn!(
            research_id = %self.state.research_id,
            iteration = self.state.iteration,
            stage = %stage,
            error = %error,
            "Research run failed"
        );
        let state = std::mem::replace(&mut self.state, ResearchState::new("", ""));
        self.state = state.fail(&error);
        self.next = None;

        let event = EngineEvent::Failed {
            stage: Some(stage),
            error,
            state: self.state.clone(),
        };
        (event, self)
    }

    /// Call the stage adapter with the slice of state it needs and check the
    /// result.
    async fn execute(&self, stage: Stage) -> Result<StageUpdate, WorkflowError> {
        let state = &self.state;
        let adapters = &self.adapters;
        let adapter_err = |e: AdapterError| WorkflowError::from_adapter(stage, e);
        let malformed = |reason: String| WorkflowError::malformed(stage, reason);

        match stage {
            Stage::GenerateQueries => {
                let plan = adapters
                    .query_generator
                    .generate_queries(QueryContext {
                        topic: &state.topic,
                        clarifications: &state.clarifications,
                        prior_findings: &state.findings,
                        iteration: state.iteration,
                    })
                    .await
                    .map_err(adapter_err)?;
                plan.validate().map_err(malformed)?;
                Ok(StageUpdate::Queries(plan))
            }
            Stage::Search => {
                let outcome = adapters
                    .searcher
                    .search(&state.queries, &state.processed_urls)
                    .await
                    .map_err(adapter_err)?;
                outcome.validate(&state.processed_urls).map_err(malformed)?;
                Ok(StageUpdate::Search(outcome))
            }
            Stage::Analyze => {
                let analysis = adapters
                    .analyzer
                    .analyze(AnalysisContext {
                        topic: &state.topic,
                        clarifications: &state.clarifications,
                        findings: &state.findings,
                        queries: &state.queries,
                        iteration: state.iteration,
                    })
                    .await
                    .map_err(adapter_err)?;
                analysis.validate().map_err(malformed)?;
                Ok(StageUpdate::Analysis(analysis))
            }
            Stage::Validate => {
                let validation = adapters
                    .validator
                    .validate(&state.findings, &state.topic)
                    .await
                    .map_err(adapter_err)?;
                validation.validate().map_err(malformed)?;
                Ok(StageUpdate::Validation(validation))
            }
            Stage::GenerateReport => {
                let report = adapters
                    .report_writer
                    .generate_report(ReportContext {
                        topic: &state.topic,
                        clarifications: &state.clarifications,
                        findings: &state.findings,
                        analysis: state.analysis.as_ref(),
                        validation: state.validation.as_ref(),
                    })
                    .await
                    .map_err(adapter_err)?;
                if report.trim().is_empty() {
                    return Err(malformed("empty report".to_string()));
                }
                Ok(StageUpdate::Report(report))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{Analyzer, QueryGenerator, ReportWriter, Searcher, Validator};
    use crate::state::{AnalysisResult, Finding, QueryPlan, SearchOutcome, ValidationResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Deterministic adapters: two fresh sources per search, analysis
    /// sufficient from `sufficient_at` findings on.
    struct Scripted {
        sufficient_at: usize,
        valid: bool,
        searches: AtomicU32,
    }

    impl Scripted {
        fn new(sufficient_at: usize, valid: bool) -> Arc<Self> {
            Arc::new(Self {
                sufficient_at,
                valid,
                searches: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl QueryGenerator for Arc<Scripted> {
        async fn generate_queries(&self, ctx: QueryContext<'_>) -> Result<QueryPlan, AdapterError> {
            Ok(QueryPlan::new(
                vec![format!("{} {}", ctx.topic, ctx.iteration)],
                "scripted",
            ))
        }
    }

    #[async_trait]
    impl Searcher for Arc<Scripted> {
        async fn search(&self, _q: &[String], _p: &[String]) -> Result<SearchOutcome, AdapterError> {
            let n = self.searches.fetch_add(1, Ordering::SeqCst);
            let urls: Vec<String> = (0..2).map(|i| format!("https://s{}-{}.example", n, i)).collect();
            Ok(SearchOutcome {
                new_findings: urls.iter().map(|u| Finding::new(u.as_str(), "text", 0.7)).collect(),
                new_urls: urls,
            })
        }
    }

    #[async_trait]
    impl Analyzer for Arc<Scripted> {
        async fn analyze(&self, ctx: AnalysisContext<'_>) -> Result<AnalysisResult, AdapterError> {
            Ok(AnalysisResult {
                sufficient: ctx.findings.len() >= self.sufficient_at,
                coverage_score: 0.5,
                gaps: vec![],
                next_queries: vec![],
                reasoning: "scripted".into(),
            })
        }
    }

    #[async_trait]
    impl Validator for Arc<Scripted> {
        async fn validate(&self, _f: &[Finding], _t: &str) -> Result<ValidationResult, AdapterError> {
            Ok(ValidationResult {
                is_valid: self.valid,
                confidence: 0.9,
                concerns: vec![],
                suggestions: vec![],
            })
        }
    }

    #[async_trait]
    impl ReportWriter for Arc<Scripted> {
        async fn generate_report(&self, ctx: ReportContext<'_>) -> Result<String, AdapterError> {
            Ok(format!("# {}\n\n{} findings", ctx.topic, ctx.findings.len()))
        }
    }

    fn engine(script: Arc<Scripted>) -> WorkflowEngine {
        WorkflowEngine::new(StageAdapters::new(
            script.clone(),
            script.clone(),
            script.clone(),
            script.clone(),
            script,
        ))
    }

    async fn collect(engine: &WorkflowEngine, initial: ResearchState) -> Vec<EngineEvent> {
        engine.run(initial).collect().await
    }

    #[tokio::test]
    async fn test_single_iteration_when_sufficient() {
        let events = collect(&engine(Scripted::new(1, true)), ResearchState::new("r", "topic")).await;

        let stages: Vec<_> = events.iter().filter_map(EngineEvent::stage).collect();
        assert_eq!(
            stages,
            vec![
                Stage::GenerateQueries,
                Stage::Search,
                Stage::Analyze,
                Stage::Validate,
                Stage::GenerateReport
            ]
        );
        let last = events.last().unwrap().state();
        assert_eq!(last.status, ResearchStatus::Completed);
        assert_eq!(last.iteration, 1);
        assert!(last.report.is_some());
    }

    #[tokio::test]
    async fn test_iteration_bound_forces_report() {
        let initial = ResearchState::new("r", "topic").with_max_iterations(3);
        let events = collect(&engine(Scripted::new(usize::MAX, true)), initial).await;

        assert_eq!(events.len(), 3 * 4 + 1);
        let last = events.last().unwrap().state();
        assert_eq!(last.status, ResearchStatus::Completed);
        assert_eq!(last.iteration, 3);
        assert_eq!(last.findings.len(), 6);
        assert!(events.iter().all(|e| e.state().iteration <= 3));
    }

    #[tokio::test]
    async fn test_invalid_validation_blocks_early_finish() {
        let initial = ResearchState::new("r", "topic").with_max_iterations(2);
        let state = engine(Scripted::new(1, false)).run_to_end(initial).await.unwrap();

        assert_eq!(state.iteration, 2);
        assert!(!state.sufficient);
        assert_eq!(state.status, ResearchStatus::Completed);
    }

    #[tokio::test]
    async fn test_rejects_non_initial_state() {
        let mut initial = ResearchState::new("r", "topic");
        initial.status = ResearchStatus::Searching;
        let events = collect(&engine(Scripted::new(1, true)), initial).await;

        assert_eq!(events.len(), 1);
        match &events[0] {
            EngineEvent::Failed { error, state, .. } => {
                assert!(matches!(error, WorkflowError::InvalidInitialState(_)));
                assert_eq!(state.status, ResearchStatus::Failed);
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejects_zero_iteration_budget() {
        let initial = ResearchState::new("r", "topic").with_max_iterations(0);
        let err = engine(Scripted::new(1, true)).run_to_end(initial).await.unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidInitialState(_)));
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let engine = engine(Scripted::new(1, true));
        engine.cancellation_token().cancel();

        let events = collect(&engine, ResearchState::new("r", "topic")).await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            EngineEvent::Failed { stage, error, state } => {
                assert_eq!(*stage, Some(Stage::GenerateQueries));
                assert!(error.is_cancelled());
                assert!(state.report.is_none());
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_run_is_lazy() {
        let script = Scripted::new(1, true);
        let engine = engine(script.clone());
        let _events = engine.run(ResearchState::new("r", "topic"));
        assert_eq!(script.searches.load(Ordering::SeqCst), 0);
    }
}
