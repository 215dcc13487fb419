//! Research workflow state definition
//!
//! [`ResearchState`] is the accumulator threaded through every stage of a run.
//! It is owned by the engine and only ever handed out as snapshots. Stage
//! results arrive as a [`StageUpdate`] and are merged with
//! [`ResearchState::apply_update`], which takes the state by value and
//! returns the next one:
//!
//! ```text
//! findings, processed_urls, messages   append
//! everything else                      replace
//! ```

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use crate::cache::content_hash;
use crate::error::WorkflowError;

/// User-supplied clarifications (question → answer).
///
/// Ordered so that rendering and cache keys are stable across runs.
pub type Clarifications = BTreeMap<String, String>;

/// Render clarifications as a single prompt-friendly line.
pub fn render_clarifications(clarifications: &Clarifications) -> String {
    if clarifications.is_empty() {
        return "None provided".to_string();
    }
    clarifications
        .iter()
        .map(|(k, v)| format!("{}: {}", k, v))
        .collect::<Vec<_>>()
        .join("; ")
}

/// The five stages a run moves through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    GenerateQueries,
    Search,
    Analyze,
    Validate,
    GenerateReport,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::GenerateQueries => "generate_queries",
            Stage::Search => "search",
            Stage::Analyze => "analyze",
            Stage::Validate => "validate",
            Stage::GenerateReport => "generate_report",
        }
    }

    /// Status the run reports while this stage is executing
    pub fn status(&self) -> ResearchStatus {
        match self {
            Stage::GenerateQueries => ResearchStatus::GeneratingQueries,
            Stage::Search => ResearchStatus::Searching,
            Stage::Analyze => ResearchStatus::Analyzing,
            Stage::Validate => ResearchStatus::Validating,
            Stage::GenerateReport => ResearchStatus::GeneratingReport,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a research task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResearchStatus {
    #[default]
    Initialized,
    GeneratingQueries,
    Searching,
    Analyzing,
    Validating,
    GeneratingReport,
    Completed,
    Failed,
}

impl ResearchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResearchStatus::Initialized => "initialized",
            ResearchStatus::GeneratingQueries => "generating_queries",
            ResearchStatus::Searching => "searching",
            ResearchStatus::Analyzing => "analyzing",
            ResearchStatus::Validating => "validating",
            ResearchStatus::GeneratingReport => "generating_report",
            ResearchStatus::Completed => "completed",
            ResearchStatus::Failed => "failed",
        }
    }

    /// Check if this is a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(self, ResearchStatus::Completed | ResearchStatus::Failed)
    }
}

impl fmt::Display for ResearchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single piece of extracted information tied to one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// Stable identifier derived from the source URL
    pub id: String,
    /// Extracted text
    pub content: String,
    /// Source the content came from
    pub source_url: String,
    /// Provider relevance (0.0 to 1.0)
    pub relevance_score: f32,
    /// Source title, if the provider returned one
    #[serde(default)]
    pub title: Option<String>,
    /// Publication date as reported by the provider
    #[serde(default)]
    pub published_date: Option<String>,
    /// Content embedding, when an embedder is configured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Open metadata
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Finding {
    /// Create a new finding for a source
    pub fn new(source_url: impl Into<String>, content: impl Into<String>, relevance: f32) -> Self {
        let source_url = source_url.into();
        Self {
            id: Self::id_for(&source_url),
            content: content.into(),
            source_url,
            relevance_score: relevance.clamp(0.0, 1.0),
            title: None,
            published_date: None,
            embedding: None,
            metadata: HashMap::new(),
        }
    }

    /// Deterministic finding id for a source URL
    pub fn id_for(source_url: &str) -> String {
        content_hash(&[source_url])[..16].to_string()
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_published_date(mut self, date: impl Into<String>) -> Self {
        self.published_date = Some(date.into());
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

/// Output of the query-generation stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub queries: Vec<String>,
    pub reasoning: String,
    #[serde(default)]
    pub confidence: Option<f32>,
}

impl QueryPlan {
    pub fn new(queries: Vec<String>, reasoning: impl Into<String>) -> Self {
        Self {
            queries,
            reasoning: reasoning.into(),
            confidence: None,
        }
    }

    /// Check the structural contract: at least one non-blank query
    pub fn validate(&self) -> Result<(), String> {
        if self.queries.is_empty() {
            return Err("no queries generated".to_string());
        }
        if self.queries.iter().any(|q| q.trim().is_empty()) {
            return Err("blank query in plan".to_string());
        }
        if let Some(confidence) = self.confidence {
            check_unit_interval("confidence", confidence)?;
        }
        Ok(())
    }
}

/// Output of the search stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub new_findings: Vec<Finding>,
    pub new_urls: Vec<String>,
}

impl SearchOutcome {
    /// A search must never hand back a source that was already processed
    pub fn validate(&self, processed_urls: &[String]) -> Result<(), String> {
        let processed: HashSet<&str> = processed_urls.iter().map(String::as_str).collect();
        if let Some(url) = self
            .new_urls
            .iter()
            .map(String::as_str)
            .chain(self.new_findings.iter().map(|f| f.source_url.as_str()))
            .find(|url| processed.contains(url))
        {
            return Err(format!("already processed source returned: {}", url));
        }
        Ok(())
    }
}

/// Output of the analysis stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub sufficient: bool,
    pub coverage_score: f32,
    pub gaps: Vec<String>,
    #[serde(default)]
    pub next_queries: Vec<String>,
    pub reasoning: String,
}

impl AnalysisResult {
    pub fn validate(&self) -> Result<(), String> {
        check_unit_interval("coverage_score", self.coverage_score)
    }
}

/// Output of the validation stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub confidence: f32,
    pub concerns: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

impl ValidationResult {
    pub fn validate(&self) -> Result<(), String> {
        check_unit_interval("confidence", self.confidence)
    }
}

fn check_unit_interval(field: &str, value: f32) -> Result<(), String> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(format!("{} {} outside [0, 1]", field, value))
    }
}

/// A structured stage result, ready to be merged into the state
#[derive(Debug, Clone, PartialEq)]
pub enum StageUpdate {
    Queries(QueryPlan),
    Search(SearchOutcome),
    Analysis(AnalysisResult),
    Validation(ValidationResult),
    Report(String),
}

impl StageUpdate {
    /// Stage that produces this kind of update
    pub fn stage(&self) -> Stage {
        match self {
            StageUpdate::Queries(_) => Stage::GenerateQueries,
            StageUpdate::Search(_) => Stage::Search,
            StageUpdate::Analysis(_) => Stage::Analyze,
            StageUpdate::Validation(_) => Stage::Validate,
            StageUpdate::Report(_) => Stage::GenerateReport,
        }
    }
}

/// The complete research workflow state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchState {
    pub research_id: String,
    pub topic: String,
    pub clarifications: Clarifications,

    pub status: ResearchStatus,
    pub iteration: u32,
    pub max_iterations: u32,

    /// Queries of the current iteration
    pub queries: Vec<String>,
    /// Every finding collected so far
    pub findings: Vec<Finding>,
    /// Every source fetched so far
    pub processed_urls: Vec<String>,
    /// New sources returned by the latest search
    pub search_results_count: usize,

    pub analysis: Option<AnalysisResult>,
    pub validation: Option<ValidationResult>,
    pub sufficient: bool,

    /// Final report, present only once the run has completed
    pub report: Option<String>,
    /// Failure message, present only once the run has failed
    pub error: Option<String>,

    pub messages: Vec<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ResearchState {
    /// Create a fresh initial state for a run
    pub fn new(research_id: impl Into<String>, topic: impl Into<String>) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert(
            "start_time".to_string(),
            serde_json::Value::String(Utc::now().to_rfc3339()),
        );

        Self {
            research_id: research_id.into(),
            topic: topic.into(),
            clarifications: Clarifications::new(),
            status: ResearchStatus::Initialized,
            iteration: 1,
            max_iterations: 5,
            queries: Vec::new(),
            findings: Vec::new(),
            processed_urls: Vec::new(),
            search_results_count: 0,
            analysis: None,
            validation: None,
            sufficient: false,
            report: None,
            error: None,
            messages: Vec::new(),
            metadata,
        }
    }

    pub fn with_clarifications(mut self, clarifications: Clarifications) -> Self {
        self.clarifications = clarifications;
        self
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    /// Whether the run has reached Completed or Failed
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the latest validation judged the findings reliable
    pub fn validation_valid(&self) -> bool {
        self.validation.as_ref().is_some_and(|v| v.is_valid)
    }

    /// Mark the start of a stage
    pub(crate) fn begin_stage(&mut self, stage: Stage) {
        self.status = stage.status();
    }

    /// Move to the next iteration after the policy chose to continue
    pub(crate) fn advance_iteration(&mut self) {
        self.iteration += 1;
    }

    /// Merge a stage result into the state.
    pub fn apply_update(mut self, update: StageUpdate) -> Self {
        match update {
            StageUpdate::Queries(plan) => {
                self.status = ResearchStatus::GeneratingQueries;
                self.messages.push(format!(
                    "Generated {} queries: {}",
                    plan.queries.len(),
                    plan.reasoning
                ));
                self.metadata.insert(
                    "query_reasoning".to_string(),
                    serde_json::Value::String(plan.reasoning),
                );
                self.queries = plan.queries;
            }
            StageUpdate::Search(outcome) => {
                self.status = ResearchStatus::Searching;
                self.messages.push(format!(
                    "Found {} new sources with {} findings",
                    outcome.new_urls.len(),
                    outcome.new_findings.len()
                ));
                self.search_results_count = outcome.new_urls.len();
                self.findings.extend(outcome.new_findings);
                self.processed_urls.extend(outcome.new_urls);
            }
            StageUpdate::Analysis(analysis) => {
                self.status = ResearchStatus::Analyzing;
                self.messages.push(format!(
                    "Coverage: {:.2}%, Gaps: {}",
                    analysis.coverage_score * 100.0,
                    analysis.gaps.len()
                ));
                self.metadata.insert(
                    "analysis_reasoning".to_string(),
                    serde_json::Value::String(analysis.reasoning.clone()),
                );
                self.sufficient = analysis.sufficient;
                self.analysis = Some(analysis);
            }
            StageUpdate::Validation(validation) => {
                self.status = ResearchStatus::Validating;
                self.messages.push(format!(
                    "Validation: {:.2}% confidence",
                    validation.confidence * 100.0
                ));
                // An invalid validation vetoes whatever analysis concluded
                if !validation.is_valid {
                    self.sufficient = false;
                }
                self.validation = Some(validation);
            }
            StageUpdate::Report(report) => {
                self.status = ResearchStatus::Completed;
                self.messages
                    .push("Research completed successfully".to_string());
                self.report = Some(report);
            }
        }
        self
    }

    /// Terminate the run with an error. No report survives a failure.
    pub fn fail(mut self, error: &WorkflowError) -> Self {
        self.status = ResearchStatus::Failed;
        self.report = None;
        self.error = Some(error.to_string());
        self.messages.push(format!("Research failed: {}", error));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(url: &str) -> Finding {
        Finding::new(url, format!("content from {}", url), 0.8)
    }

    #[test]
    fn test_research_state_new() {
        let state = ResearchState::new("r-1", "renewable energy storage");

        assert_eq!(state.status, ResearchStatus::Initialized);
        assert_eq!(state.iteration, 1);
        assert_eq!(state.max_iterations, 5);
        assert!(state.findings.is_empty());
        assert!(state.report.is_none());
        assert!(state.metadata.contains_key("start_time"));
    }

    #[test]
    fn test_queries_replace_previous_iteration() {
        let state = ResearchState::new("r", "t")
            .apply_update(StageUpdate::Queries(QueryPlan::new(
                vec!["a".into(), "b".into()],
                "first",
            )))
            .apply_update(StageUpdate::Queries(QueryPlan::new(vec!["c".into()], "second")));

        assert_eq!(state.queries, vec!["c".to_string()]);
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.metadata["query_reasoning"], "second");
    }

    #[test]
    fn test_search_appends_findings_and_urls() {
        let first = SearchOutcome {
            new_findings: vec![finding("https://a.example")],
            new_urls: vec!["https://a.example".into()],
        };
        let second = SearchOutcome {
            new_findings: vec![finding("https://b.example"), finding("https://c.example")],
            new_urls: vec!["https://b.example".into(), "https://c.example".into()],
        };

        let state = ResearchState::new("r", "t")
            .apply_update(StageUpdate::Search(first))
            .apply_update(StageUpdate::Search(second));

        assert_eq!(state.findings.len(), 3);
        assert_eq!(state.findings[0].source_url, "https://a.example");
        assert_eq!(state.processed_urls.len(), 3);
        assert_eq!(state.search_results_count, 2);
    }

    #[test]
    fn test_invalid_validation_overrides_sufficiency() {
        let state = ResearchState::new("r", "t")
            .apply_update(StageUpdate::Analysis(AnalysisResult {
                sufficient: true,
                coverage_score: 0.9,
                gaps: vec![],
                next_queries: vec![],
                reasoning: "looks complete".into(),
            }))
            .apply_update(StageUpdate::Validation(ValidationResult {
                is_valid: false,
                confidence: 0.3,
                concerns: vec!["single source".into()],
                suggestions: vec![],
            }));

        assert!(!state.sufficient);
        assert!(!state.validation_valid());
        assert_eq!(state.status, ResearchStatus::Validating);
    }

    #[test]
    fn test_report_completes_run() {
        let state = ResearchState::new("r", "t").apply_update(StageUpdate::Report("# Report".into()));

        assert_eq!(state.status, ResearchStatus::Completed);
        assert_eq!(state.report.as_deref(), Some("# Report"));
    }

    #[test]
    fn test_fail_clears_report() {
        let state = ResearchState::new("r", "t")
            .apply_update(StageUpdate::Report("partial".into()))
            .fail(&WorkflowError::Cancelled);

        assert_eq!(state.status, ResearchStatus::Failed);
        assert!(state.report.is_none());
        assert_eq!(state.error.as_deref(), Some("Research cancelled"));
    }

    #[test]
    fn test_result_validation() {
        assert!(QueryPlan::new(vec![], "none").validate().is_err());
        assert!(QueryPlan::new(vec!["  ".into()], "blank").validate().is_err());
        assert!(QueryPlan::new(vec!["ok".into()], "fine").validate().is_ok());

        let analysis = AnalysisResult {
            sufficient: false,
            coverage_score: 1.2,
            gaps: vec![],
            next_queries: vec![],
            reasoning: String::new(),
        };
        assert!(analysis.validate().is_err());

        let validation = ValidationResult {
            is_valid: true,
            confidence: f32::NAN,
            concerns: vec![],
            suggestions: vec![],
        };
        assert!(validation.validate().is_err());
    }

    #[test]
    fn test_search_outcome_rejects_processed_urls() {
        let outcome = SearchOutcome {
            new_findings: vec![finding("https://seen.example")],
            new_urls: vec!["https://seen.example".into()],
        };

        assert!(outcome.validate(&["https://seen.example".to_string()]).is_err());
        assert!(outcome.validate(&[]).is_ok());
    }

    #[test]
    fn test_finding_id_is_stable() {
        assert_eq!(
            Finding::new("https://a.example", "x", 0.5).id,
            Finding::new("https://a.example", "y", 0.1).id
        );
        assert_ne!(Finding::id_for("https://a.example"), Finding::id_for("https://b.example"));
    }

    #[test]
    fn test_render_clarifications() {
        let mut clarifications = Clarifications::new();
        clarifications.insert("scope".into(), "grid scale".into());
        clarifications.insert("region".into(), "EU".into());

        assert_eq!(render_clarifications(&clarifications), "region: EU; scope: grid scale");
        assert_eq!(render_clarifications(&Clarifications::new()), "None provided");
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&ResearchStatus::GeneratingQueries).unwrap();
        assert_eq!(json, "\"generating_queries\"");
        assert!(ResearchStatus::Failed.is_terminal());
        assert!(!ResearchStatus::Validating.is_terminal());
    }
}
