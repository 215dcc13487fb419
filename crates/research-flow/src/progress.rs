//! Progress events
//!
//! The observer-facing view of a run: each engine event is reduced to the
//! few fields a client needs, serialized as JSON.
//!
//! ```json
//! {"type":"status","stage":"search","status":"searching","iteration":1,
//!  "timestamp":"…","data":{"kind":"search","results_count":7,"findings_count":7}}
//! {"type":"error","stage":"analyze","message":"…","timestamp":"…"}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::EngineEvent;
use crate::state::{ResearchState, ResearchStatus, Stage};

/// Stage-specific part of a status event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StagePayload {
    QueryGeneration {
        queries: Vec<String>,
        reasoning: String,
    },
    Search {
        results_count: usize,
        findings_count: usize,
    },
    Analysis {
        coverage_score: f32,
        gaps: Vec<String>,
        reasoning: String,
    },
    Validation {
        is_valid: bool,
        confidence: f32,
    },
    Report {
        report_text: String,
    },
}

impl StagePayload {
    /// Read the payload for `stage` out of the snapshot taken right after it
    pub fn from_snapshot(stage: Stage, state: &ResearchState) -> Self {
        match stage {
            Stage::GenerateQueries => StagePayload::QueryGeneration {
                queries: state.queries.clone(),
                reasoning: metadata_str(state, "query_reasoning"),
            },
            Stage::Search => StagePayload::Search {
                results_count: state.search_results_count,
                findings_count: state.findings.len(),
            },
            Stage::Analyze => match &state.analysis {
                Some(analysis) => StagePayload::Analysis {
                    coverage_score: analysis.coverage_score,
                    gaps: analysis.gaps.clone(),
                    reasoning: analysis.reasoning.clone(),
                },
                None => StagePayload::Analysis {
                    coverage_score: 0.0,
                    gaps: Vec::new(),
                    reasoning: String::new(),
                },
            },
            Stage::Validate => StagePayload::Validation {
                is_valid: state.validation_valid(),
                confidence: state.validation.as_ref().map_or(0.0, |v| v.confidence),
            },
            Stage::GenerateReport => StagePayload::Report {
                report_text: state.report.clone().unwrap_or_default(),
            },
        }
    }
}

fn metadata_str(state: &ResearchState, key: &str) -> String {
    state
        .metadata
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

/// One progress notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Status {
        stage: Stage,
        status: ResearchStatus,
        iteration: u32,
        timestamp: DateTime<Utc>,
        data: StagePayload,
    },
    /// Fatal failure. Always the last event of a run.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stage: Option<Stage>,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl ProgressEvent {
    pub fn status(stage: Stage, state: &ResearchState) -> Self {
        ProgressEvent::Status {
            stage,
            status: state.status,
            iteration: state.iteration,
            timestamp: Utc::now(),
            data: StagePayload::from_snapshot(stage, state),
        }
    }

    pub fn error(stage: Option<Stage>, message: impl Into<String>) -> Self {
        ProgressEvent::Error {
            stage,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ProgressEvent::Error { .. })
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl From<&EngineEvent> for ProgressEvent {
    fn from(event: &EngineEvent) -> Self {
        match event {
            EngineEvent::StageCompleted { stage, state } => ProgressEvent::status(*stage, state),
            EngineEvent::Failed { stage, error, .. } => ProgressEvent::error(*stage, error.to_string()),
        }
    }
}
