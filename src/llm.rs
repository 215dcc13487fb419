//! # Model-backed Stages
//!
//! Query generation, analysis, validation and reporting are all "ask the
//! model, read the answer" stages. This module wires them to a local Ollama
//! model through Rig.
//!
//! Model answers are free text. For the structured stages we pull the JSON
//! object out of the text and decode it into the typed result:
//!
//! - no JSON object at all: a failed call (the stage fallback applies)
//! - an object that does not fit the result type: a malformed result (fatal)

use async_trait::async_trait;
use rig::client::{CompletionClient, ProviderClient};
use rig::completion::Prompt;
use rig::providers::ollama;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use research_flow::state::render_clarifications;
use research_flow::{
    AdapterError, AnalysisContext, AnalysisResult, Analyzer, Finding, QueryContext, QueryGenerator,
    QueryPlan, ReportContext, ReportWriter, ValidationResult, Validator,
};

use crate::config::Config;

// =============================================================================
// SYSTEM PROMPTS
// =============================================================================
const QUERY_SYSTEM_PROMPT: &str = r#"
You are an expert research query strategist. Generate 3-5 web search queries
that together cover the topic from different angles. Prefer queries likely to
return authoritative, diverse sources. Avoid repeating ground that existing
findings already cover.

Respond with a single JSON object:
{"queries": ["..."], "reasoning": "...", "confidence": 0.0-1.0}
"#;

const ANALYSIS_SYSTEM_PROMPT: &str = r#"
You are an expert research analyst. Judge whether the findings cover the key
aspects of the topic, how credible the sources are, and what is missing.

Respond with a single JSON object:
{"sufficient": true|false, "coverage_score": 0.0-1.0, "gaps": ["..."],
 "next_queries": ["..."], "reasoning": "..."}
"#;

const VALIDATION_SYSTEM_PROMPT: &str = r#"
You are an expert fact-checker. Check the findings for contradictions, weak
or unreliable sources and unsupported claims.

Respond with a single JSON object:
{"is_valid": true|false, "confidence": 0.0-1.0, "concerns": ["..."],
 "suggestions": ["..."]}
"#;

const REPORT_SYSTEM_PROMPT: &str = r#"
You are an expert research writer. Write a well-structured markdown report
with an executive summary, key findings, analysis, and a list of sources.
Cite sources by URL. Only use information present in the findings.
"#;

/// Findings included verbatim in a prompt
const PROMPT_FINDINGS_LIMIT: usize = 30;

/// Characters of each finding included in a prompt
const PROMPT_FINDING_CHARS: usize = 400;

// =============================================================================
// CHAT MODEL
// =============================================================================
/// A single-turn model call: system prompt in, text out.
///
/// # Rust Concept: Trait Objects
///
/// The stages hold an `Arc<dyn ChatModel>`, so tests can swap in a scripted
/// model without touching the stage code.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, AdapterError>;
}

/// Ollama through Rig
pub struct OllamaModel {
    client: ollama::Client,
    model: String,
    temperature: f64,
    timeout: Duration,
}

impl OllamaModel {
    pub fn from_config(config: &Config) -> Self {
        // Rig reads the Ollama host from the environment
        std::env::set_var("OLLAMA_API_BASE_URL", &config.ollama_host);

        Self {
            client: ollama::Client::from_env(),
            model: config.model.clone(),
            temperature: f64::from(config.temperature),
            timeout: config.llm_timeout,
        }
    }
}

#[async_trait]
impl ChatModel for OllamaModel {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, AdapterError> {
        let agent = self
            .client
            .agent(&self.model)
            .preamble(system)
            .temperature(self.temperature)
            .build();

        debug!(model = %self.model, prompt_chars = prompt.len(), "Calling model");

        match tokio::time::timeout(self.timeout, async { agent.prompt(prompt).await }).await {
            Err(_) => Err(AdapterError::Timeout(self.timeout)),
            Ok(Err(e)) => Err(AdapterError::call(format!("Model call failed: {}", e))),
            Ok(Ok(text)) => Ok(text),
        }
    }
}

// =============================================================================
// JSON EXTRACTION
// =============================================================================
/// Find the outermost JSON object in free text (code fences, preambles and
/// trailing chatter are ignored).
pub fn extract_json_object(text: &str) -> Option<serde_json::Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<serde_json::Value>(&text[start..=end]) {
        Ok(value) if value.is_object() => Some(value),
        _ => None,
    }
}

/// Decode a model answer into a typed stage result
pub fn parse_model_json<T: DeserializeOwned>(text: &str) -> Result<T, AdapterError> {
    let value = extract_json_object(text)
        .ok_or_else(|| AdapterError::call("Model response contained no JSON object"))?;
    serde_json::from_value(value).map_err(|e| AdapterError::malformed(e.to_string()))
}

fn format_findings(findings: &[Finding]) -> String {
    if findings.is_empty() {
        return "No findings yet.".to_string();
    }
    findings
        .iter()
        .rev()
        .take(PROMPT_FINDINGS_LIMIT)
        .enumerate()
        .map(|(i, f)| {
            let content: String = f.content.chars().take(PROMPT_FINDING_CHARS).collect();
            format!("{}. [{}] {}", i + 1, f.source_url, content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// =============================================================================
// STAGE ADAPTERS
// =============================================================================
/// The four model-backed stages over one model
#[derive(Clone)]
pub struct ModelStages {
    model: Arc<dyn ChatModel>,
}

impl ModelStages {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl QueryGenerator for ModelStages {
    async fn generate_queries(&self, ctx: QueryContext<'_>) -> Result<QueryPlan, AdapterError> {
        let prompt = format!(
            "Topic: {}\n\nClarifications: {}\n\nIteration: {}\n\nExisting findings ({} total):\n{}\n\n\
             Generate search queries for this iteration.",
            ctx.topic,
            render_clarifications(ctx.clarifications),
            ctx.iteration,
            ctx.prior_findings.len(),
            format_findings(ctx.prior_findings),
        );
        let text = self.model.complete(QUERY_SYSTEM_PROMPT, &prompt).await?;
        parse_model_json(&text)
    }
}

#[async_trait]
impl Analyzer for ModelStages {
    async fn analyze(&self, ctx: AnalysisContext<'_>) -> Result<AnalysisResult, AdapterError> {
        let prompt = format!(
            "Topic: {}\n\nClarifications: {}\n\nIteration: {}\n\nQueries used: {}\n\n\
             Findings ({} total):\n{}\n\nIs the research sufficient?",
            ctx.topic,
            render_clarifications(ctx.clarifications),
            ctx.iteration,
            ctx.queries.join(", "),
            ctx.findings.len(),
            format_findings(ctx.findings),
        );
        let text = self.model.complete(ANALYSIS_SYSTEM_PROMPT, &prompt).await?;
        parse_model_json(&text)
    }
}

#[async_trait]
impl Validator for ModelStages {
    async fn validate(&self, findings: &[Finding], topic: &str) -> Result<ValidationResult, AdapterError> {
        let prompt = format!(
            "Topic: {}\n\nFindings ({} total):\n{}\n\nValidate these findings.",
            topic,
            findings.len(),
            format_findings(findings),
        );
        let text = self.model.complete(VALIDATION_SYSTEM_PROMPT, &prompt).await?;
        parse_model_json(&text)
    }
}

#[async_trait]
impl ReportWriter for ModelStages {
    async fn generate_report(&self, ctx: ReportContext<'_>) -> Result<String, AdapterError> {
        let coverage = ctx
            .analysis
            .map(|a| format!("{:.0}% coverage, gaps: {}", a.coverage_score * 100.0, a.gaps.join("; ")))
            .unwrap_or_else(|| "not available".to_string());
        let validation = ctx
            .validation
            .map(|v| format!("{:.0}% confidence, concerns: {}", v.confidence * 100.0, v.concerns.join("; ")))
            .unwrap_or_else(|| "not available".to_string());

        let prompt = format!(
            "Topic: {}\n\nClarifications: {}\n\nAnalysis: {}\n\nValidation: {}\n\n\
             Findings ({} total):\n{}\n\nWrite the final report.",
            ctx.topic,
            render_clarifications(ctx.clarifications),
            coverage,
            validation,
            ctx.findings.len(),
            format_findings(ctx.findings),
        );
        let report = self.model.complete(REPORT_SYSTEM_PROMPT, &prompt).await?;
        let report = report.trim();
        if report.is_empty() {
            return Err(AdapterError::call("Model returned an empty report"));
        }
        Ok(report.to_string())
    }
}

// =============================================================================
// UNIT TESTS
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use research_flow::{Clarifications, WithFallback};

    /// Replies with a fixed answer
    struct Scripted(&'static str);

    #[async_trait]
    impl ChatModel for Scripted {
        async fn complete(&self, _system: &str, _prompt: &str) -> Result<String, AdapterError> {
            Ok(self.0.to_string())
        }
    }

    fn stages(answer: &'static str) -> ModelStages {
        ModelStages::new(Arc::new(Scripted(answer)))
    }

    #[test]
    fn test_extract_json_from_fenced_answer() {
        let text = "Sure! Here you go:\n```json\n{\"queries\": [\"a\"], \"reasoning\": \"r\"}\n```\nHope it helps.";
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["queries"][0], "a");
    }

    #[test]
    fn test_extract_json_rejects_non_objects() {
        assert!(extract_json_object("no json here").is_none());
        assert!(extract_json_object("} backwards {").is_none());
        assert!(extract_json_object("{not valid}").is_none());
    }

    #[tokio::test]
    async fn test_query_plan_parsed() {
        let clarifications = Clarifications::new();
        let plan = stages(r#"{"queries": ["grid storage costs", "lithium supply"], "reasoning": "broad", "confidence": 0.8}"#)
            .generate_queries(QueryContext {
                topic: "grid storage",
                clarifications: &clarifications,
                prior_findings: &[],
                iteration: 1,
            })
            .await
            .unwrap();

        assert_eq!(plan.queries.len(), 2);
        assert_eq!(plan.confidence, Some(0.8));
    }

    #[tokio::test]
    async fn test_prose_answer_is_recoverable() {
        let err = stages("I think the research looks good overall.")
            .validate(&[], "grid storage")
            .await
            .unwrap_err();
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_missing_field_is_malformed() {
        let err = stages(r#"{"is_valid": true}"#)
            .validate(&[], "grid storage")
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Malformed(_)));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_report_is_trimmed() {
        let clarifications = Clarifications::new();
        let report = stages("\n\n# Report\n\nBody\n")
            .generate_report(ReportContext {
                topic: "t",
                clarifications: &clarifications,
                findings: &[],
                analysis: None,
                validation: None,
            })
            .await
            .unwrap();
        assert_eq!(report, "# Report\n\nBody");
    }

    #[tokio::test]
    async fn test_blank_report_falls_back() {
        let clarifications = Clarifications::new();
        let ctx = ReportContext {
            topic: "tidal power",
            clarifications: &clarifications,
            findings: &[],
            analysis: None,
            validation: None,
        };

        let err = stages("  \n\t ").generate_report(ctx).await.unwrap_err();
        assert!(err.is_recoverable());

        let report = WithFallback::new(stages("\n\n"))
            .generate_report(ctx)
            .await
            .unwrap();
        assert!(report.starts_with("# Research Report: tidal power"));
        assert!(report.contains("empty report"));
    }

    #[test]
    fn test_format_findings_truncates() {
        let long = Finding::new("https://x.example", "y".repeat(1000), 0.5);
        let text = format_findings(&[long]);
        assert!(text.starts_with("1. [https://x.example] "));
        assert!(text.len() < 500);
        assert_eq!(format_findings(&[]), "No findings yet.");
    }
}
