//! Stage fallbacks
//!
//! When a stage's external call fails with a recoverable error, the wrapper
//! substitutes a conservative result so one outage degrades the run instead of
//! ending it. Malformed results pass through untouched.

use async_trait::async_trait;
use tracing::warn;

use super::{
    AnalysisContext, Analyzer, QueryContext, QueryGenerator, ReportContext, ReportWriter, Validator,
};
use crate::error::AdapterError;
use crate::state::{AnalysisResult, Finding, QueryPlan, ValidationResult};

/// Findings needed before the analysis fallback calls research sufficient
pub const FALLBACK_SUFFICIENT_FINDINGS: usize = 20;

/// Findings at which the analysis fallback reports full coverage
const FALLBACK_FULL_COVERAGE_FINDINGS: usize = 30;

/// Confidence reported by the validation fallback
const FALLBACK_VALIDATION_CONFIDENCE: f32 = 0.7;

/// Queries derived trivially from the topic
pub fn fallback_queries(topic: &str) -> QueryPlan {
    QueryPlan {
        queries: vec![
            topic.to_string(),
            format!("{} research", topic),
            format!("{} analysis", topic),
        ],
        reasoning: "Fallback queries due to error".to_string(),
        confidence: Some(0.5),
    }
}

/// Insufficient unless enough findings have piled up
pub fn fallback_analysis(findings_count: usize, error: &AdapterError) -> AnalysisResult {
    let coverage = (findings_count as f32 / FALLBACK_FULL_COVERAGE_FINDINGS as f32).min(1.0);
    AnalysisResult {
        sufficient: findings_count > FALLBACK_SUFFICIENT_FINDINGS,
        coverage_score: coverage,
        gaps: vec!["Unable to analyze due to error".to_string()],
        next_queries: Vec::new(),
        reasoning: format!("Analysis error: {}", error),
    }
}

/// Valid, with reduced confidence and a flagged concern
pub fn fallback_validation(error: &AdapterError) -> ValidationResult {
    ValidationResult {
        is_valid: true,
        confidence: FALLBACK_VALIDATION_CONFIDENCE,
        concerns: vec![format!("Validation error: {}", error)],
        suggestions: vec!["Manual validation recommended".to_string()],
    }
}

/// Minimal report noting the error and how much was collected
pub fn fallback_report(topic: &str, findings: &[Finding], error: &AdapterError) -> String {
    format!(
        "# Research Report: {topic}\n\n\
         ## Error\n\n\
         Unable to generate full report due to error: {error}\n\n\
         ## Findings Summary\n\n\
         Total findings collected: {count}\n\n\
         Please review findings manually or retry report generation.\n",
        topic = topic,
        error = error,
        count = findings.len(),
    )
}

/// Adds the stage fallback to any adapter.
///
/// Implements whichever stage traits the inner adapter implements.
#[derive(Debug, Clone)]
pub struct WithFallback<A> {
    inner: A,
}

impl<A> WithFallback<A> {
    pub fn new(inner: A) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }
}

#[async_trait]
impl<A: QueryGenerator> QueryGenerator for WithFallback<A> {
    async fn generate_queries(&self, ctx: QueryContext<'_>) -> Result<QueryPlan, AdapterError> {
        match self.inner.generate_queries(ctx).await {
            Err(e) if e.is_recoverable() => {
                warn!(error = %e, iteration = ctx.iteration, "Query generation failed, using fallback queries");
                Ok(fallback_queries(ctx.topic))
            }
            other => other,
        }
    }
}

#[async_trait]
impl<A: Analyzer> Analyzer for WithFallback<A> {
    async fn analyze(&self, ctx: AnalysisContext<'_>) -> Result<AnalysisResult, AdapterError> {
        match self.inner.analyze(ctx).await {
            Err(e) if e.is_recoverable() => {
                warn!(error = %e, findings = ctx.findings.len(), "Analysis failed, using conservative fallback");
                Ok(fallback_analysis(ctx.findings.len(), &e))
            }
            other => other,
        }
    }
}

#[async_trait]
impl<A: Validator> Validator for WithFallback<A> {
    async fn validate(&self, findings: &[Finding], topic: &str) -> Result<ValidationResult, AdapterError> {
        match self.inner.validate(findings, topic).await {
            Err(e) if e.is_recoverable() => {
                warn!(error = %e, "Validation failed, using permissive fallback");
                Ok(fallback_validation(&e))
            }
            other => other,
        }
    }
}

#[async_trait]
impl<A: ReportWriter> ReportWriter for WithFallback<A> {
    async fn generate_report(&self, ctx: ReportContext<'_>) -> Result<String, AdapterError> {
        match self.inner.generate_report(ctx).await {
            Err(e) if e.is_recoverable() => {
                warn!(error = %e, "Report generation failed, using minimal report");
                Ok(fallback_report(ctx.topic, ctx.findings, &e))
            }
            other => other,
        }
    }
}
