//! Error types for the research workflow
//!
//! Three layers, mirroring where a failure is observed:
//! - [`AdapterError`]: raised by a stage adapter's external call
//! - [`CacheError`] / [`StoreError`]: raised by the cache and persistence collaborators
//! - [`WorkflowError`]: anything that ends a run

use thiserror::Error;

use crate::state::Stage;

/// Errors produced at the stage-adapter boundary.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdapterError {
    /// The external call failed (network, provider outage, unusable response).
    #[error("External call failed: {0}")]
    Call(String),

    /// The external call did not finish in time.
    #[error("External call timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The collaborator answered, but the structured result breaks its contract.
    #[error("Malformed result: {0}")]
    Malformed(String),
}

impl AdapterError {
    /// Create a call error
    pub fn call(message: impl Into<String>) -> Self {
        Self::Call(message.into())
    }

    /// Create a malformed-result error
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }

    /// Whether a stage fallback may replace this error.
    ///
    /// Malformed results are a contract breach and are never papered over.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, AdapterError::Call(_) | AdapterError::Timeout(_))
    }
}

/// Key-value cache failures. Callers treat every variant as a forced miss.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt cache entry for {key}: {message}")]
    Corrupt { key: String, message: String },

    #[error("Cache serialization error: {0}")]
    Serialization(String),
}

/// Persistence sink failures.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Research not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors that end a research run.
#[derive(Error, Debug, Clone)]
pub enum WorkflowError {
    /// A stage adapter returned a structurally invalid result
    #[error("Malformed {stage} result: {reason}")]
    MalformedResult { stage: Stage, reason: String },

    /// A stage adapter failed and no fallback handled it
    #[error("{stage} failed: {source}")]
    Adapter {
        stage: Stage,
        #[source]
        source: AdapterError,
    },

    /// The run was cancelled between stages
    #[error("Research cancelled")]
    Cancelled,

    /// The engine was handed a state that is not a fresh initial state
    #[error("Invalid initial state: {0}")]
    InvalidInitialState(String),

    /// Persistence failed while the run was being streamed
    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),

    /// Invalid request or configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl WorkflowError {
    /// Create a malformed-result error for a stage
    pub fn malformed(stage: Stage, reason: impl Into<String>) -> Self {
        Self::MalformedResult {
            stage,
            reason: reason.into(),
        }
    }

    /// Classify an adapter error that reached the engine.
    ///
    /// Malformed results keep their own category; everything else is an
    /// unhandled adapter failure.
    pub fn from_adapter(stage: Stage, error: AdapterError) -> Self {
        match error {
            AdapterError::Malformed(reason) => Self::MalformedResult { stage, reason },
            other => Self::Adapter {
                stage,
                source: other,
            },
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Check if the error came from cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, WorkflowError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    static_assertions::assert_impl_all!(super::WorkflowError: Send, Sync);
    use super::*;

    #[test]
    fn test_adapter_error_recoverability() {
        assert!(AdapterError::call("boom").is_recoverable());
        assert!(AdapterError::Timeout(std::time::Duration::from_secs(30)).is_recoverable());
        assert!(!AdapterError::malformed("missing field").is_recoverable());
    }

    #[test]
    fn test_from_adapter_keeps_malformed_category() {
        let err = WorkflowError::from_adapter(Stage::Analyze, AdapterError::malformed("no gaps"));
        match err {
            WorkflowError::MalformedResult { stage, reason } => {
                assert_eq!(stage, Stage::Analyze);
                assert_eq!(reason, "no gaps");
            }
            _ => panic!("Wrong error type"),
        }

        let err = WorkflowError::from_adapter(Stage::Search, AdapterError::call("503"));
        assert!(matches!(err, WorkflowError::Adapter { stage: Stage::Search, .. }));
    }

    #[test]
    fn test_error_display() {
        let err = WorkflowError::malformed(Stage::Validate, "confidence 1.4 out of range");
        assert_eq!(
            err.to_string(),
            "Malformed validate result: confidence 1.4 out of range"
        );
        assert_eq!(WorkflowError::Cancelled.to_string(), "Research cancelled");
    }

    #[test]
    fn test_persistence_from_store_error() {
        let err: WorkflowError = StoreError::Io("disk full".into()).into();
        assert!(matches!(err, WorkflowError::Persistence(_)));
        assert!(err.to_string().contains("disk full"));
    }
}
