//! Error types for the Conveyor engine.
//!
//! Errors are contained at the smallest scope that preserves correctness:
//! a step failure fails its job instance, an instance failure blocks only
//! its dependents, and only structural errors (bad definition, dependency
//! cycle) abort a run before any instance executes.

use thiserror::Error;

/// Engine-level errors.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed workflow definition (unknown field, missing job, bad reference).
    #[error("Definition error: {0}")]
    Definition(String),

    /// The `needs` relation contains a cycle.
    #[error("Dependency cycle: {0}")]
    Cycle(String),

    /// A job's `if` expression could not be parsed or evaluated.
    #[error("Condition error: {0}")]
    ConditionEval(String),

    /// A step inside a job instance failed.
    #[error("Step execution failed: {0}")]
    StepExecution(String),

    /// A job instance exceeded its wall-clock timeout.
    #[error("Execution timed out after {0} minutes")]
    Timeout(u64),

    /// A cache key hash placeholder matched zero files (strict mode only).
    #[error("Hash placeholder matched no files: {0}")]
    NoMatch(String),

    /// A job requested a secret or permission scope it did not declare,
    /// or one that was never provided. Fails closed.
    #[error("Access denied: {0}")]
    SecretDenied(String),

    /// Requested resource (run, artifact) does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Persistent state could not be read or written.
    #[error("Storage error: {0}")]
    Storage(String),

    /// YAML parse error.
    #[error("Parse error: {0}")]
    Parse(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias using EngineError.
pub type EngineResult<T> = Result<T, EngineError>;

impl From<envy::Error> for EngineError {
    fn from(err: envy::Error) -> Self {
        EngineError::Config(err.to_string())
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::StepExecution(err.to_string())
    }
}

impl EngineError {
    /// True for errors that abort a run before any instance starts.
    pub fn is_structural(&self) -> bool {
        matches!(self, EngineError::Definition(_) | EngineError::Cycle(_) | EngineError::Parse(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::Cycle("a -> b -> a".to_string());
        assert_eq!(err.to_string(), "Dependency cycle: a -> b -> a");

        let err = EngineError::Timeout(30);
        assert_eq!(err.to_string(), "Execution timed out after 30 minutes");
    }

    #[test]
    fn test_structural_errors() {
        assert!(EngineError::Definition("bad".into()).is_structural());
        assert!(EngineError::Cycle("a -> a".into()).is_structural());
        assert!(!EngineError::StepExecution("boom".into()).is_structural());
        assert!(!EngineError::SecretDenied("TOKEN".into()).is_structural());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: EngineError = io_err.into();
        assert!(matches!(err, EngineError::Io(_)));
    }
}
