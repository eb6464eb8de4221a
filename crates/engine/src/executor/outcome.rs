//! Step execution outcomes.

use serde::{Deserialize, Serialize};

/// Result of executing one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Combined stdout/stderr, secret values already masked.
    #[serde(default)]
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepOutcome {
    pub fn success(output: impl Into<String>) -> Self {
        StepOutcome {
            succeeded: true,
            exit_code: Some(0),
            output: output.into(),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>, exit_code: Option<i32>) -> Self {
        StepOutcome {
            succeeded: false,
            exit_code,
            output: String::new(),
            error: Some(error.into()),
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors() {
        let ok = StepOutcome::success("done");
        assert!(ok.succeeded);
        assert_eq!(ok.exit_code, Some(0));

        let bad = StepOutcome::failure("boom", Some(2)).with_output("partial");
        assert!(!bad.succeeded);
        assert_eq!(bad.exit_code, Some(2));
        assert_eq!(bad.output, "partial");
        assert_eq!(bad.error.as_deref(), Some("boom"));
    }
}
