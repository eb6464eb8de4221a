//! Workflow definition parser.
//!
//! Parses YAML documents into [`WorkflowDefinition`] structures and
//! validates them before any run starts. Everything rejected here is a
//! `Definition` error: the run never begins.

use std::path::Path;

use crate::definition::types::{Job, Step, WorkflowDefinition};
use crate::error::{EngineError, EngineResult};

/// Parse a YAML string into a validated WorkflowDefinition.
pub fn parse_definition(yaml_content: &str) -> EngineResult<WorkflowDefinition> {
    let mut definition: WorkflowDefinition =
        serde_yaml::from_str(yaml_content).map_err(|e| EngineError::Parse(e.to_string()))?;

    // The job id is the mapping key; copy it into each job.
    for (id, job) in definition.jobs.iter_mut() {
        job.id = id.clone();
    }

    validate_definition(&definition)?;

    Ok(definition)
}

/// Parse a definition from a file path.
pub fn parse_definition_file(path: &Path) -> EngineResult<WorkflowDefinition> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        EngineError::Definition(format!("cannot read {}: {}", path.display(), e))
    })?;
    parse_definition(&content)
}

/// Validate a parsed definition.
pub fn validate_definition(definition: &WorkflowDefinition) -> EngineResult<()> {
    if definition.name.trim().is_empty() {
        return Err(EngineError::Definition(
            "workflow name must not be empty".to_string(),
        ));
    }

    if definition.jobs.is_empty() {
        return Err(EngineError::Definition(
            "workflow must define at least one job".to_string(),
        ));
    }

    for job in definition.jobs.values() {
        validate_job(definition, job)?;
    }

    Ok(())
}

fn validate_job(definition: &WorkflowDefinition, job: &Job) -> EngineResult<()> {
    // A job either runs steps or calls a reusable workflow, never both.
    if job.is_reusable_call() && !job.steps.is_empty() {
        return Err(EngineError::Definition(format!(
            "job '{}': 'uses' and 'steps' are mutually exclusive",
            job.id
        )));
    }
    if !job.is_reusable_call() && job.steps.is_empty() {
        return Err(EngineError::Definition(format!(
            "job '{}': must have at least one step or a 'uses' reference",
            job.id
        )));
    }

    // Dependency targets must exist; cycles are the graph resolver's job.
    for needed in job.needs_ids() {
        if !definition.jobs.contains_key(needed) {
            return Err(EngineError::Definition(format!(
                "job '{}': needs unknown job '{}'",
                job.id, needed
            )));
        }
        if needed == job.id {
            return Err(EngineError::Cycle(format!("{0} -> {0}", job.id)));
        }
    }

    if let Some(matrix) = job.strategy.as_ref().and_then(|s| s.matrix.as_ref()) {
        for (axis, values) in &matrix.axes {
            if values.is_empty() {
                return Err(EngineError::Definition(format!(
                    "job '{}': matrix axis '{}' has no values",
                    job.id, axis
                )));
            }
        }
    }

    if job.timeout_minutes == Some(0) {
        return Err(EngineError::Definition(format!(
            "job '{}': timeout-minutes must be greater than zero",
            job.id
        )));
    }

    // Condition expressions are not checked here. A malformed `if` fails
    // the owning instance when it is promoted; siblings keep running.
    for (idx, step) in job.steps.iter().enumerate() {
        validate_step(job, idx, step)?;
    }

    Ok(())
}

fn validate_step(job: &Job, idx: usize, step: &Step) -> EngineResult<()> {
    match (&step.run, &step.uses) {
        (Some(_), Some(_)) => Err(EngineError::Definition(format!(
            "job '{}': step[{}] has both 'run' and 'uses'",
            job.id, idx
        ))),
        (None, None) => Err(EngineError::Definition(format!(
            "job '{}': step[{}] needs either 'run' or 'uses'",
            job.id, idx
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fills_job_ids() {
        let yaml = r#"
name: ids
jobs:
  alpha:
    steps:
      - run: "true"
  beta:
    needs: alpha
    steps:
      - run: "true"
"#;
        let def = parse_definition(yaml).unwrap();
        assert_eq!(def.jobs["alpha"].id, "alpha");
        assert_eq!(def.jobs["beta"].id, "beta");
    }

    #[test]
    fn test_unknown_needs_rejected() {
        let yaml = r#"
name: broken
jobs:
  build:
    needs: missing
    steps:
      - run: "true"
"#;
        let err = parse_definition(yaml).unwrap_err();
        assert!(matches!(err, EngineError::Definition(_)));
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let yaml = r#"
name: selfdep
jobs:
  build:
    needs: build
    steps:
      - run: "true"
"#;
        let err = parse_definition(yaml).unwrap_err();
        assert!(matches!(err, EngineError::Cycle(_)));
    }

    #[test]
    fn test_step_requires_run_or_uses() {
        let yaml = r#"
name: nostep
jobs:
  build:
    steps:
      - name: empty
"#;
        let err = parse_definition(yaml).unwrap_err();
        assert!(err.to_string().contains("'run' or 'uses'"));
    }

    #[test]
    fn test_uses_and_steps_exclusive() {
        let yaml = r#"
name: both
jobs:
  deploy:
    uses: ./other.yml
    steps:
      - run: "true"
"#;
        let err = parse_definition(yaml).unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn test_malformed_condition_parses() {
        // Condition syntax is a run-time concern; parsing must accept it
        // so sibling jobs still get to run.
        let yaml = r#"
name: badif
jobs:
  build:
    if: "event == "
    steps:
      - run: "true"
"#;
        let def = parse_definition(yaml).unwrap();
        assert_eq!(def.jobs["build"].condition.as_deref(), Some("event == "));
    }

    #[test]
    fn test_empty_matrix_axis_rejected() {
        let yaml = r#"
name: emptyaxis
jobs:
  build:
    strategy:
      matrix:
        os: []
    steps:
      - run: "true"
"#;
        let err = parse_definition(yaml).unwrap_err();
        assert!(err.to_string().contains("axis 'os'"));
    }
}
