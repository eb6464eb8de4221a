//! Workflow definition model.
//!
//! Type definitions for Conveyor workflow documents:
//! - top-level trigger list, permissions mapping, jobs mapping
//! - job.needs for DAG edges, strategy.matrix for expansion
//! - job.if / step.if condition guards
//! - job.uses for reusable sub-workflows with typed inputs/secrets
//!
//! A definition is immutable once loaded for a run.

use std::collections::BTreeMap;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Declared permission level for a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    Read,
    Write,
    None,
}

impl PermissionLevel {
    /// Whether this level grants read access (write implies read).
    pub fn allows_read(&self) -> bool {
        matches!(self, PermissionLevel::Read | PermissionLevel::Write)
    }

    /// Whether this level grants write access.
    pub fn allows_write(&self) -> bool {
        matches!(self, PermissionLevel::Write)
    }
}

impl std::fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PermissionLevel::Read => write!(f, "read"),
            PermissionLevel::Write => write!(f, "write"),
            PermissionLevel::None => write!(f, "none"),
        }
    }
}

/// Trigger list - single event name or list of event names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TriggerSpec {
    /// Single trigger event.
    Single(String),

    /// List of trigger events.
    List(Vec<String>),
}

impl TriggerSpec {
    /// All trigger event names.
    pub fn events(&self) -> Vec<&str> {
        match self {
            TriggerSpec::Single(e) => vec![e.as_str()],
            TriggerSpec::List(list) => list.iter().map(|e| e.as_str()).collect(),
        }
    }

    /// Whether the given event name is declared as a trigger.
    pub fn matches(&self, event: &str) -> bool {
        self.events().contains(&event)
    }
}

/// `needs` specification - single job id or list of job ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NeedsSpec {
    /// Single dependency.
    Single(String),

    /// List of dependencies.
    List(Vec<String>),
}

impl NeedsSpec {
    /// Dependency job ids.
    pub fn job_ids(&self) -> Vec<&str> {
        match self {
            NeedsSpec::Single(id) => vec![id.as_str()],
            NeedsSpec::List(ids) => ids.iter().map(|id| id.as_str()).collect(),
        }
    }
}

/// Matrix axes with include/exclude override lists.
///
/// Axis declaration order is preserved so expansion is deterministic;
/// a plain map type would lose it, so deserialization is hand-rolled.
#[derive(Debug, Clone, Default)]
pub struct Matrix {
    /// Axis name -> ordered values, in declaration order.
    pub axes: Vec<(String, Vec<serde_json::Value>)>,

    /// Points appended after expansion.
    pub include: Vec<BTreeMap<String, serde_json::Value>>,

    /// Points (full or partial) removed from the cross-product.
    pub exclude: Vec<BTreeMap<String, serde_json::Value>>,
}

impl<'de> Deserialize<'de> for Matrix {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct MatrixVisitor;

        impl<'de> Visitor<'de> for MatrixVisitor {
            type Value = Matrix;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a mapping of matrix axes with optional include/exclude")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Matrix, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut matrix = Matrix::default();
                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "include" => matrix.include = map.next_value()?,
                        "exclude" => matrix.exclude = map.next_value()?,
                        _ => {
                            let values: Vec<serde_json::Value> = map.next_value()?;
                            matrix.axes.push((key, values));
                        }
                    }
                }
                Ok(matrix)
            }
        }

        deserializer.deserialize_map(MatrixVisitor)
    }
}

impl Serialize for Matrix {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let extra = usize::from(!self.include.is_empty()) + usize::from(!self.exclude.is_empty());
        let mut map = serializer.serialize_map(Some(self.axes.len() + extra))?;
        for (axis, values) in &self.axes {
            map.serialize_entry(axis, values)?;
        }
        if !self.include.is_empty() {
            map.serialize_entry("include", &self.include)?;
        }
        if !self.exclude.is_empty() {
            map.serialize_entry("exclude", &self.exclude)?;
        }
        map.end()
    }
}

/// Job execution strategy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Strategy {
    /// Matrix axes for expansion.
    #[serde(default)]
    pub matrix: Option<Matrix>,
}

/// A single step inside a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Step {
    /// Step identifier (defaults to the step's position).
    #[serde(default)]
    pub id: Option<String>,

    /// Display name.
    #[serde(default)]
    pub name: Option<String>,

    /// Inline command (mutually exclusive with `uses`).
    #[serde(default)]
    pub run: Option<String>,

    /// Built-in action reference (e.g. `cache/restore`, `artifact/upload`).
    #[serde(default)]
    pub uses: Option<String>,

    /// Action inputs.
    #[serde(default)]
    pub with: Option<BTreeMap<String, serde_json::Value>>,

    /// Step-level condition guard.
    #[serde(default, rename = "if")]
    pub condition: Option<String>,

    /// Extra environment variables for this step.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Step {
    /// Display name, falling back to the command or action reference.
    pub fn display_name(&self) -> &str {
        if let Some(name) = &self.name {
            return name;
        }
        if let Some(uses) = &self.uses {
            return uses;
        }
        self.run.as_deref().unwrap_or("step")
    }
}

/// A job definition: DAG node, matrix template, step sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct Job {
    /// Job id (the key in the `jobs` mapping, filled in after parse).
    #[serde(skip)]
    pub id: String,

    /// Display name.
    #[serde(default)]
    pub name: Option<String>,

    /// Runner requirement tag.
    #[serde(default)]
    pub runs_on: Option<String>,

    /// DAG edges: jobs that must reach a terminal state first.
    #[serde(default)]
    pub needs: Option<NeedsSpec>,

    /// Matrix expansion strategy.
    #[serde(default)]
    pub strategy: Option<Strategy>,

    /// Condition guard; absent means `success()`.
    #[serde(default, rename = "if")]
    pub condition: Option<String>,

    /// Ordered step sequence.
    #[serde(default)]
    pub steps: Vec<Step>,

    /// Reusable workflow reference (path to another definition file).
    #[serde(default)]
    pub uses: Option<String>,

    /// Inputs bound into the sub-run.
    #[serde(default)]
    pub with: Option<BTreeMap<String, serde_json::Value>>,

    /// Secret names this job may read (and passes to a sub-run).
    #[serde(default)]
    pub secrets: Vec<String>,

    /// Deployment environment gate.
    #[serde(default)]
    pub environment: Option<String>,

    /// Wall-clock timeout in minutes.
    #[serde(default)]
    pub timeout_minutes: Option<u64>,

    /// Per-job permission overrides.
    #[serde(default)]
    pub permissions: Option<BTreeMap<String, PermissionLevel>>,
}

impl Job {
    /// Dependency job ids.
    pub fn needs_ids(&self) -> Vec<&str> {
        self.needs.as_ref().map(|n| n.job_ids()).unwrap_or_default()
    }

    /// Display name, falling back to the job id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Whether this job invokes a reusable sub-workflow.
    pub fn is_reusable_call(&self) -> bool {
        self.uses.is_some()
    }
}

/// Complete workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowDefinition {
    /// Workflow name.
    pub name: String,

    /// Trigger events.
    #[serde(default, rename = "on")]
    pub triggers: Option<TriggerSpec>,

    /// Declared permission scopes (workflow defaults).
    #[serde(default)]
    pub permissions: BTreeMap<String, PermissionLevel>,

    /// Jobs keyed by id.
    pub jobs: BTreeMap<String, Job>,
}

impl WorkflowDefinition {
    /// Get a job by id.
    pub fn job(&self, id: &str) -> Option<&Job> {
        self.jobs.get(id)
    }

    /// All job ids in deterministic (sorted) order.
    pub fn job_ids(&self) -> Vec<&str> {
        self.jobs.keys().map(|id| id.as_str()).collect()
    }

    /// Whether the given event triggers this workflow.
    /// A definition with no trigger list accepts any event.
    pub fn triggered_by(&self, event: &str) -> bool {
        self.triggers.as_ref().map(|t| t.matches(event)).unwrap_or(true)
    }
}

/// Render a matrix scalar for instance names and environment injection.
pub fn scalar_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_definition() {
        let yaml = r#"
name: build-and-test
on: [push, pull_request]
permissions:
  artifacts: write
  cache: write
jobs:
  build:
    runs-on: linux
    steps:
      - name: compile
        run: make build
  test:
    needs: build
    steps:
      - run: make test
"#;

        let def: WorkflowDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(def.name, "build-and-test");
        assert!(def.triggered_by("push"));
        assert!(!def.triggered_by("schedule"));
        assert_eq!(def.jobs.len(), 2);
        assert_eq!(def.jobs["test"].needs_ids(), vec!["build"]);
        assert_eq!(def.permissions["artifacts"], PermissionLevel::Write);
    }

    #[test]
    fn test_parse_matrix_preserves_axis_order() {
        let yaml = r#"
name: matrix-test
jobs:
  build:
    strategy:
      matrix:
        os: [linux, macos]
        version: ["1.70", "1.75"]
        exclude:
          - os: macos
            version: "1.70"
    steps:
      - run: echo hi
"#;

        let def: WorkflowDefinition = serde_yaml::from_str(yaml).unwrap();
        let matrix = def.jobs["build"]
            .strategy
            .as_ref()
            .unwrap()
            .matrix
            .as_ref()
            .unwrap();
        assert_eq!(matrix.axes[0].0, "os");
        assert_eq!(matrix.axes[1].0, "version");
        assert_eq!(matrix.exclude.len(), 1);
    }

    #[test]
    fn test_parse_reusable_call() {
        let yaml = r#"
name: release
jobs:
  deploy:
    uses: ./deploy.yml
    with:
      target: production
    secrets: [DEPLOY_TOKEN]
    environment: production
"#;

        let def: WorkflowDefinition = serde_yaml::from_str(yaml).unwrap();
        let deploy = &def.jobs["deploy"];
        assert!(deploy.is_reusable_call());
        assert_eq!(deploy.secrets, vec!["DEPLOY_TOKEN"]);
        assert_eq!(deploy.environment.as_deref(), Some("production"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let yaml = r#"
name: bad
jobs:
  build:
    steps: []
    retries: 3
"#;

        let result: Result<WorkflowDefinition, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn test_matrix_roundtrip() {
        let yaml = r#"
os: [linux, macos]
include:
  - os: windows
"#;
        let matrix: Matrix = serde_yaml::from_str(yaml).unwrap();
        let out = serde_yaml::to_string(&matrix).unwrap();
        let back: Matrix = serde_yaml::from_str(&out).unwrap();
        assert_eq!(back.axes[0].0, "os");
        assert_eq!(back.include.len(), 1);
    }

    #[test]
    fn test_scalar_to_string() {
        assert_eq!(scalar_to_string(&serde_json::json!("linux")), "linux");
        assert_eq!(scalar_to_string(&serde_json::json!(42)), "42");
        assert_eq!(scalar_to_string(&serde_json::json!(true)), "true");
    }
}
