//! Step action trait and registry.
//!
//! `run:` steps dispatch to the shell action; `uses:` steps look up a
//! built-in by its reference, e.g. `cache/restore`. Custom actions can be
//! registered before the scheduler starts.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::artifact::ArtifactStore;
use crate::cache::CacheStore;
use crate::definition::types::Step;
use crate::error::{EngineError, EngineResult};
use crate::executor::outcome::StepOutcome;
use crate::secrets::{PermissionSet, SecretMasker};

/// Shared storage backends, serialized behind async locks.
#[derive(Debug)]
pub struct Stores {
    pub cache: Mutex<CacheStore>,
    pub artifacts: Mutex<ArtifactStore>,
}

/// Everything a step action can see while executing.
pub struct StepContext {
    pub run_id: u64,
    pub workspace: PathBuf,
    /// Fully assembled environment: trigger vars, matrix vars, secrets,
    /// job and step env.
    pub env: BTreeMap<String, String>,
    pub permissions: PermissionSet,
    pub masker: SecretMasker,
    pub strict_hash: bool,
    pub stores: Arc<Stores>,
}

impl StepContext {
    /// Required string input from the step's `with` block.
    pub fn with_str(&self, step: &Step, key: &str) -> EngineResult<String> {
        self.with_str_opt(step, key)?.ok_or_else(|| {
            EngineError::Definition(format!(
                "step '{}' is missing required input '{}'",
                step.display_name(),
                key
            ))
        })
    }

    /// Optional string input. Non-string scalars are stringified.
    pub fn with_str_opt(&self, step: &Step, key: &str) -> EngineResult<Option<String>> {
        let Some(with) = &step.with else {
            return Ok(None);
        };
        match with.get(key) {
            None => Ok(None),
            Some(serde_json::Value::String(s)) => Ok(Some(s.clone())),
            Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
            Some(serde_json::Value::Bool(b)) => Ok(Some(b.to_string())),
            Some(other) => Err(EngineError::Definition(format!(
                "step '{}' input '{}' must be a scalar, got {}",
                step.display_name(),
                key,
                other
            ))),
        }
    }

    /// Optional list-of-strings input.
    pub fn with_list(&self, step: &Step, key: &str) -> EngineResult<Vec<String>> {
        let Some(value) = step.with.as_ref().and_then(|w| w.get(key)) else {
            return Ok(Vec::new());
        };
        match value {
            serde_json::Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    serde_json::Value::String(s) => Ok(s.clone()),
                    other => Err(EngineError::Definition(format!(
                        "step '{}' input '{}' must be a list of strings, got {}",
                        step.display_name(),
                        key,
                        other
                    ))),
                })
                .collect(),
            serde_json::Value::String(s) => Ok(vec![s.clone()]),
            other => Err(EngineError::Definition(format!(
                "step '{}' input '{}' must be a list of strings, got {}",
                step.display_name(),
                key,
                other
            ))),
        }
    }
}

/// A built-in step action.
#[async_trait]
pub trait StepAction: Send + Sync {
    /// Reference the action is registered under, e.g. `cache/restore`.
    fn name(&self) -> &str;

    async fn execute(&self, step: &Step, ctx: &StepContext) -> EngineResult<StepOutcome>;
}

/// Registry of step actions keyed by reference.
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn StepAction>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        ActionRegistry {
            actions: HashMap::new(),
        }
    }

    /// Registry preloaded with the shell action and the cache/artifact
    /// built-ins.
    pub fn with_builtins() -> Self {
        let mut registry = ActionRegistry::new();
        registry.register(Arc::new(crate::executor::actions::shell::ShellAction));
        registry.register(Arc::new(crate::executor::actions::cache::CacheRestoreAction));
        registry.register(Arc::new(crate::executor::actions::cache::CacheSaveAction));
        registry.register(Arc::new(crate::executor::actions::artifact::UploadAction));
        registry.register(Arc::new(crate::executor::actions::artifact::DownloadAction));
        registry
    }

    pub fn register(&mut self, action: Arc<dyn StepAction>) {
        self.actions.insert(action.name().to_string(), action);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StepAction>> {
        self.actions.get(name).cloned()
    }

    /// Resolve the action for a step: `uses` reference, or the shell
    /// action for `run` steps.
    pub fn resolve(&self, step: &Step) -> EngineResult<Arc<dyn StepAction>> {
        let name = step.uses.as_deref().unwrap_or(shell_action_name());
        self.get(name).ok_or_else(|| {
            EngineError::Definition(format!("unknown action '{}'", name))
        })
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

pub(crate) fn shell_action_name() -> &'static str {
    "run"
}
