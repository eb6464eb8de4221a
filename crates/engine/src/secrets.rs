//! Secrets resolution, output masking, and permission gating.
//!
//! Everything here fails closed. A job only receives secrets it declares,
//! a declared secret missing from the vault aborts the instance before any
//! step runs, and a permission scope nobody granted resolves to no access.

use std::collections::BTreeMap;

use tracing::warn;

use crate::definition::types::{Job, PermissionLevel, WorkflowDefinition};
use crate::error::{EngineError, EngineResult};

/// Secret material available to a run, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct SecretVault {
    values: BTreeMap<String, String>,
}

impl SecretVault {
    pub fn new(values: BTreeMap<String, String>) -> Self {
        SecretVault { values }
    }

    pub fn insert(&mut self, name: &str, value: &str) {
        self.values.insert(name.to_string(), value.to_string());
    }

    /// Vault restricted to the named secrets. Used when handing secrets
    /// down to a reusable sub-workflow, which only sees what the calling
    /// job forwards.
    pub fn subset(&self, names: &[String]) -> SecretVault {
        let values = names
            .iter()
            .filter_map(|name| {
                self.values
                    .get(name)
                    .map(|value| (name.clone(), value.clone()))
            })
            .collect();
        SecretVault { values }
    }

    /// Resolve the secrets a job declares. Every declared name must be
    /// present; anything undeclared is never handed out.
    pub fn resolve(&self, job: &Job) -> EngineResult<BTreeMap<String, String>> {
        let mut resolved = BTreeMap::new();
        for name in &job.secrets {
            match self.values.get(name) {
                Some(value) => {
                    resolved.insert(name.clone(), value.clone());
                }
                None => {
                    return Err(EngineError::SecretDenied(format!(
                        "secret '{}' is declared but not provided",
                        name
                    )));
                }
            }
        }
        Ok(resolved)
    }
}

/// Replaces known secret values in captured output with `***`.
#[derive(Debug, Clone, Default)]
pub struct SecretMasker {
    values: Vec<String>,
}

impl SecretMasker {
    pub fn new<I: IntoIterator<Item = String>>(values: I) -> Self {
        // Empty values would turn masking into an infinite insertion.
        let mut values: Vec<String> = values.into_iter().filter(|v| !v.is_empty()).collect();
        // Longest first, so overlapping secrets mask fully.
        values.sort_by_key(|v| std::cmp::Reverse(v.len()));
        SecretMasker { values }
    }

    pub fn mask(&self, text: &str) -> String {
        let mut masked = text.to_string();
        for value in &self.values {
            if masked.contains(value.as_str()) {
                masked = masked.replace(value.as_str(), "***");
            }
        }
        masked
    }
}

/// Effective permission scopes for one job: workflow defaults overlaid
/// with the job's own block. A job-level `permissions:` replaces the
/// defaults wholesale, matching how overrides behave in the definition.
#[derive(Debug, Clone, Default)]
pub struct PermissionSet {
    scopes: BTreeMap<String, PermissionLevel>,
}

impl PermissionSet {
    pub fn for_job(definition: &WorkflowDefinition, job: &Job) -> Self {
        let scopes = match &job.permissions {
            Some(overrides) => overrides.clone(),
            None => definition.permissions.clone(),
        };
        PermissionSet { scopes }
    }

    fn level(&self, scope: &str) -> PermissionLevel {
        // Undeclared scopes grant nothing.
        self.scopes
            .get(scope)
            .copied()
            .unwrap_or(PermissionLevel::None)
    }

    pub fn check_read(&self, scope: &str) -> EngineResult<()> {
        if self.level(scope).allows_read() {
            Ok(())
        } else {
            warn!(scope, "read access denied");
            Err(EngineError::SecretDenied(format!(
                "missing '{}: read' permission",
                scope
            )))
        }
    }

    pub fn check_write(&self, scope: &str) -> EngineResult<()> {
        if self.level(scope).allows_write() {
            Ok(())
        } else {
            warn!(scope, "write access denied");
            Err(EngineError::SecretDenied(format!(
                "missing '{}: write' permission",
                scope
            )))
        }
    }
}
