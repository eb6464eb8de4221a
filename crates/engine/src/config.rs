//! Engine configuration.
//!
//! Loaded from environment variables prefixed with `CONVEYOR_`:
//! - `CONVEYOR_STATE_DIR`: persistent state directory (default: `~/.conveyor`)
//! - `CONVEYOR_MAX_PARALLEL`: max concurrent job instances (default: 4)
//! - `CONVEYOR_NEEDS_SUCCESS_ONLY`: skipped deps do not satisfy `needs` (default: false)
//! - `CONVEYOR_STRICT_HASH`: zero-match hash placeholders are fatal (default: false)
//! - `CONVEYOR_CACHE_MAX_ENTRIES`: cache eviction bound (default: 256)
//! - `CONVEYOR_CACHE_MAX_AGE_DAYS`: cache age bound (default: 7)
//! - `CONVEYOR_ARTIFACT_RETENTION_DAYS`: artifact retention (default: 30)
//! - `CONVEYOR_DEFAULT_TIMEOUT_MINUTES`: per-instance timeout (default: 60)
//! - `CONVEYOR_APPROVED_ENVIRONMENTS`: comma-separated auto-approved gates

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::EngineResult;

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Persistent state directory.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Maximum number of concurrently running job instances.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// When true, a Skipped dependency does not satisfy `needs`.
    #[serde(default)]
    pub needs_success_only: bool,

    /// When true, a hash placeholder matching zero files is an error
    /// instead of hashing the empty input.
    #[serde(default)]
    pub strict_hash: bool,

    /// Maximum number of cache entries before LRU eviction.
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,

    /// Maximum cache entry age in days.
    #[serde(default = "default_cache_max_age_days")]
    pub cache_max_age_days: i64,

    /// Artifact retention in days.
    #[serde(default = "default_artifact_retention_days")]
    pub artifact_retention_days: i64,

    /// Default per-instance wall-clock timeout in minutes.
    #[serde(default = "default_timeout_minutes")]
    pub default_timeout_minutes: u64,

    /// Comma-separated environment names that pass the approval gate.
    #[serde(default)]
    pub approved_environments: Option<String>,
}

fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".conveyor")
}

fn default_max_parallel() -> usize {
    4
}

fn default_cache_max_entries() -> usize {
    256
}

fn default_cache_max_age_days() -> i64 {
    7
}

fn default_artifact_retention_days() -> i64 {
    30
}

fn default_timeout_minutes() -> u64 {
    60
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            max_parallel: default_max_parallel(),
            needs_success_only: false,
            strict_hash: false,
            cache_max_entries: default_cache_max_entries(),
            cache_max_age_days: default_cache_max_age_days(),
            artifact_retention_days: default_artifact_retention_days(),
            default_timeout_minutes: default_timeout_minutes(),
            approved_environments: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `CONVEYOR_`-prefixed environment variables.
    pub fn from_env() -> EngineResult<Self> {
        Ok(envy::prefixed("CONVEYOR_").from_env::<EngineConfig>()?)
    }

    /// Whether the named deployment environment passes the approval gate.
    pub fn environment_approved(&self, name: &str) -> bool {
        self.approved_environments
            .as_deref()
            .map(|list| list.split(',').any(|e| e.trim() == name))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_parallel, 4);
        assert!(!config.needs_success_only);
        assert!(!config.strict_hash);
        assert_eq!(config.cache_max_entries, 256);
    }

    #[test]
    fn test_environment_approved() {
        let config = EngineConfig {
            approved_environments: Some("staging, production".to_string()),
            ..Default::default()
        };
        assert!(config.environment_approved("staging"));
        assert!(config.environment_approved("production"));
        assert!(!config.environment_approved("prod-eu"));

        let closed = EngineConfig::default();
        assert!(!closed.environment_approved("staging"));
    }
}
