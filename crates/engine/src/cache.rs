//! Cache keys and the local cache store.
//!
//! Cache keys are rendered from templates containing `${{ hash('<glob>') }}`
//! placeholders. The hash covers every file matching the glob under the
//! workspace, sorted by path, so the key is stable across machines that
//! share the same file contents.
//!
//! The store itself is append-only: saving under an existing key is a
//! no-op. Lookup tries the exact key first, then each restore key as a
//! prefix, newest entry first. Eviction is LRU over a configured entry
//! cap plus a maximum age.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};

const HASH_OPEN: &str = "${{";
const HASH_CLOSE: &str = "}}";

/// Render a cache key template, substituting `${{ hash('glob') }}`
/// placeholders. With `strict` set, a glob that matches no files is an
/// error; otherwise it hashes to the empty-input digest.
pub fn render_key(template: &str, workspace: &Path, strict: bool) -> EngineResult<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find(HASH_OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + HASH_OPEN.len()..];
        let end = after.find(HASH_CLOSE).ok_or_else(|| {
            EngineError::Definition(format!("unterminated placeholder in cache key '{}'", template))
        })?;
        let inner = after[..end].trim();
        let pattern = parse_hash_call(inner, template)?;
        out.push_str(&hash_files(&pattern, workspace, strict)?);
        rest = &after[end + HASH_CLOSE.len()..];
    }
    out.push_str(rest);

    if out.is_empty() {
        return Err(EngineError::Definition("cache key rendered empty".to_string()));
    }
    Ok(out)
}

/// Extract the glob from `hash('<glob>')`.
fn parse_hash_call(inner: &str, template: &str) -> EngineResult<String> {
    let bad = || {
        EngineError::Definition(format!(
            "cache key '{}': placeholder must be hash('<glob>'), got '{}'",
            template, inner
        ))
    };
    let args = inner
        .strip_prefix("hash(")
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(bad)?
        .trim();
    let pattern = args
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| args.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
        .ok_or_else(bad)?;
    if pattern.is_empty() {
        return Err(bad());
    }
    Ok(pattern.to_string())
}

/// SHA-256 over all files matching the glob, sorted by relative path.
/// Each file contributes its path and contents, so renames change the hash.
fn hash_files(pattern: &str, workspace: &Path, strict: bool) -> EngineResult<String> {
    let full_pattern = workspace.join(pattern);
    let full_pattern = full_pattern.to_string_lossy();

    let mut paths: Vec<PathBuf> = glob::glob(&full_pattern)
        .map_err(|e| EngineError::Definition(format!("invalid glob '{}': {}", pattern, e)))?
        .filter_map(|entry| entry.ok())
        .filter(|p| p.is_file())
        .collect();
    paths.sort();

    if paths.is_empty() {
        if strict {
            return Err(EngineError::NoMatch(format!(
                "hash glob '{}' matched no files",
                pattern
            )));
        }
        warn!(pattern, "hash glob matched no files, using empty digest");
    }

    let mut hasher = Sha256::new();
    for path in &paths {
        let rel = path.strip_prefix(workspace).unwrap_or(path);
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        let contents = fs::read(path)?;
        hasher.update(&contents);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    /// Blob file name under the store root.
    pub blob: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheIndex {
    entries: Vec<CacheEntry>,
}

/// On-disk cache store under `<state_dir>/cache`.
#[derive(Debug)]
pub struct CacheStore {
    root: PathBuf,
    index: CacheIndex,
    max_entries: usize,
    max_age: Duration,
}

impl CacheStore {
    pub fn open(config: &EngineConfig) -> EngineResult<Self> {
        let root = config.state_dir.join("cache");
        fs::create_dir_all(&root)?;

        let index_path = root.join("index.json");
        let index = if index_path.exists() {
            let raw = fs::read_to_string(&index_path)?;
            serde_json::from_str(&raw)
                .map_err(|e| EngineError::Storage(format!("corrupt cache index: {}", e)))?
        } else {
            CacheIndex::default()
        };

        Ok(CacheStore {
            root,
            index,
            max_entries: config.cache_max_entries,
            max_age: Duration::days(config.cache_max_age_days),
        })
    }

    fn persist(&self) -> EngineResult<()> {
        let raw = serde_json::to_string_pretty(&self.index)?;
        fs::write(self.root.join("index.json"), raw)?;
        Ok(())
    }

    /// Exact-key lookup, then restore keys as prefixes (most recently
    /// created entry wins per prefix). Returns the matched key and the
    /// blob path.
    pub fn restore(
        &mut self,
        key: &str,
        restore_keys: &[String],
    ) -> EngineResult<Option<(String, PathBuf)>> {
        let hit = self
            .index
            .entries
            .iter()
            .position(|e| e.key == key)
            .or_else(|| {
                restore_keys.iter().find_map(|prefix| {
                    self.index
                        .entries
                        .iter()
                        .enumerate()
                        .filter(|(_, e)| e.key.starts_with(prefix.as_str()))
                        .max_by_key(|(_, e)| e.created_at)
                        .map(|(i, _)| i)
                })
            });

        let Some(i) = hit else {
            debug!(key, "cache miss");
            return Ok(None);
        };

        self.index.entries[i].last_used_at = Utc::now();
        let matched = self.index.entries[i].key.clone();
        let blob = self.root.join(&self.index.entries[i].blob);
        self.persist()?;
        info!(key, matched = %matched, "cache hit");
        Ok(Some((matched, blob)))
    }

    /// Store a file under the key. Saving under an existing key is a
    /// no-op; returns whether a new entry was written.
    pub fn save(&mut self, key: &str, source: &Path) -> EngineResult<bool> {
        if self.index.entries.iter().any(|e| e.key == key) {
            debug!(key, "cache key already present, skipping save");
            return Ok(false);
        }
        if !source.is_file() {
            return Err(EngineError::Storage(format!(
                "cache source '{}' is not a file",
                source.display()
            )));
        }

        let blob = format!("{}.blob", hex::encode(Sha256::digest(key.as_bytes())));
        fs::copy(source, self.root.join(&blob))?;
        let size = fs::metadata(self.root.join(&blob))?.len();

        let now = Utc::now();
        self.index.entries.push(CacheEntry {
            key: key.to_string(),
            blob,
            size,
            created_at: now,
            last_used_at: now,
        });
        self.evict();
        self.persist()?;
        info!(key, size, "cache entry saved");
        Ok(true)
    }

    /// Drop entries past the age limit, then least-recently-used entries
    /// beyond the cap.
    fn evict(&mut self) {
        let cutoff = Utc::now() - self.max_age;
        let (keep, stale): (Vec<_>, Vec<_>) = std::mem::take(&mut self.index.entries)
            .into_iter()
            .partition(|e| e.created_at >= cutoff);
        self.index.entries = keep;
        for entry in stale {
            debug!(key = %entry.key, "evicting expired cache entry");
            let _ = fs::remove_file(self.root.join(&entry.blob));
        }

        while self.index.entries.len() > self.max_entries {
            let oldest = self
                .index
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.last_used_at)
                .map(|(i, _)| i);
            if let Some(i) = oldest {
                let entry = self.index.entries.remove(i);
                debug!(key = %entry.key, "evicting cache entry over capacity");
                let _ = fs::remove_file(self.root.join(&entry.blob));
            } else {
                break;
            }
        }
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.index.entries.len()
    }
}
