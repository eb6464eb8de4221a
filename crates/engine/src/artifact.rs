//! Versioned artifact store.
//!
//! Artifacts are namespaced per run and addressed by name. Uploading the
//! same name again in one run creates a new version; downloads resolve to
//! the latest version unless one is pinned. Blob storage is
//! content-addressed, so identical payloads across runs and versions share
//! a single file on disk.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub run_id: u64,
    pub name: String,
    pub version: u64,
    /// Content digest, also the blob file name.
    pub digest: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ArtifactIndex {
    records: Vec<ArtifactRecord>,
}

/// On-disk artifact store under `<state_dir>/artifacts`.
#[derive(Debug)]
pub struct ArtifactStore {
    root: PathBuf,
    index: ArtifactIndex,
    retention: Duration,
}

impl ArtifactStore {
    pub fn open(config: &EngineConfig) -> EngineResult<Self> {
        let root = config.state_dir.join("artifacts");
        fs::create_dir_all(root.join("blobs"))?;

        let index_path = root.join("index.json");
        let index = if index_path.exists() {
            let raw = fs::read_to_string(&index_path)?;
            serde_json::from_str(&raw)
                .map_err(|e| EngineError::Storage(format!("corrupt artifact index: {}", e)))?
        } else {
            ArtifactIndex::default()
        };

        Ok(ArtifactStore {
            root,
            index,
            retention: Duration::days(config.artifact_retention_days),
        })
    }

    fn persist(&self) -> EngineResult<()> {
        let raw = serde_json::to_string_pretty(&self.index)?;
        fs::write(self.root.join("index.json"), raw)?;
        Ok(())
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        self.root.join("blobs").join(format!("{}.blob", digest))
    }

    /// Upload a file as the next version of `name` within the run.
    pub fn put(&mut self, run_id: u64, name: &str, source: &Path) -> EngineResult<ArtifactRecord> {
        if !source.is_file() {
            return Err(EngineError::Storage(format!(
                "artifact source '{}' is not a file",
                source.display()
            )));
        }
        let contents = fs::read(source)?;
        let digest = hex::encode(Sha256::digest(&contents));
        let blob = self.blob_path(&digest);
        if !blob.exists() {
            fs::write(&blob, &contents)?;
        } else {
            debug!(digest = %digest, "artifact blob already present");
        }

        let version = self
            .index
            .records
            .iter()
            .filter(|r| r.run_id == run_id && r.name == name)
            .map(|r| r.version)
            .max()
            .map_or(1, |v| v + 1);

        let record = ArtifactRecord {
            run_id,
            name: name.to_string(),
            version,
            digest,
            size: contents.len() as u64,
            created_at: Utc::now(),
        };
        self.index.records.push(record.clone());
        self.persist()?;
        info!(run_id, name, version, size = record.size, "artifact stored");
        Ok(record)
    }

    /// Resolve an artifact to its blob path. `version: None` means latest.
    pub fn get(
        &self,
        run_id: u64,
        name: &str,
        version: Option<u64>,
    ) -> EngineResult<(ArtifactRecord, PathBuf)> {
        let record = self
            .index
            .records
            .iter()
            .filter(|r| r.run_id == run_id && r.name == name)
            .filter(|r| version.map_or(true, |v| r.version == v))
            .max_by_key(|r| r.version)
            .cloned()
            .ok_or_else(|| {
                EngineError::NotFound(format!(
                    "artifact '{}' (run {}{})",
                    name,
                    run_id,
                    version.map(|v| format!(", version {}", v)).unwrap_or_default()
                ))
            })?;
        let blob = self.blob_path(&record.digest);
        Ok((record, blob))
    }

    /// All artifact records for a run, name then version order.
    pub fn list(&self, run_id: u64) -> Vec<ArtifactRecord> {
        let mut records: Vec<ArtifactRecord> = self
            .index
            .records
            .iter()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name).then(a.version.cmp(&b.version)));
        records
    }

    /// Drop records past the retention window and any blobs no record
    /// references anymore. Returns the number of records removed.
    pub fn prune(&mut self) -> EngineResult<usize> {
        let cutoff = Utc::now() - self.retention;
        let (keep, stale): (Vec<_>, Vec<_>) = std::mem::take(&mut self.index.records)
            .into_iter()
            .partition(|r| r.created_at >= cutoff);
        self.index.records = keep;

        let removed = stale.len();
        for record in stale {
            let referenced = self
                .index
                .records
                .iter()
                .any(|r| r.digest == record.digest);
            if !referenced {
                let _ = fs::remove_file(self.blob_path(&record.digest));
            }
        }
        if removed > 0 {
            self.persist()?;
            info!(removed, "pruned expired artifacts");
        }
        Ok(removed)
    }
}
