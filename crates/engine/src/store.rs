//! Run persistence.
//!
//! Each run is one JSON document under `<state_dir>/runs/<id>.json`,
//! rewritten on every instance transition so `conveyor status` always
//! reflects the latest state, crash included. Run ids come from a
//! plain counter file.

use std::fs;
use std::path::PathBuf;

use tracing::debug;

use crate::config::EngineConfig;
use crate::engine::run::Run;
use crate::error::{EngineError, EngineResult};

#[derive(Debug)]
pub struct RunStore {
    runs_dir: PathBuf,
    counter_path: PathBuf,
}

impl RunStore {
    pub fn open(config: &EngineConfig) -> EngineResult<Self> {
        let runs_dir = config.state_dir.join("runs");
        fs::create_dir_all(&runs_dir)?;
        Ok(RunStore {
            counter_path: config.state_dir.join("run-counter"),
            runs_dir,
        })
    }

    /// Allocate the next run id and advance the counter.
    pub fn next_run_id(&self) -> EngineResult<u64> {
        let current = match fs::read_to_string(&self.counter_path) {
            Ok(raw) => raw.trim().parse::<u64>().map_err(|_| {
                EngineError::Storage(format!(
                    "corrupt run counter '{}'",
                    self.counter_path.display()
                ))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        let next = current + 1;
        fs::write(&self.counter_path, next.to_string())?;
        Ok(next)
    }

    fn run_path(&self, id: u64) -> PathBuf {
        self.runs_dir.join(format!("{}.json", id))
    }

    /// Persist the full run record, replacing any previous snapshot.
    pub fn save(&self, run: &Run) -> EngineResult<()> {
        let raw = serde_json::to_string_pretty(run)?;
        fs::write(self.run_path(run.id), raw)?;
        debug!(run_id = run.id, status = run.status.as_str(), "run persisted");
        Ok(())
    }

    pub fn load(&self, id: u64) -> EngineResult<Run> {
        let path = self.run_path(id);
        let raw = fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EngineError::NotFound(format!("run {}", id))
            } else {
                e.into()
            }
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| EngineError::Storage(format!("corrupt run record {}: {}", id, e)))
    }

    /// Ids of all persisted runs, ascending.
    pub fn list(&self) -> EngineResult<Vec<u64>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.runs_dir)? {
            let name = entry?.file_name();
            if let Some(id) = name
                .to_str()
                .and_then(|n| n.strip_suffix(".json"))
                .and_then(|n| n.parse::<u64>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }
}
