//! Artifact upload/download steps.
//!
//! Inputs:
//! - `name`: artifact name within the run
//! - `path`: file to upload, or destination for download
//! - `version`: download only, pin a version instead of latest
//! - `run`: download only, read from a completed upstream run instead
//!   of the current one (how deploy workflows consume build outputs)

use async_trait::async_trait;
use tracing::info;

use crate::definition::types::Step;
use crate::error::{EngineError, EngineResult};
use crate::executor::outcome::StepOutcome;
use crate::executor::registry::{StepAction, StepContext};

pub struct UploadAction;

#[async_trait]
impl StepAction for UploadAction {
    fn name(&self) -> &str {
        "artifact/upload"
    }

    async fn execute(&self, step: &Step, ctx: &StepContext) -> EngineResult<StepOutcome> {
        ctx.permissions.check_write("artifacts")?;

        let name = ctx.with_str(step, "name")?;
        let source = ctx.workspace.join(ctx.with_str(step, "path")?);

        let record = {
            let mut store = ctx.stores.artifacts.lock().await;
            store.put(ctx.run_id, &name, &source)?
        };
        info!(name, version = record.version, "artifact uploaded");
        Ok(StepOutcome::success(format!(
            "uploaded '{}' version {} ({} bytes)",
            record.name, record.version, record.size
        )))
    }
}

pub struct DownloadAction;

#[async_trait]
impl StepAction for DownloadAction {
    fn name(&self) -> &str {
        "artifact/download"
    }

    async fn execute(&self, step: &Step, ctx: &StepContext) -> EngineResult<StepOutcome> {
        ctx.permissions.check_read("artifacts")?;

        let name = ctx.with_str(step, "name")?;
        let dest = ctx.workspace.join(ctx.with_str(step, "path")?);
        let version = parse_u64_input(ctx, step, "version")?;
        let run_id = parse_u64_input(ctx, step, "run")?.unwrap_or(ctx.run_id);

        let (record, blob) = {
            let store = ctx.stores.artifacts.lock().await;
            store.get(run_id, &name, version)?
        };
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&blob, &dest).await?;
        info!(name, version = record.version, "artifact downloaded");
        Ok(StepOutcome::success(format!(
            "downloaded '{}' version {}",
            record.name, record.version
        )))
    }
}

fn parse_u64_input(ctx: &StepContext, step: &Step, key: &str) -> EngineResult<Option<u64>> {
    match ctx.with_str_opt(step, key)? {
        Some(raw) => raw.parse::<u64>().map(Some).map_err(|_| {
            EngineError::Definition(format!(
                "step '{}' input '{}' must be a positive integer, got '{}'",
                step.display_name(),
                key,
                raw
            ))
        }),
        None => Ok(None),
    }
}
