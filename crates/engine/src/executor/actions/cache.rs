//! Cache restore/save steps.
//!
//! Inputs:
//! - `key`: key template, may contain `${{ hash('<glob>') }}`
//! - `path`: file to save, or destination to restore into
//! - `restore-keys`: prefix fallbacks, restore only
//!
//! A restore miss is not a failure; the step reports it and the job
//! carries on so a later `cache/save` can repopulate the entry.

use async_trait::async_trait;
use tracing::info;

use crate::cache;
use crate::definition::types::Step;
use crate::error::EngineResult;
use crate::executor::outcome::StepOutcome;
use crate::executor::registry::{StepAction, StepContext};

pub struct CacheRestoreAction;

#[async_trait]
impl StepAction for CacheRestoreAction {
    fn name(&self) -> &str {
        "cache/restore"
    }

    async fn execute(&self, step: &Step, ctx: &StepContext) -> EngineResult<StepOutcome> {
        ctx.permissions.check_read("cache")?;

        let template = ctx.with_str(step, "key")?;
        let dest = ctx.workspace.join(ctx.with_str(step, "path")?);
        let restore_keys = ctx.with_list(step, "restore-keys")?;
        let key = cache::render_key(&template, &ctx.workspace, ctx.strict_hash)?;

        let hit = {
            let mut store = ctx.stores.cache.lock().await;
            store.restore(&key, &restore_keys)?
        };

        match hit {
            Some((matched, blob)) => {
                if let Some(parent) = dest.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::copy(&blob, &dest).await?;
                info!(key, matched = %matched, "cache restored");
                Ok(StepOutcome::success(format!(
                    "cache hit: '{}' (requested '{}')",
                    matched, key
                )))
            }
            None => Ok(StepOutcome::success(format!("cache miss for '{}'", key))),
        }
    }
}

pub struct CacheSaveAction;

#[async_trait]
impl StepAction for CacheSaveAction {
    fn name(&self) -> &str {
        "cache/save"
    }

    async fn execute(&self, step: &Step, ctx: &StepContext) -> EngineResult<StepOutcome> {
        ctx.permissions.check_write("cache")?;

        let template = ctx.with_str(step, "key")?;
        let source = ctx.workspace.join(ctx.with_str(step, "path")?);
        let key = cache::render_key(&template, &ctx.workspace, ctx.strict_hash)?;

        let written = {
            let mut store = ctx.stores.cache.lock().await;
            store.save(&key, &source)?
        };

        Ok(StepOutcome::success(if written {
            format!("cache saved under '{}'", key)
        } else {
            format!("cache entry '{}' already exists, skipped", key)
        }))
    }
}
