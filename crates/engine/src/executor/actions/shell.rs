//! Shell step execution.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::definition::types::Step;
use crate::error::{EngineError, EngineResult};
use crate::executor::outcome::StepOutcome;
use crate::executor::registry::{shell_action_name, StepAction, StepContext};

/// Executes `run:` commands through `sh -c` in the workspace directory.
pub struct ShellAction;

#[async_trait]
impl StepAction for ShellAction {
    fn name(&self) -> &str {
        shell_action_name()
    }

    async fn execute(&self, step: &Step, ctx: &StepContext) -> EngineResult<StepOutcome> {
        let command = step.run.as_deref().ok_or_else(|| {
            EngineError::Definition(format!(
                "step '{}' has no command to run",
                step.display_name()
            ))
        })?;
        debug!(step = step.display_name(), "running shell command");

        // The scheduler drops this future on cancellation or timeout; the
        // child must die with it instead of outliving the run.
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&ctx.workspace)
            .envs(&ctx.env)
            .envs(&step.env)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                EngineError::StepExecution(format!(
                    "failed to spawn '{}': {}",
                    step.display_name(),
                    e
                ))
            })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.stderr.is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
        }
        let masked = ctx.masker.mask(&combined);

        let exit_code = output.status.code();
        if output.status.success() {
            Ok(StepOutcome::success(masked))
        } else {
            Ok(StepOutcome::failure(
                format!(
                    "command exited with {}",
                    exit_code
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "signal".to_string())
                ),
                exit_code,
            )
            .with_output(masked))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactStore;
    use crate::cache::CacheStore;
    use crate::config::EngineConfig;
    use crate::executor::registry::Stores;
    use crate::secrets::{PermissionSet, SecretMasker};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::sync::Mutex;

    fn ctx(dir: &TempDir, masker: SecretMasker) -> StepContext {
        let config = EngineConfig {
            state_dir: dir.path().join("state"),
            ..Default::default()
        };
        StepContext {
            run_id: 1,
            workspace: dir.path().to_path_buf(),
            env: BTreeMap::from([("CI_EVENT".to_string(), "push".to_string())]),
            permissions: PermissionSet::default(),
            masker,
            strict_hash: false,
            stores: Arc::new(Stores {
                cache: Mutex::new(CacheStore::open(&config).unwrap()),
                artifacts: Mutex::new(ArtifactStore::open(&config).unwrap()),
            }),
        }
    }

    fn step(yaml: &str) -> Step {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[tokio::test]
    async fn test_captures_output_and_exit_code() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir, SecretMasker::default());

        let outcome = ShellAction
            .execute(&step("run: echo hello"), &ctx)
            .await
            .unwrap();
        assert!(outcome.succeeded);
        assert_eq!(outcome.output.trim(), "hello");

        let outcome = ShellAction
            .execute(&step("run: exit 3"), &ctx)
            .await
            .unwrap();
        assert!(!outcome.succeeded);
        assert_eq!(outcome.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_env_injection() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir, SecretMasker::default());

        let outcome = ShellAction
            .execute(
                &step("run: echo \"$CI_EVENT/$EXTRA\"\nenv:\n  EXTRA: xyz"),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(outcome.output.trim(), "push/xyz");
    }

    #[tokio::test]
    async fn test_secret_masking_in_output() {
        let dir = TempDir::new().unwrap();
        let masker = SecretMasker::new(vec!["s3cr3t".to_string()]);
        let mut ctx = ctx(&dir, masker);
        ctx.env
            .insert("API_TOKEN".to_string(), "s3cr3t".to_string());

        let outcome = ShellAction
            .execute(&step("run: echo \"token=$API_TOKEN\""), &ctx)
            .await
            .unwrap();
        assert_eq!(outcome.output.trim(), "token=***");
    }

    #[tokio::test]
    async fn test_stderr_is_captured() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir, SecretMasker::default());

        let outcome = ShellAction
            .execute(&step("run: echo oops >&2; exit 1"), &ctx)
            .await
            .unwrap();
        assert!(!outcome.succeeded);
        assert!(outcome.output.contains("oops"));
    }
}
