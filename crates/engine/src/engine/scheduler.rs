//! Run scheduling and execution.
//!
//! The scheduler drives one run to completion: it expands jobs into
//! instances, promotes instances whose dependencies are terminal, gates
//! them on environment approval and their condition, and dispatches work
//! onto a [`JoinSet`] bounded by a semaphore. The run record is persisted
//! on every transition.
//!
//! Reusable workflows (`uses:` at job level) recurse: the calling
//! instance spawns a child run that shares the scheduler's semaphore,
//! stores, and cancellation channel, with a vault restricted to the
//! secrets the caller forwards.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::artifact::ArtifactStore;
use crate::cache::CacheStore;
use crate::config::EngineConfig;
use crate::definition::parser::parse_definition_file;
use crate::definition::types::{scalar_to_string, Job, Step, WorkflowDefinition};
use crate::engine::condition::{self, RunContext};
use crate::engine::graph;
use crate::engine::matrix;
use crate::engine::run::{InstanceStatus, JobInstance, Run, RunStatus, StepRecord, TriggerContext};
use crate::error::{EngineError, EngineResult};
use crate::executor::{ActionRegistry, StepContext, Stores};
use crate::secrets::{PermissionSet, SecretMasker, SecretVault};
use crate::store::RunStore;

/// Event name used when a run is spawned by a `uses:` job.
pub const WORKFLOW_CALL_EVENT: &str = "workflow_call";

/// Outcome handed back from an instance task.
#[derive(Debug)]
struct InstanceResult {
    status: InstanceStatus,
    reason: Option<String>,
    steps: Vec<StepRecord>,
    child_run: Option<u64>,
}

impl InstanceResult {
    fn failed(reason: impl Into<String>) -> Self {
        InstanceResult {
            status: InstanceStatus::Failed,
            reason: Some(reason.into()),
            steps: Vec::new(),
            child_run: None,
        }
    }

    fn cancelled(reason: impl Into<String>) -> Self {
        InstanceResult {
            status: InstanceStatus::Cancelled,
            reason: Some(reason.into()),
            steps: Vec::new(),
            child_run: None,
        }
    }
}

/// Drives workflow runs. Cheap to clone; clones share stores, the
/// concurrency budget, and the cancellation channel.
#[derive(Clone)]
pub struct Scheduler {
    config: Arc<EngineConfig>,
    registry: Arc<ActionRegistry>,
    stores: Arc<Stores>,
    runs: Arc<RunStore>,
    vault: Arc<SecretVault>,
    semaphore: Arc<Semaphore>,
    workspace: PathBuf,
    cancel: Arc<watch::Sender<bool>>,
    /// Definition files already executing in this call chain; a `uses:`
    /// target that repeats is a cycle and fails the calling instance.
    call_chain: Arc<Vec<PathBuf>>,
}

impl Scheduler {
    pub fn new(
        config: EngineConfig,
        vault: SecretVault,
        workspace: PathBuf,
    ) -> EngineResult<Self> {
        let stores = Arc::new(Stores {
            cache: Mutex::new(CacheStore::open(&config)?),
            artifacts: Mutex::new(ArtifactStore::open(&config)?),
        });
        let runs = Arc::new(RunStore::open(&config)?);
        let semaphore = Arc::new(Semaphore::new(config.max_parallel.max(1)));
        let (cancel, _) = watch::channel(false);

        Ok(Scheduler {
            config: Arc::new(config),
            registry: Arc::new(ActionRegistry::with_builtins()),
            stores,
            runs,
            vault: Arc::new(vault),
            semaphore,
            workspace,
            cancel: Arc::new(cancel),
            call_chain: Arc::new(Vec::new()),
        })
    }

    /// Request cooperative cancellation of every run sharing this
    /// scheduler. Pending instances become Cancelled; running instances
    /// stop at their next step boundary.
    pub fn cancel(&self) {
        info!("cancellation requested");
        let _ = self.cancel.send(true);
    }

    pub fn run_store(&self) -> &RunStore {
        &self.runs
    }

    /// Execute a workflow to completion and return the final run record.
    pub async fn run_workflow(
        &self,
        definition: &WorkflowDefinition,
        trigger: TriggerContext,
    ) -> EngineResult<Run> {
        self.execute(definition.clone(), trigger, None).await
    }

    fn run_boxed(
        &self,
        definition: WorkflowDefinition,
        trigger: TriggerContext,
        parent_run: Option<u64>,
    ) -> Pin<Box<dyn Future<Output = EngineResult<Run>> + Send + 'static>> {
        let scheduler = self.clone();
        Box::pin(async move { scheduler.execute(definition, trigger, parent_run).await })
    }

    async fn execute(
        &self,
        definition: WorkflowDefinition,
        trigger: TriggerContext,
        parent_run: Option<u64>,
    ) -> EngineResult<Run> {
        if !definition.triggered_by(&trigger.event) {
            return Err(EngineError::Definition(format!(
                "workflow '{}' is not triggered by '{}'",
                definition.name, trigger.event
            )));
        }
        let graph = graph::resolve(&definition)?;

        let run_id = self.runs.next_run_id()?;
        let mut run = Run::new(run_id, &definition.name, trigger.clone(), parent_run);
        info!(run_id, workflow = %definition.name, event = %trigger.event, "run started");

        for job_id in &graph.order {
            let job = &definition.jobs[job_id];
            let matrix_spec = job.strategy.as_ref().and_then(|s| s.matrix.as_ref());
            for point in matrix::expand(matrix_spec) {
                let instance = JobInstance::new(job_id, point);
                run.instances.insert(instance.key.clone(), instance);
            }
        }
        self.runs.save(&run)?;

        let mut join_set: JoinSet<(String, InstanceResult)> = JoinSet::new();
        let mut task_keys: HashMap<tokio::task::Id, String> = HashMap::new();
        let mut cancel_rx = self.cancel.subscribe();

        loop {
            self.promote_and_dispatch(&definition, &mut run, &mut join_set, &mut task_keys)?;
            self.runs.save(&run)?;

            let all_terminal = run.instances.values().all(|i| i.status.is_terminal());
            if all_terminal && join_set.is_empty() {
                break;
            }
            if join_set.is_empty() {
                // Promotion reached a fixpoint with nothing running; a
                // resolved graph cannot get here.
                error!(run_id, "scheduler stalled with non-terminal instances");
                return Err(EngineError::StepExecution(
                    "scheduler stalled without runnable instances".to_string(),
                ));
            }

            tokio::select! {
                joined = join_set.join_next() => {
                    match joined {
                        Some(Ok((key, result))) => {
                            self.apply_result(&mut run, &key, result);
                        }
                        Some(Err(join_err)) => {
                            let key = task_keys
                                .get(&join_err.id())
                                .cloned()
                                .unwrap_or_default();
                            error!(run_id, key, error = %join_err, "instance task aborted");
                            if let Some(instance) = run.instances.get_mut(&key) {
                                instance.finish(
                                    InstanceStatus::Failed,
                                    Some(format!("task aborted: {}", join_err)),
                                );
                            }
                        }
                        None => {}
                    }
                }
                _ = cancel_rx.changed() => {
                    if *cancel_rx.borrow() {
                        self.cancel_waiting(&mut run);
                    }
                }
            }
            self.runs.save(&run)?;
        }

        run.conclude();
        self.runs.save(&run)?;
        info!(run_id, status = run.status.as_str(), "run finished");
        Ok(run)
    }

    /// Promote Pending instances whose dependencies are terminal, then
    /// either finish them in place (gate failed, condition false) or
    /// spawn their task. Repeats until no instance changes, since a
    /// skip can unblock an entire chain at once.
    fn promote_and_dispatch(
        &self,
        definition: &WorkflowDefinition,
        run: &mut Run,
        join_set: &mut JoinSet<(String, InstanceResult)>,
        task_keys: &mut HashMap<tokio::task::Id, String>,
    ) -> EngineResult<()> {
        let cancelled = *self.cancel.subscribe().borrow();
        loop {
            let mut progressed = false;

            let pending: Vec<String> = run
                .instances
                .values()
                .filter(|i| i.status == InstanceStatus::Pending)
                .map(|i| i.key.clone())
                .collect();

            for key in pending {
                let job_id = run.instances[&key].job_id.clone();
                let job = definition
                    .jobs
                    .get(&job_id)
                    .ok_or_else(|| EngineError::NotFound(format!("job '{}'", job_id)))?;

                let deps_terminal = job
                    .needs_ids()
                    .iter()
                    .all(|dep| run.job_outcome(dep).is_some());
                if !deps_terminal {
                    continue;
                }
                progressed = true;
                run.instances.get_mut(&key).unwrap().status = InstanceStatus::Ready;

                if cancelled {
                    run.instances
                        .get_mut(&key)
                        .unwrap()
                        .finish(InstanceStatus::Cancelled, Some("run cancelled".to_string()));
                    continue;
                }

                // Environment gate, fail closed.
                if let Some(env_name) = &job.environment {
                    if !self.config.environment_approved(env_name) {
                        warn!(key, environment = %env_name, "environment not approved");
                        run.instances.get_mut(&key).unwrap().finish(
                            InstanceStatus::Failed,
                            Some(format!("environment '{}' is not approved", env_name)),
                        );
                        continue;
                    }
                }

                let ctx = self.instance_context(run, job, &key, cancelled);
                let expr = job.condition.as_deref().unwrap_or("success()");
                match condition::evaluate(expr, &ctx) {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(key, condition = expr, "instance skipped");
                        run.instances.get_mut(&key).unwrap().finish(
                            InstanceStatus::Skipped,
                            Some(format!("condition '{}' was false", expr)),
                        );
                        continue;
                    }
                    Err(e) => {
                        run.instances.get_mut(&key).unwrap().finish(
                            InstanceStatus::Failed,
                            Some(format!("condition error: {}", e)),
                        );
                        continue;
                    }
                }

                // Secrets resolve before anything runs.
                let secrets = match self.vault.resolve(job) {
                    Ok(secrets) => secrets,
                    Err(e) => {
                        run.instances
                            .get_mut(&key)
                            .unwrap()
                            .finish(InstanceStatus::Failed, Some(e.to_string()));
                        continue;
                    }
                };

                let trigger = run.trigger.clone();
                let instance = run.instances.get_mut(&key).unwrap();
                instance.mark_running();
                info!(key, job = %job.display_name(), "instance dispatched");

                let handle = if job.is_reusable_call() {
                    self.spawn_sub_run(join_set, run.id, &key, job)
                } else {
                    self.spawn_steps(join_set, definition, run.id, &key, job, &trigger, ctx, secrets)
                };
                task_keys.insert(handle, key);
            }

            if !progressed {
                return Ok(());
            }
        }
    }

    fn apply_result(&self, run: &mut Run, key: &str, result: InstanceResult) {
        info!(
            key,
            status = result.status.as_str(),
            reason = result.reason.as_deref().unwrap_or(""),
            "instance finished"
        );
        if let Some(instance) = run.instances.get_mut(key) {
            instance.steps = result.steps;
            instance.child_run = result.child_run;
            instance.finish(result.status, result.reason);
        }
    }

    fn cancel_waiting(&self, run: &mut Run) {
        for instance in run.instances.values_mut() {
            if matches!(
                instance.status,
                InstanceStatus::Pending | InstanceStatus::Ready
            ) {
                instance.finish(InstanceStatus::Cancelled, Some("run cancelled".to_string()));
            }
        }
    }

    fn instance_context(
        &self,
        run: &Run,
        job: &Job,
        key: &str,
        cancelled: bool,
    ) -> RunContext {
        let mut needs = BTreeMap::new();
        for dep in job.needs_ids() {
            if let Some(outcome) = run.job_outcome(dep) {
                needs.insert(dep.to_string(), outcome);
            }
        }
        RunContext {
            event: run.trigger.event.clone(),
            ref_name: run.trigger.ref_name.clone(),
            sha: run.trigger.sha.clone(),
            actor: run.trigger.actor.clone(),
            run_cancelled: cancelled,
            needs,
            matrix: run.instances[key].matrix.as_strings(),
            skipped_satisfies: !self.config.needs_success_only,
        }
    }

    /// Spawn a steps job. The permit is taken inside the task so
    /// dispatch never blocks the scheduling loop.
    #[allow(clippy::too_many_arguments)]
    fn spawn_steps(
        &self,
        join_set: &mut JoinSet<(String, InstanceResult)>,
        definition: &WorkflowDefinition,
        run_id: u64,
        key: &str,
        job: &Job,
        trigger: &TriggerContext,
        gate_ctx: RunContext,
        secrets: BTreeMap<String, String>,
    ) -> tokio::task::Id {
        let key = key.to_string();
        let job = job.clone();
        let timeout_minutes = job
            .timeout_minutes
            .unwrap_or(self.config.default_timeout_minutes);
        let env = build_env(trigger, run_id, &job, &gate_ctx, &secrets);
        let ctx = StepContext {
            run_id,
            workspace: self.workspace.clone(),
            env,
            permissions: PermissionSet::for_job(definition, &job),
            masker: SecretMasker::new(secrets.values().cloned()),
            strict_hash: self.config.strict_hash,
            stores: Arc::clone(&self.stores),
        };
        let registry = Arc::clone(&self.registry);
        let semaphore = Arc::clone(&self.semaphore);
        let mut cancel_rx = self.cancel.subscribe();

        let handle = join_set.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return (key, InstanceResult::cancelled("scheduler shut down")),
            };

            let deadline = Duration::from_secs(timeout_minutes * 60);
            let result = tokio::select! {
                _ = wait_for_cancel(&mut cancel_rx) => {
                    InstanceResult::cancelled("run cancelled")
                }
                timed = tokio::time::timeout(deadline, run_steps(&job, &ctx, &gate_ctx, registry)) => {
                    match timed {
                        Ok(result) => result,
                        Err(_) => InstanceResult::failed(
                            EngineError::Timeout(timeout_minutes).to_string(),
                        ),
                    }
                }
            };
            (key, result)
        });
        handle.id()
    }

    /// Spawn a `uses:` job as a child run. No permit is taken here; the
    /// child's own instances contend for the shared budget, so a parent
    /// waiting on its child can never deadlock the pool.
    fn spawn_sub_run(
        &self,
        join_set: &mut JoinSet<(String, InstanceResult)>,
        run_id: u64,
        key: &str,
        job: &Job,
    ) -> tokio::task::Id {
        let key = key.to_string();
        let uses = job.uses.clone().unwrap_or_default();
        let inputs: BTreeMap<String, String> = job
            .with
            .iter()
            .flatten()
            .map(|(k, v)| (k.clone(), scalar_to_string(v)))
            .collect();

        let mut child = self.clone();
        child.vault = Arc::new(self.vault.subset(&job.secrets));

        let workspace = self.workspace.clone();
        let handle = join_set.spawn(async move {
            let path = workspace.join(&uses);
            let canonical = path.canonicalize().unwrap_or_else(|_| path.clone());
            if child.call_chain.contains(&canonical) {
                return (
                    key,
                    InstanceResult::failed(format!(
                        "recursive workflow call: '{}' is already running in this call chain",
                        uses
                    )),
                );
            }
            let mut chain = child.call_chain.as_ref().clone();
            chain.push(canonical);
            child.call_chain = Arc::new(chain);

            let child_def = match parse_definition_file(&path) {
                Ok(def) => def,
                Err(e) => return (key, InstanceResult::failed(e.to_string())),
            };

            let parent_trigger = child.runs.load(run_id).map(|r| r.trigger).unwrap_or_default();
            let trigger = TriggerContext {
                event: WORKFLOW_CALL_EVENT.to_string(),
                ref_name: parent_trigger.ref_name,
                sha: parent_trigger.sha,
                actor: parent_trigger.actor,
                inputs,
            };

            match child.run_boxed(child_def, trigger, Some(run_id)).await {
                Ok(child_run) => {
                    let status = match child_run.status {
                        RunStatus::Succeeded => InstanceStatus::Succeeded,
                        RunStatus::Cancelled => InstanceStatus::Cancelled,
                        _ => InstanceStatus::Failed,
                    };
                    let reason = (status != InstanceStatus::Succeeded)
                        .then(|| format!("child run {} {}", child_run.id, child_run.status.as_str()));
                    (
                        key,
                        InstanceResult {
                            status,
                            reason,
                            steps: Vec::new(),
                            child_run: Some(child_run.id),
                        },
                    )
                }
                Err(e) => (key, InstanceResult::failed(e.to_string())),
            }
        });
        handle.id()
    }
}

async fn wait_for_cancel(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Uppercase an axis or input name for an environment variable.
fn env_component(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn build_env(
    trigger: &TriggerContext,
    run_id: u64,
    job: &Job,
    ctx: &RunContext,
    secrets: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("CI_EVENT".to_string(), trigger.event.clone());
    env.insert("CI_REF".to_string(), trigger.ref_name.clone());
    env.insert("CI_SHA".to_string(), trigger.sha.clone());
    env.insert("CI_ACTOR".to_string(), trigger.actor.clone());
    env.insert("CI_RUN_ID".to_string(), run_id.to_string());
    env.insert("CI_JOB".to_string(), job.id.clone());

    for (axis, value) in &ctx.matrix {
        env.insert(format!("MATRIX_{}", env_component(axis)), value.clone());
    }
    for (name, value) in &trigger.inputs {
        env.insert(format!("CI_INPUT_{}", env_component(name)), value.clone());
    }
    for (name, value) in secrets {
        env.insert(name.clone(), value.clone());
    }
    env
}

/// Execute a job's steps in order. A failed step does not abort the
/// loop; later steps are gated on the synthetic `steps` outcome, so
/// `if: always()` and `if: failure()` cleanup steps still run.
async fn run_steps(
    job: &Job,
    ctx: &StepContext,
    base_ctx: &RunContext,
    registry: Arc<ActionRegistry>,
) -> InstanceResult {
    let mut records = Vec::new();
    let mut failed: Option<String> = None;

    for step in &job.steps {
        let gate = step_gate(step, failed.is_some(), base_ctx);
        match gate {
            Ok(true) => {}
            Ok(false) => {
                records.push(StepRecord {
                    name: step.display_name().to_string(),
                    succeeded: true,
                    exit_code: None,
                    output: String::new(),
                    error: Some("skipped".to_string()),
                });
                continue;
            }
            Err(e) => {
                records.push(StepRecord {
                    name: step.display_name().to_string(),
                    succeeded: false,
                    exit_code: None,
                    output: String::new(),
                    error: Some(e.to_string()),
                });
                failed.get_or_insert_with(|| step.display_name().to_string());
                continue;
            }
        }

        let outcome = match registry.resolve(step) {
            Ok(action) => action.execute(step, ctx).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(outcome) => {
                if !outcome.succeeded {
                    failed.get_or_insert_with(|| step.display_name().to_string());
                }
                records.push(StepRecord {
                    name: step.display_name().to_string(),
                    succeeded: outcome.succeeded,
                    exit_code: outcome.exit_code,
                    output: outcome.output,
                    error: outcome.error,
                });
            }
            Err(e) => {
                records.push(StepRecord {
                    name: step.display_name().to_string(),
                    succeeded: false,
                    exit_code: None,
                    output: String::new(),
                    error: Some(e.to_string()),
                });
                failed.get_or_insert_with(|| step.display_name().to_string());
            }
        }
    }

    match failed {
        Some(step_name) => InstanceResult {
            status: InstanceStatus::Failed,
            reason: Some(format!("step '{}' failed", step_name)),
            steps: records,
            child_run: None,
        },
        None => InstanceResult {
            status: InstanceStatus::Succeeded,
            reason: None,
            steps: records,
            child_run: None,
        },
    }
}

/// Evaluate a step's condition. The context inherits the instance's
/// event, ref, and matrix fields, but its single `steps` outcome reflects
/// whether an earlier step failed. The default `success()` therefore
/// skips steps after a failure, while `always()` and `failure()` behave
/// the usual way.
fn step_gate(step: &Step, previous_failed: bool, base: &RunContext) -> EngineResult<bool> {
    let mut ctx = base.clone();
    ctx.needs.clear();
    ctx.skipped_satisfies = true;
    ctx.needs.insert(
        "steps".to_string(),
        if previous_failed {
            condition::NeedOutcome::Failure
        } else {
            condition::NeedOutcome::Success
        },
    );
    let expr = step.condition.as_deref().unwrap_or("success()");
    condition::evaluate(expr, &ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::parser::parse_definition;
    use std::fs;
    use tempfile::TempDir;

    fn scheduler(dir: &TempDir, vault: SecretVault) -> Scheduler {
        let config = EngineConfig {
            state_dir: dir.path().join("state"),
            approved_environments: Some("staging".to_string()),
            ..Default::default()
        };
        let workspace = dir.path().join("ws");
        fs::create_dir_all(&workspace).unwrap();
        Scheduler::new(config, vault, workspace).unwrap()
    }

    fn push_trigger() -> TriggerContext {
        TriggerContext {
            event: "push".to_string(),
            ref_name: "main".to_string(),
            sha: "abc123".to_string(),
            actor: "tester".to_string(),
            inputs: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_pipeline_respects_dependency_order() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir, SecretVault::default());
        let def = parse_definition(
            r#"
name: ci
on: push
jobs:
  build:
    steps:
      - run: echo built > order.txt
  test:
    needs: build
    steps:
      - run: echo tested >> order.txt
"#,
        )
        .unwrap();

        let run = scheduler.run_workflow(&def, push_trigger()).await.unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.instances["build"].status, InstanceStatus::Succeeded);
        assert_eq!(run.instances["test"].status, InstanceStatus::Succeeded);

        let order = fs::read_to_string(dir.path().join("ws/order.txt")).unwrap();
        assert_eq!(order, "built\ntested\n");
    }

    #[tokio::test]
    async fn test_failed_dependency_skips_dependent() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir, SecretVault::default());
        let def = parse_definition(
            r#"
name: ci
on: push
jobs:
  build:
    steps:
      - run: exit 1
  test:
    needs: build
    steps:
      - run: echo never
  cleanup:
    needs: build
    if: always()
    steps:
      - run: echo cleanup
  lint:
    steps:
      - run: echo lint
"#,
        )
        .unwrap();

        let run = scheduler.run_workflow(&def, push_trigger()).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.instances["build"].status, InstanceStatus::Failed);
        assert_eq!(run.instances["test"].status, InstanceStatus::Skipped);
        assert_eq!(run.instances["cleanup"].status, InstanceStatus::Succeeded);
        // An independent branch is untouched by the failure.
        assert_eq!(run.instances["lint"].status, InstanceStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_matrix_fanout_with_env() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir, SecretVault::default());
        let def = parse_definition(
            r#"
name: matrix
on: push
jobs:
  test:
    strategy:
      matrix:
        os: [linux, macos]
    steps:
      - run: echo "$MATRIX_OS" >> "seen-$MATRIX_OS"
"#,
        )
        .unwrap();

        let run = scheduler.run_workflow(&def, push_trigger()).await.unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.instances.len(), 2);
        assert!(run.instances.contains_key("test (linux)"));
        assert!(run.instances.contains_key("test (macos)"));
        assert_eq!(
            fs::read_to_string(dir.path().join("ws/seen-linux"))
                .unwrap()
                .trim(),
            "linux"
        );
    }

    #[tokio::test]
    async fn test_condition_on_event() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir, SecretVault::default());
        let def = parse_definition(
            r#"
name: gated
on: [push, pull_request]
jobs:
  deploy:
    if: event == 'push' && ref == 'release'
    steps:
      - run: echo deploy
"#,
        )
        .unwrap();

        let run = scheduler.run_workflow(&def, push_trigger()).await.unwrap();
        assert_eq!(run.instances["deploy"].status, InstanceStatus::Skipped);
        // A skipped-only run still succeeds.
        assert_eq!(run.status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_malformed_condition_fails_only_owning_job() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir, SecretVault::default());
        let def = parse_definition(
            r#"
name: badif
on: push
jobs:
  broken:
    if: "event == "
    steps:
      - run: echo never
  sibling:
    steps:
      - run: echo fine
"#,
        )
        .unwrap();

        let run = scheduler.run_workflow(&def, push_trigger()).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        let broken = &run.instances["broken"];
        assert_eq!(broken.status, InstanceStatus::Failed);
        assert!(broken.reason.as_deref().unwrap().contains("condition error"));
        assert!(broken.steps.is_empty());
        // The sibling is unaffected by the malformed expression.
        assert_eq!(run.instances["sibling"].status, InstanceStatus::Succeeded);
        assert!(run.reason.as_deref().unwrap().starts_with("broken:"));
    }

    #[tokio::test]
    async fn test_environment_gate_fails_closed() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir, SecretVault::default());
        let def = parse_definition(
            r#"
name: deploys
on: push
jobs:
  stage:
    environment: staging
    steps:
      - run: echo ok
  prod:
    environment: production
    steps:
      - run: echo no
  verify:
    needs: prod
    steps:
      - run: echo never
"#,
        )
        .unwrap();

        let run = scheduler.run_workflow(&def, push_trigger()).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.instances["stage"].status, InstanceStatus::Succeeded);
        assert_eq!(run.instances["prod"].status, InstanceStatus::Failed);
        assert!(run.instances["prod"]
            .reason
            .as_deref()
            .unwrap()
            .contains("not approved"));
        assert_eq!(run.instances["verify"].status, InstanceStatus::Skipped);
    }

    #[tokio::test]
    async fn test_missing_secret_fails_before_steps() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir, SecretVault::default());
        let def = parse_definition(
            r#"
name: secretive
on: push
jobs:
  deploy:
    secrets: [DEPLOY_TOKEN]
    steps:
      - run: echo "$DEPLOY_TOKEN" > leaked
"#,
        )
        .unwrap();

        let run = scheduler.run_workflow(&def, push_trigger()).await.unwrap();
        assert_eq!(run.instances["deploy"].status, InstanceStatus::Failed);
        assert!(run.instances["deploy"].steps.is_empty());
        assert!(!dir.path().join("ws/leaked").exists());
    }

    #[tokio::test]
    async fn test_secret_injected_and_masked() {
        let dir = TempDir::new().unwrap();
        let mut vault = SecretVault::default();
        vault.insert("DEPLOY_TOKEN", "tok-s3cr3t");
        let scheduler = scheduler(&dir, vault);
        let def = parse_definition(
            r#"
name: secretive
on: push
jobs:
  deploy:
    secrets: [DEPLOY_TOKEN]
    steps:
      - run: echo "token is $DEPLOY_TOKEN"
"#,
        )
        .unwrap();

        let run = scheduler.run_workflow(&def, push_trigger()).await.unwrap();
        let instance = &run.instances["deploy"];
        assert_eq!(instance.status, InstanceStatus::Succeeded);
        assert_eq!(instance.steps[0].output.trim(), "token is ***");
    }

    #[tokio::test]
    async fn test_step_failure_gates_later_steps() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir, SecretVault::default());
        let def = parse_definition(
            r#"
name: steps
on: push
jobs:
  build:
    steps:
      - name: compile
        run: exit 2
      - name: package
        run: echo packaged
      - name: report
        if: always()
        run: echo reported
"#,
        )
        .unwrap();

        let run = scheduler.run_workflow(&def, push_trigger()).await.unwrap();
        let instance = &run.instances["build"];
        assert_eq!(instance.status, InstanceStatus::Failed);
        assert_eq!(instance.reason.as_deref(), Some("step 'compile' failed"));
        assert_eq!(instance.steps.len(), 3);
        assert!(!instance.steps[0].succeeded);
        assert_eq!(instance.steps[1].error.as_deref(), Some("skipped"));
        assert!(instance.steps[2].succeeded);
        assert_eq!(instance.steps[2].output.trim(), "reported");
    }

    #[tokio::test]
    async fn test_reusable_workflow_call() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir, SecretVault::default());
        fs::write(
            dir.path().join("ws/child.yml"),
            r#"
name: child
on: workflow_call
jobs:
  greet:
    steps:
      - run: echo "hello $CI_INPUT_TARGET" > greeting.txt
"#,
        )
        .unwrap();
        let def = parse_definition(
            r#"
name: parent
on: push
jobs:
  call:
    uses: child.yml
    with:
      target: world
"#,
        )
        .unwrap();

        let run = scheduler.run_workflow(&def, push_trigger()).await.unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        let instance = &run.instances["call"];
        assert_eq!(instance.status, InstanceStatus::Succeeded);

        let child_id = instance.child_run.expect("child run id");
        let child = scheduler.run_store().load(child_id).unwrap();
        assert_eq!(child.parent_run, Some(run.id));
        assert_eq!(child.trigger.event, WORKFLOW_CALL_EVENT);
        assert_eq!(
            fs::read_to_string(dir.path().join("ws/greeting.txt"))
                .unwrap()
                .trim(),
            "hello world"
        );
    }

    #[tokio::test]
    async fn test_cancellation_stops_waiting_work() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir, SecretVault::default());
        let def = parse_definition(
            r#"
name: slow
on: push
jobs:
  sleepy:
    steps:
      - run: sleep 30
  after:
    needs: sleepy
    steps:
      - run: echo never
  quick:
    steps:
      - run: echo done
"#,
        )
        .unwrap();

        let handle = tokio::spawn({
            let scheduler = scheduler.clone();
            let def = def.clone();
            async move { scheduler.run_workflow(&def, push_trigger()).await }
        });
        tokio::time::sleep(Duration::from_millis(300)).await;
        scheduler.cancel();

        let run = handle.await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.instances["sleepy"].status, InstanceStatus::Cancelled);
        assert_eq!(run.instances["after"].status, InstanceStatus::Cancelled);
        // Work finished before the cancel keeps its result.
        assert_eq!(run.instances["quick"].status, InstanceStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_cancellation_kills_running_shell() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir, SecretVault::default());
        let def = parse_definition(
            r#"
name: hang
on: push
jobs:
  hang:
    steps:
      - run: echo $$ > pid.txt; exec sleep 600
"#,
        )
        .unwrap();

        let handle = tokio::spawn({
            let scheduler = scheduler.clone();
            let def = def.clone();
            async move { scheduler.run_workflow(&def, push_trigger()).await }
        });

        let pid_file = dir.path().join("ws/pid.txt");
        let mut pid = None;
        for _ in 0..100 {
            if let Ok(contents) = fs::read_to_string(&pid_file) {
                if let Ok(parsed) = contents.trim().parse::<u32>() {
                    pid = Some(parsed);
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let pid = pid.expect("step never started");

        scheduler.cancel();
        let run = handle.await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);

        // The kill lands when the step future is dropped; poll until the
        // process is reaped (or left as a zombie awaiting reaping).
        let stat = PathBuf::from(format!("/proc/{}/stat", pid));
        let mut reclaimed = false;
        for _ in 0..100 {
            match fs::read_to_string(&stat) {
                Err(_) => {
                    reclaimed = true;
                    break;
                }
                Ok(contents) if contents.contains(") Z ") => {
                    reclaimed = true;
                    break;
                }
                Ok(_) => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }
        assert!(reclaimed, "shell process {} outlived the cancelled run", pid);
    }

    #[tokio::test]
    async fn test_recursive_workflow_call_is_rejected() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir, SecretVault::default());
        let looper = r#"
name: looper
on: [push, workflow_call]
jobs:
  again:
    uses: loop.yml
"#;
        fs::write(dir.path().join("ws/loop.yml"), looper).unwrap();
        let def = parse_definition(looper).unwrap();

        let run = scheduler.run_workflow(&def, push_trigger()).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);

        // The top-level call spawns one child run; the child's own call
        // sees loop.yml already on the chain and fails instead of recursing.
        let child_id = run.instances["again"].child_run.expect("child run id");
        let child = scheduler.run_store().load(child_id).unwrap();
        assert_eq!(child.status, RunStatus::Failed);
        assert!(child.instances["again"]
            .reason
            .as_deref()
            .unwrap()
            .contains("recursive workflow call"));
    }

    #[tokio::test]
    async fn test_event_not_in_triggers_is_rejected() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir, SecretVault::default());
        let def = parse_definition(
            r#"
name: tagged
on: tag
jobs:
  release:
    steps:
      - run: echo release
"#,
        )
        .unwrap();

        let err = scheduler
            .run_workflow(&def, push_trigger())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Definition(_)));
    }
}
