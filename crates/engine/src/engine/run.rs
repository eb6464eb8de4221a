//! Run and job-instance state.
//!
//! A [`Run`] is one execution of a workflow definition. Each job expands
//! into one [`JobInstance`] per matrix point; instances move through the
//! lifecycle Pending -> Ready -> Running -> terminal. Every record is
//! serializable so the run store can persist it on each transition.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::condition::NeedOutcome;
use crate::engine::matrix::MatrixPoint;

/// Lifecycle of a single job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Waiting on dependencies.
    Pending,
    /// Dependencies terminal; gates and dispatch happen next.
    Ready,
    Running,
    Succeeded,
    Failed,
    /// Condition evaluated false, or dependencies did not satisfy it.
    Skipped,
    Cancelled,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Succeeded
                | InstanceStatus::Failed
                | InstanceStatus::Skipped
                | InstanceStatus::Cancelled
        )
    }

    pub fn as_need_outcome(&self) -> Option<NeedOutcome> {
        match self {
            InstanceStatus::Succeeded => Some(NeedOutcome::Success),
            InstanceStatus::Failed => Some(NeedOutcome::Failure),
            InstanceStatus::Skipped => Some(NeedOutcome::Skipped),
            InstanceStatus::Cancelled => Some(NeedOutcome::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Ready => "ready",
            InstanceStatus::Running => "running",
            InstanceStatus::Succeeded => "succeeded",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Skipped => "skipped",
            InstanceStatus::Cancelled => "cancelled",
        }
    }
}

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

/// One step's recorded result inside an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Captured output with secret values masked.
    #[serde(default)]
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One job x matrix-point execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInstance {
    /// Stable key: job id plus matrix suffix, e.g. `test (linux, 1.75)`.
    pub key: String,
    pub job_id: String,
    pub matrix: MatrixPoint,
    pub status: InstanceStatus,
    /// Human-readable explanation for Skipped/Failed/Cancelled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    /// Run id of the child run when this instance calls a reusable workflow.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_run: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobInstance {
    pub fn new(job_id: &str, matrix: MatrixPoint) -> Self {
        let key = format!("{}{}", job_id, matrix.suffix());
        JobInstance {
            key,
            job_id: job_id.to_string(),
            matrix,
            status: InstanceStatus::Pending,
            reason: None,
            steps: Vec::new(),
            child_run: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = InstanceStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn finish(&mut self, status: InstanceStatus, reason: Option<String>) {
        self.status = status;
        self.reason = reason;
        self.finished_at = Some(Utc::now());
    }
}

/// Event context the run was triggered with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerContext {
    pub event: String,
    #[serde(rename = "ref")]
    pub ref_name: String,
    pub sha: String,
    pub actor: String,
    /// Inputs passed by a parent run when this is a reusable sub-run.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, String>,
}

/// Persistent record of one workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: u64,
    pub workflow: String,
    pub status: RunStatus,
    /// First failure, as `instance key: reason`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub trigger: TriggerContext,
    /// Run id of the parent, when spawned by a `uses:` job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_run: Option<u64>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Instances keyed by instance key, insertion order preserved is not
    /// required; BTreeMap keeps status output deterministic.
    pub instances: BTreeMap<String, JobInstance>,
}

impl Run {
    pub fn new(id: u64, workflow: &str, trigger: TriggerContext, parent_run: Option<u64>) -> Self {
        Run {
            id,
            workflow: workflow.to_string(),
            status: RunStatus::Running,
            reason: None,
            trigger,
            parent_run,
            started_at: Utc::now(),
            finished_at: None,
            instances: BTreeMap::new(),
        }
    }

    /// Terminal statuses of all instances belonging to one job id.
    pub fn job_outcome(&self, job_id: &str) -> Option<NeedOutcome> {
        let mut saw_any = false;
        let mut worst = NeedOutcome::Success;
        for instance in self.instances.values().filter(|i| i.job_id == job_id) {
            saw_any = true;
            match instance.status.as_need_outcome()? {
                NeedOutcome::Success => {}
                NeedOutcome::Skipped => {
                    if worst == NeedOutcome::Success {
                        worst = NeedOutcome::Skipped;
                    }
                }
                outcome => return Some(outcome),
            }
        }
        if saw_any {
            Some(worst)
        } else {
            None
        }
    }

    /// Fold instance statuses into the run-level conclusion. Cancelled
    /// dominates Failed; the earliest failure's reason is kept either way.
    pub fn conclude(&mut self) {
        let mut status = RunStatus::Succeeded;
        let mut first_failure: Option<(DateTime<Utc>, String)> = None;
        for instance in self.instances.values() {
            match instance.status {
                InstanceStatus::Failed => {
                    if status != RunStatus::Cancelled {
                        status = RunStatus::Failed;
                    }
                    let at = instance.finished_at.unwrap_or(self.started_at);
                    if first_failure.as_ref().map_or(true, |(t, _)| at < *t) {
                        let why = instance.reason.as_deref().unwrap_or("failed");
                        first_failure = Some((at, format!("{}: {}", instance.key, why)));
                    }
                }
                InstanceStatus::Cancelled => status = RunStatus::Cancelled,
                _ => {}
            }
        }
        self.status = status;
        self.reason = first_failure.map(|(_, why)| why);
        self.finished_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_lifecycle() {
        let mut instance = JobInstance::new("build", MatrixPoint::default());
        assert_eq!(instance.key, "build");
        assert_eq!(instance.status, InstanceStatus::Pending);
        assert!(!instance.status.is_terminal());

        instance.status = InstanceStatus::Ready;
        assert!(!instance.status.is_terminal());
        assert_eq!(instance.status.as_need_outcome(), None);

        instance.mark_running();
        assert!(instance.started_at.is_some());

        instance.finish(InstanceStatus::Succeeded, None);
        assert!(instance.status.is_terminal());
        assert!(instance.finished_at.is_some());
    }

    #[test]
    fn test_job_outcome_worst_wins() {
        let trigger = TriggerContext::default();
        let mut run = Run::new(1, "ci", trigger, None);

        let mut a = JobInstance::new("test", MatrixPoint::default());
        a.key = "test (linux)".to_string();
        a.finish(InstanceStatus::Succeeded, None);
        let mut b = JobInstance::new("test", MatrixPoint::default());
        b.key = "test (macos)".to_string();
        b.finish(InstanceStatus::Failed, Some("step failed".to_string()));
        run.instances.insert(a.key.clone(), a);
        run.instances.insert(b.key.clone(), b);

        assert_eq!(run.job_outcome("test"), Some(NeedOutcome::Failure));
        assert_eq!(run.job_outcome("missing"), None);
    }

    #[test]
    fn test_job_outcome_pending_is_none() {
        let mut run = Run::new(1, "ci", TriggerContext::default(), None);
        let instance = JobInstance::new("build", MatrixPoint::default());
        run.instances.insert(instance.key.clone(), instance);
        assert_eq!(run.job_outcome("build"), None);
    }

    #[test]
    fn test_conclude() {
        let mut run = Run::new(7, "ci", TriggerContext::default(), None);
        let mut ok = JobInstance::new("build", MatrixPoint::default());
        ok.finish(InstanceStatus::Succeeded, None);
        run.instances.insert(ok.key.clone(), ok);
        run.conclude();
        assert_eq!(run.status, RunStatus::Succeeded);

        let mut bad = JobInstance::new("test", MatrixPoint::default());
        bad.finish(InstanceStatus::Failed, Some("step 'unit' failed".to_string()));
        run.instances.insert(bad.key.clone(), bad);
        run.conclude();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.reason.as_deref(), Some("test: step 'unit' failed"));
    }

    #[test]
    fn test_conclude_keeps_earliest_failure_reason() {
        let mut run = Run::new(8, "ci", TriggerContext::default(), None);
        let mut late = JobInstance::new("deploy", MatrixPoint::default());
        late.finish(InstanceStatus::Failed, Some("later".to_string()));
        let mut early = JobInstance::new("build", MatrixPoint::default());
        early.finish(InstanceStatus::Failed, Some("first".to_string()));
        early.finished_at = Some(late.finished_at.unwrap() - chrono::Duration::seconds(5));
        run.instances.insert(late.key.clone(), late);
        run.instances.insert(early.key.clone(), early);

        run.conclude();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.reason.as_deref(), Some("build: first"));
    }

    #[test]
    fn test_conclude_cancelled_dominates_failed() {
        let mut run = Run::new(9, "ci", TriggerContext::default(), None);
        let mut bad = JobInstance::new("build", MatrixPoint::default());
        bad.finish(InstanceStatus::Failed, Some("step 'unit' failed".to_string()));
        let mut stopped = JobInstance::new("test", MatrixPoint::default());
        stopped.finish(InstanceStatus::Cancelled, Some("run cancelled".to_string()));
        run.instances.insert(bad.key.clone(), bad);
        run.instances.insert(stopped.key.clone(), stopped);

        run.conclude();
        assert_eq!(run.status, RunStatus::Cancelled);
        // The failure is still surfaced even when cancellation wins.
        assert_eq!(run.reason.as_deref(), Some("build: step 'unit' failed"));
    }

    #[test]
    fn test_run_serializes_round_trip() {
        let run = Run::new(3, "deploy", TriggerContext::default(), Some(2));
        let json = serde_json::to_string(&run).unwrap();
        let back: Run = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, 3);
        assert_eq!(back.parent_run, Some(2));
        assert_eq!(back.status, RunStatus::Running);
    }
}
