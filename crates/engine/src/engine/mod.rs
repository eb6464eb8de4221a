//! Run orchestration: dependency graph, matrix expansion, conditions,
//! run state, and the scheduler itself.

pub mod condition;
pub mod graph;
pub mod matrix;
pub mod run;
pub mod scheduler;

pub use run::{InstanceStatus, JobInstance, Run, RunStatus, TriggerContext};
pub use scheduler::{Scheduler, WORKFLOW_CALL_EVENT};
