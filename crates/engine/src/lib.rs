//! Conveyor Engine Library
//!
//! This crate is the execution core of Conveyor, a minimal self-hosted
//! workflow orchestration engine:
//!
//! - **Workflow Definitions**: Parse and validate declarative YAML
//!   workflows (triggers, permissions, jobs, steps)
//! - **Dependency Resolution**: Build the job DAG from `needs` edges and
//!   reject cycles before anything runs
//! - **Matrix Expansion**: Fan jobs out over declared axes with
//!   include/exclude refinement
//! - **Scheduling**: Run job instances concurrently under a global
//!   parallelism budget, with condition gating, timeouts, cancellation,
//!   and reusable sub-workflows
//! - **Caching & Artifacts**: Content-hash cache keys with restore-key
//!   fallback, and a versioned per-run artifact store
//! - **Secrets & Permissions**: Fail-closed secret injection, output
//!   masking, and scoped read/write permission gates
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading from environment variables
//! - [`definition`]: Workflow definition model and parser
//! - [`engine`]: Graph resolution, matrix expansion, and the scheduler
//! - [`executor`]: Step actions (shell, cache, artifacts)
//! - [`cache`] / [`artifact`]: Local storage backends
//! - [`secrets`]: Secret vault, masking, permission sets
//! - [`store`]: Run persistence
//! - [`error`]: Engine error types
//!
//! ## Example
//!
//! ```ignore
//! use conveyor_engine::{
//!     config::EngineConfig,
//!     definition::parser::parse_definition_file,
//!     engine::{Scheduler, TriggerContext},
//!     secrets::SecretVault,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = EngineConfig::from_env()?;
//!     let definition = parse_definition_file("ci.yml".as_ref())?;
//!     let scheduler = Scheduler::new(config, SecretVault::default(), ".".into())?;
//!     let run = scheduler.run_workflow(&definition, TriggerContext {
//!         event: "push".to_string(),
//!         ..Default::default()
//!     }).await?;
//!     println!("run {} finished: {}", run.id, run.status.as_str());
//!     Ok(())
//! }
//! ```

pub mod artifact;
pub mod cache;
pub mod config;
pub mod definition;
pub mod engine;
pub mod error;
pub mod executor;
pub mod secrets;
pub mod store;

pub use error::{EngineError, EngineResult};
