//! Conveyor command line tool.
//!
//! `conveyor run` executes a workflow file to completion, `conveyor
//! status` prints a persisted run, and `conveyor validate` checks a
//! definition without running anything.
//!
//! Exit codes: 0 on success, 1 when the run failed or was cancelled,
//! 2 on definition or configuration errors.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use conveyor_engine::config::EngineConfig;
use conveyor_engine::definition::parser::parse_definition_file;
use conveyor_engine::engine::run::{Run, RunStatus, TriggerContext};
use conveyor_engine::engine::Scheduler;
use conveyor_engine::secrets::SecretVault;
use conveyor_engine::store::RunStore;
use conveyor_engine::EngineError;

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(version, about = "Conveyor workflow engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file to completion
    ///
    /// Examples:
    ///     conveyor run ci.yml
    ///     conveyor run ci.yml --event pull_request --git-ref feature/x
    ///     conveyor run deploy.yml --secret DEPLOY_TOKEN=abc --max-parallel 2
    #[command(verbatim_doc_comment)]
    Run {
        /// Workflow definition file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Trigger event name
        #[arg(long, default_value = "push")]
        event: String,

        /// Git ref the run is for
        #[arg(long = "git-ref", default_value = "main")]
        git_ref: String,

        /// Commit SHA
        #[arg(long, default_value = "")]
        sha: String,

        /// Actor that triggered the run
        #[arg(long, default_value = "local")]
        actor: String,

        /// Secret as NAME=VALUE; repeatable
        #[arg(long = "secret", value_name = "NAME=VALUE")]
        secrets: Vec<String>,

        /// Override the concurrency limit
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Override the state directory
        #[arg(long)]
        state_dir: Option<PathBuf>,

        /// Workspace directory (defaults to the workflow file's directory)
        #[arg(long)]
        workspace: Option<PathBuf>,

        /// Print the final run record as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show a persisted run
    Status {
        /// Run id
        #[arg(value_name = "RUN_ID")]
        run_id: u64,

        /// Override the state directory
        #[arg(long)]
        state_dir: Option<PathBuf>,

        /// Print the run record as JSON
        #[arg(long)]
        json: bool,
    },

    /// Parse and validate a workflow file without running it
    Validate {
        /// Workflow definition file
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

/// Initialize tracing/logging.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,conveyor=info,conveyor_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn parse_secret_args(args: &[String]) -> Result<BTreeMap<String, String>> {
    let mut secrets = BTreeMap::new();
    for arg in args {
        let (name, value) = arg
            .split_once('=')
            .with_context(|| format!("--secret '{}' is not NAME=VALUE", arg))?;
        secrets.insert(name.to_string(), value.to_string());
    }
    Ok(secrets)
}

fn load_config(state_dir: Option<PathBuf>, max_parallel: Option<usize>) -> Result<EngineConfig> {
    let mut config = EngineConfig::from_env().context("loading configuration")?;
    if let Some(dir) = state_dir {
        config.state_dir = dir;
    }
    if let Some(limit) = max_parallel {
        config.max_parallel = limit;
    }
    Ok(config)
}

fn print_run(run: &Run, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(run)?);
        return Ok(());
    }

    println!(
        "run {} [{}] workflow '{}' event '{}'",
        run.id,
        run.status.as_str(),
        run.workflow,
        run.trigger.event
    );
    if let Some(reason) = &run.reason {
        println!("  first failure: {}", reason);
    }
    for instance in run.instances.values() {
        let reason = instance
            .reason
            .as_deref()
            .map(|r| format!(" ({})", r))
            .unwrap_or_default();
        println!("  {:<40} {}{}", instance.key, instance.status.as_str(), reason);
        for step in &instance.steps {
            let mark = if step.succeeded { "ok" } else { "failed" };
            println!("    - {:<36} {}", step.name, mark);
        }
    }
    Ok(())
}

async fn cmd_run(
    file: PathBuf,
    trigger: TriggerContext,
    secrets: BTreeMap<String, String>,
    config: EngineConfig,
    workspace: Option<PathBuf>,
    json: bool,
) -> Result<ExitCode> {
    let definition = parse_definition_file(&file)?;
    let workspace = match workspace {
        Some(dir) => dir,
        None => file
            .canonicalize()
            .with_context(|| format!("resolving {}", file.display()))?
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".")),
    };

    let scheduler = Scheduler::new(config, SecretVault::new(secrets), workspace)?;

    // First Ctrl-C cancels cooperatively; a second one aborts the process.
    tokio::spawn({
        let scheduler = scheduler.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, cancelling run");
                scheduler.cancel();
            }
            if tokio::signal::ctrl_c().await.is_ok() {
                error!("second interrupt, aborting");
                std::process::exit(130);
            }
        }
    });

    let run = scheduler.run_workflow(&definition, trigger).await?;
    print_run(&run, json)?;

    Ok(match run.status {
        RunStatus::Succeeded => ExitCode::SUCCESS,
        _ => ExitCode::from(1),
    })
}

fn cmd_status(run_id: u64, config: EngineConfig, json: bool) -> Result<ExitCode> {
    let store = RunStore::open(&config)?;
    let run = store.load(run_id)?;
    print_run(&run, json)?;
    Ok(ExitCode::SUCCESS)
}

fn cmd_validate(file: PathBuf) -> Result<ExitCode> {
    let definition = parse_definition_file(&file)?;
    println!(
        "'{}' is valid: {} job(s)",
        definition.name,
        definition.jobs.len()
    );
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run {
            file,
            event,
            git_ref,
            sha,
            actor,
            secrets,
            max_parallel,
            state_dir,
            workspace,
            json,
        } => {
            let trigger = TriggerContext {
                event,
                ref_name: git_ref,
                sha,
                actor,
                inputs: BTreeMap::new(),
            };
            match parse_secret_args(&secrets)
                .and_then(|secrets| Ok((secrets, load_config(state_dir, max_parallel)?)))
            {
                Ok((secrets, config)) => {
                    cmd_run(file, trigger, secrets, config, workspace, json).await
                }
                Err(e) => Err(e),
            }
        }
        Commands::Status {
            run_id,
            state_dir,
            json,
        } => load_config(state_dir, None).and_then(|config| cmd_status(run_id, config, json)),
        Commands::Validate { file } => cmd_validate(file),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            let structural = e
                .downcast_ref::<EngineError>()
                .map(EngineError::is_structural)
                .unwrap_or(true);
            ExitCode::from(if structural { 2 } else { 1 })
        }
    }
}
