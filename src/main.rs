//! Armitage CLI entry point.
//!
//! Subcommands: `init`, `ingest`, `run`, `status`, `circuits`, `retry`.
//! Exit codes: 0 success, 1 operational error, 2 configuration error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use armitage::admin::Admin;
use armitage::config::Config;
use armitage::stage::collaborators::{
    ExportChecker, HttpLlm, LlmClient, NoopLlm, ProcessVerifier, TieredPromptBuilder,
};
use armitage::stage::StageExecutor;
use armitage::store::Store;
use armitage::types::{CircuitLevel, TaskSpec};
use armitage::worker::pool::{PoolOptions, WorkerPool};

/// Armitage, a resilient orchestrator for LLM-driven TDD task pipelines.
#[derive(Parser)]
#[command(name = "armitage", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Create the state database and apply the schema.
    Init,
    /// Load decomposed tasks from a JSON file into the store.
    Ingest {
        /// Path to a JSON array of task definitions.
        file: PathBuf,
    },
    /// Run an orchestration session.
    Run {
        /// Number of workers (default from config).
        #[arg(long)]
        workers: Option<u32>,
        /// Revert orphaned in-progress tasks before starting.
        #[arg(long)]
        resume: bool,
        /// Invocation budget override for this run.
        #[arg(long)]
        max_invocations: Option<u32>,
    },
    /// Show task, run, and circuit status.
    Status,
    /// Circuit breaker operations.
    Circuits {
        /// Circuit subcommand.
        #[command(subcommand)]
        command: CircuitsCommand,
    },
    /// Move a blocked task back to pending.
    Retry {
        /// Task key, e.g. `TDD-17`.
        task_key: String,
    },
}

/// `circuits` subcommands.
#[derive(Subcommand)]
enum CircuitsCommand {
    /// Per-level breaker state counts.
    Health,
    /// Manually reset one breaker, e.g. `stage:TDD-17:green` or `system:system`.
    Reset {
        /// Target as `<level>:<identifier>`.
        target: String,
    },
}

/// Failure classes mapped onto process exit codes.
enum CliFailure {
    /// Bad configuration or arguments: exit 2.
    Config(anyhow::Error),
    /// Anything that went wrong while operating: exit 1.
    Operational(anyhow::Error),
}

impl From<anyhow::Error> for CliFailure {
    fn from(e: anyhow::Error) -> Self {
        Self::Operational(e)
    }
}

impl From<armitage::store::StoreError> for CliFailure {
    fn from(e: armitage::store::StoreError) -> Self {
        Self::Operational(e.into())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match Config::load() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return ExitCode::from(2);
        }
    };

    let result = match cli.command {
        Command::Init => handle_init(&config).await,
        Command::Ingest { file } => handle_ingest(&config, &file).await,
        Command::Run {
            workers,
            resume,
            max_invocations,
        } => handle_run(config, workers, resume, max_invocations).await,
        Command::Status => handle_status(&config).await,
        Command::Circuits { command } => handle_circuits(&config, command).await,
        Command::Retry { task_key } => handle_retry(&config, &task_key).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(CliFailure::Config(e)) => {
            eprintln!("configuration error: {e:#}");
            ExitCode::from(2)
        }
        Err(CliFailure::Operational(e)) => {
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}

/// Create the state database and apply the schema.
async fn handle_init(config: &Config) -> Result<(), CliFailure> {
    armitage::logging::init_cli();
    let db_path = config.db_path();
    Store::open(&db_path).await?;
    println!("initialized state database at {}", db_path.display());
    Ok(())
}

/// Load a JSON array of task definitions, skipping keys that already exist.
async fn handle_ingest(config: &Config, file: &std::path::Path) -> Result<(), CliFailure> {
    armitage::logging::init_cli();
    let contents = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))
        .map_err(CliFailure::Config)?;
    let specs: Vec<TaskSpec> = serde_json::from_str(&contents)
        .context("failed to parse task JSON")
        .map_err(CliFailure::Config)?;

    let store = Store::open(&config.db_path()).await?;
    let now = Utc::now();
    let mut inserted: usize = 0;
    let mut skipped: usize = 0;
    for spec in &specs {
        match store.insert_task(spec, now).await {
            Ok(_) => inserted = inserted.saturating_add(1),
            Err(armitage::store::StoreError::Duplicate { .. }) => {
                warn!(task_key = %spec.task_key, "task already exists, skipping");
                skipped = skipped.saturating_add(1);
            }
            Err(e) => return Err(e.into()),
        }
    }
    println!("ingested {inserted} task(s), skipped {skipped} duplicate(s)");
    Ok(())
}

/// Run an orchestration session until done, budget, or Ctrl-C.
async fn handle_run(
    config: Arc<Config>,
    workers: Option<u32>,
    resume: bool,
    max_invocations: Option<u32>,
) -> Result<(), CliFailure> {
    let mut config = (*config).clone();
    if let Some(n) = max_invocations {
        config.pool.max_invocations_per_session = n;
    }
    let workers = workers.unwrap_or(config.pool.max_workers);
    let config = Arc::new(config);

    let _logging_guard =
        armitage::logging::init_run(&config.logs_dir()).map_err(CliFailure::Operational)?;

    let llm = build_llm(&config)?;
    info!(provider = llm.name(), workers, "starting run");

    let store = Store::open(&config.db_path()).await?;
    let executor = StageExecutor::new(
        store.clone(),
        Arc::new(TieredPromptBuilder),
        llm,
        Arc::new(ProcessVerifier::new(std::time::Duration::from_secs(
            config.stages.verify_timeout_seconds,
        ))),
        Arc::new(ExportChecker),
    );

    // Ctrl-C flips the shutdown watch; the pool drains gracefully.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    let pool = WorkerPool::new(store, Arc::clone(&config), executor);
    let summary = pool
        .run(PoolOptions { workers, resume }, shutdown_rx)
        .await
        .map_err(CliFailure::Operational)?;
    println!("{}", summary.format_message());
    if summary.aborted {
        return Err(CliFailure::Operational(anyhow::anyhow!(
            "run aborted on an invariant violation; see the attempt and circuit audit trails"
        )));
    }
    Ok(())
}

/// Show task counts, the latest run, and breaker health.
async fn handle_status(config: &Config) -> Result<(), CliFailure> {
    armitage::logging::init_cli();
    let store = Store::open(&config.db_path()).await?;

    println!("tasks:");
    let counts = store.task_status_counts().await?;
    if counts.is_empty() {
        println!("  (none)");
    }
    for (status, count) in counts {
        println!("  {status}: {count}");
    }

    if let Some(run) = store.latest_run().await? {
        println!(
            "latest run {}: invocations_used={} of {}{}",
            run.run_uuid,
            run.invocations_used,
            run.max_invocations,
            if run.completed_at.is_some() {
                " (finished)"
            } else {
                " (in progress)"
            }
        );
    }

    let health = store.circuit_health().await?;
    println!("circuits:");
    for (label, level) in [
        ("stage", health.stage),
        ("worker", health.worker),
        ("system", health.system),
    ] {
        println!(
            "  {label}: {} closed, {} open, {} half-open ({} total)",
            level.closed_count, level.open_count, level.half_open_count, level.total
        );
    }
    Ok(())
}

/// Circuit health and manual reset.
async fn handle_circuits(config: &Config, command: CircuitsCommand) -> Result<(), CliFailure> {
    armitage::logging::init_cli();
    let store = Store::open(&config.db_path()).await?;
    let admin = Admin::new(store, config.circuits.clone());

    match command {
        CircuitsCommand::Health => {
            let health = admin.health().await?;
            println!(
                "stage: {} open / {} total; worker: {} open / {} total; system: {} open / {} total",
                health.stage.open_count,
                health.stage.total,
                health.worker.open_count,
                health.worker.total,
                health.system.open_count,
                health.system.total
            );
        }
        CircuitsCommand::Reset { target } => {
            let (level_raw, identifier) = target
                .split_once(':')
                .context("target must be <level>:<identifier>")
                .map_err(CliFailure::Config)?;
            let level: CircuitLevel = level_raw
                .parse()
                .map_err(CliFailure::Config)?;
            let state = admin.reset_circuit(level, identifier, Utc::now()).await?;
            println!("circuit {target} reset, state={state}");
        }
    }
    Ok(())
}

/// Operator recovery for a blocked task.
async fn handle_retry(config: &Config, task_key: &str) -> Result<(), CliFailure> {
    armitage::logging::init_cli();
    let store = Store::open(&config.db_path()).await?;
    let version = store.retry_task(task_key, Utc::now()).await?;
    println!("task {task_key} moved to pending (version {version})");
    Ok(())
}

/// Resolve the configured LLM collaborator.
fn build_llm(config: &Config) -> Result<Arc<dyn LlmClient>, CliFailure> {
    match config.llm.provider.as_str() {
        "noop" => Ok(Arc::new(NoopLlm)),
        "anthropic" => {
            let api_key = std::env::var(&config.llm.api_key_env)
                .with_context(|| format!("missing API key in ${}", config.llm.api_key_env))
                .map_err(CliFailure::Config)?;
            let client = HttpLlm::new(
                config.llm.model.clone(),
                api_key,
                std::time::Duration::from_secs(config.stages.llm_timeout_seconds),
            )
            .map_err(CliFailure::Config)?;
            Ok(Arc::new(client))
        }
        other => Err(CliFailure::Config(anyhow::anyhow!(
            "unknown llm provider: {other} (expected \"noop\" or \"anthropic\")"
        ))),
    }
}
