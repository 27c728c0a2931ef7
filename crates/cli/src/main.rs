//! `relay` CLI entry-point.
//!
//! Available sub-commands:
//! - `worker`   — claim runs from the queue and execute them.
//! - `execute`  — run a plan file locally and print the result.
//! - `validate` — compile a plan file without running it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use engine::{compile_plan, ExecutionPlan, Lazy};
use pool::{EngineConfig, EngineEvent, PoolConfig, RunOptions, RuntimeEngine};
use queue::{WorkerConfig, WorkerServer, WorkloopConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static ALLOC: pool::TrackingAllocator = pool::TrackingAllocator;

#[derive(Parser)]
#[command(name = "relay", about = "Workflow execution worker", version)]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Plain, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Plain,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to the queue and execute claimed runs until Ctrl-C.
    Worker(WorkerArgs),
    /// Execute a plan file locally and print its final state.
    Execute {
        /// Path to the plan JSON file.
        path: PathBuf,
        /// JSON file used as the initial state.
        #[arg(long)]
        state: Option<PathBuf>,
        /// Wall-clock budget for the whole run, in seconds.
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Compile a plan file and report any problems.
    Validate {
        /// Path to the plan JSON file.
        path: PathBuf,
    },
}

#[derive(clap::Args)]
struct WorkerArgs {
    /// Websocket URL of the queue.
    #[arg(long, env = "RELAY_LIGHTNING_URL", default_value = "ws://localhost:4000/worker")]
    lightning_url: String,
    /// Runs executed at once.
    #[arg(long, env = "RELAY_CAPACITY", default_value_t = 5)]
    capacity: usize,
    #[arg(long, env = "RELAY_BACKOFF_MIN_MS", default_value_t = 1000)]
    backoff_min_ms: u64,
    #[arg(long, env = "RELAY_BACKOFF_MAX_MS", default_value_t = 10_000)]
    backoff_max_ms: u64,
    #[arg(long, env = "RELAY_RUN_TIMEOUT_SECS", default_value_t = 600)]
    run_timeout_secs: u64,
    #[arg(long, env = "RELAY_JOB_TIMEOUT_SECS", default_value_t = 300)]
    job_timeout_secs: u64,
    #[arg(long, env = "RELAY_MEMORY_LIMIT_MB", default_value_t = 500)]
    memory_limit_mb: u64,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Plain => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Worker(args) => worker(args).await,
        Command::Execute {
            path,
            state,
            timeout_secs,
        } => execute(&path, state.as_deref(), timeout_secs).await,
        Command::Validate { path } => validate(&path),
    }
}

async fn worker(args: WorkerArgs) -> Result<()> {
    let engine = RuntimeEngine::new(EngineConfig {
        pool: PoolConfig {
            max_workers: args.capacity,
            default_timeout: Duration::from_secs(args.run_timeout_secs),
            default_memory_limit_mb: args.memory_limit_mb,
        },
        ..EngineConfig::default()
    });
    let config = WorkerConfig {
        lightning_url: args.lightning_url,
        capacity: args.capacity,
        workloop: WorkloopConfig {
            backoff_min: Duration::from_millis(args.backoff_min_ms),
            backoff_max: Duration::from_millis(args.backoff_max_ms),
        },
        run_timeout: Some(Duration::from_secs(args.run_timeout_secs)),
        job_timeout: Some(Duration::from_secs(args.job_timeout_secs)),
        memory_limit_mb: Some(args.memory_limit_mb),
    };

    info!(url = %config.lightning_url, capacity = config.capacity, "Starting worker");
    let server = WorkerServer::connect(config, engine)
        .await
        .context("cannot reach the queue")?;

    let cancel = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down, no new runs will be claimed");
            cancel.cancel();
        }
    });

    server.run().await?;
    server.shutdown().await;
    info!("Worker stopped");
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid JSON in {}", path.display()))
}

async fn execute(path: &Path, state: Option<&Path>, timeout_secs: Option<u64>) -> Result<()> {
    let mut plan: ExecutionPlan = read_json(path)?;
    if let Some(state) = state {
        plan = plan.with_initial_state(Lazy::Inline(read_json(state)?));
    }

    let engine = RuntimeEngine::new(EngineConfig::default());
    let options = RunOptions {
        timeout: timeout_secs.map(Duration::from_secs),
        ..RunOptions::default()
    };
    let mut handle = engine.execute(plan, options)?;

    let mut outcome = None;
    while let Some(event) = handle.events.recv().await {
        match event {
            EngineEvent::Log(log) => eprintln!("[{}] {}", log.job_id, log.message),
            EngineEvent::JobError { job_id, error, .. } => {
                eprintln!("job {job_id} failed ({}): {}", error.severity(), error.message());
            }
            EngineEvent::WorkflowComplete { state, .. } => outcome = Some(Ok(state)),
            EngineEvent::WorkflowError { error, .. } => outcome = Some(Err(error)),
            _ => {}
        }
    }
    engine.destroy(false).await;

    match outcome {
        Some(Ok(state)) => {
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(())
        }
        Some(Err(failure)) => bail!(
            "run failed ({} {}): {}",
            failure.severity,
            failure.error_type,
            failure.message
        ),
        None => bail!("run ended without an outcome"),
    }
}

fn validate(path: &Path) -> Result<()> {
    let plan: ExecutionPlan = read_json(path)?;
    match compile_plan(plan) {
        Ok(compiled) => {
            println!(
                "✅ Plan is valid. {} jobs, starting at '{}'",
                compiled.jobs.len(),
                compiled.start
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Validation failed:\n{e}");
            std::process::exit(1);
        }
    }
}
