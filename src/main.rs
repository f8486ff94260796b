//! CLI entry point for the command scheduler.
//!
//! Provides:
//! - `run`: submit one command against an in-memory device pool and block
//!   until it completes (useful for smoke-testing a run-config).
//! - `daemon`: start the scheduler against an in-memory device pool and run
//!   until `Ctrl-C`, draining gracefully.
//! - `batch`: submit every command in a cmdfile, then drain once they've
//!   all been considered.
//!
//! The Device Manager, Config Factory, and Invocation Engine this binary
//! wires up are the in-memory fakes from `cmd_scheduler::fakes` — real
//! deployments inject their own.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;

use cmd_scheduler::config::SchedulerConfig;
use cmd_scheduler::fakes::{
    EchoConfigFactory, InMemoryDeviceManager, LineCmdFileParser, LoggingListener,
    SleepyInvocationEngineFactory,
};
use cmd_scheduler::invocation::MultiListener;
use cmd_scheduler::scheduler::{CommandScheduler, QueueLengths};
use cmd_scheduler::tracing_init::{self, TracingConfig};
use cmd_scheduler::worker::LastResult;

#[derive(Parser)]
#[command(name = "cmd_scheduler")]
#[command(about = "Command scheduler core for a test-harness runtime", long_about = None)]
struct Cli {
    /// Path to a scheduler config TOML file (see `SchedulerConfig`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit one command and wait for the scheduler to drain.
    Run {
        /// Argument vector for the command, e.g. `cfg-A --loop --devices=2`.
        argv: Vec<String>,

        /// Number of in-memory devices in the pool.
        #[arg(long, default_value_t = 1)]
        devices: usize,

        /// How long each simulated invocation runs for.
        #[arg(long, default_value_t = 200)]
        invocation_ms: u64,

        /// Print the final summary as JSON instead of a log line.
        #[arg(long)]
        json: bool,
    },

    /// Start the scheduler and run until `Ctrl-C`.
    Daemon {
        /// Number of in-memory devices in the pool.
        #[arg(long, default_value_t = 4)]
        devices: usize,

        /// How long each simulated invocation runs for.
        #[arg(long, default_value_t = 1000)]
        invocation_ms: u64,
    },

    /// Submit every command in a cmdfile, then drain.
    Batch {
        /// Path to the cmdfile (one argument vector per line).
        path: PathBuf,

        /// Number of in-memory devices in the pool.
        #[arg(long, default_value_t = 2)]
        devices: usize,

        /// How long each simulated invocation runs for.
        #[arg(long, default_value_t = 200)]
        invocation_ms: u64,

        /// Print the final summary as JSON instead of a log line.
        #[arg(long)]
        json: bool,
    },

    /// Configuration file management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Writes the compiled-in default `SchedulerConfig` to `path` as TOML,
    /// for an operator to copy and edit.
    Init {
        /// Destination path for the generated TOML file.
        path: PathBuf,
    },
}

/// JSON-serializable summary printed by `run --json` / `batch --json`.
#[derive(Serialize)]
struct RunSummary {
    last_result: LastResult,
    queue_lengths: QueueLengths,
}

#[tokio::main]
async fn main() -> Result<()> {
    // `env_logger` covers startup diagnostics (argument parsing, config
    // load failures) before the `tracing` subscriber takes over.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    log::debug!("cmd_scheduler starting");
    tracing_init::init(&TracingConfig::default())?;

    let cli = Cli::parse();

    // `config init` needs no scheduler config of its own, so it's handled
    // before `SchedulerConfig::load` runs.
    if let Commands::Config { action } = cli.command {
        return run_config_action(action);
    }
    let config_path = cli.config;

    let scheduler_config = SchedulerConfig::load(config_path.as_deref().and_then(|p| p.to_str()))?;

    match cli.command {
        Commands::Run {
            argv,
            devices,
            invocation_ms,
            json,
        } => run_one(scheduler_config, argv, devices, invocation_ms, json).await,
        Commands::Daemon {
            devices,
            invocation_ms,
        } => run_daemon(scheduler_config, devices, invocation_ms).await,
        Commands::Batch {
            path,
            devices,
            invocation_ms,
            json,
        } => run_batch(scheduler_config, path, devices, invocation_ms, json).await,
        Commands::Config { .. } => unreachable!("handled above"),
    }
}

/// Serializes the compiled-in default config to TOML and writes it to
/// `path` with `toml::to_string_pretty`.
fn run_config_action(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Init { path } => {
            let toml_str = toml::to_string_pretty(&SchedulerConfig::default())?;
            std::fs::write(&path, toml_str)?;
            log::info!("wrote default scheduler config to {}", path.display());
            Ok(())
        }
    }
}

fn build_scheduler(config: SchedulerConfig, devices: usize, invocation_ms: u64) -> Arc<CommandScheduler> {
    let device_manager = Arc::new(InMemoryDeviceManager::with_devices(devices));
    let config_factory = Arc::new(EchoConfigFactory);
    let engine_factory = Arc::new(SleepyInvocationEngineFactory::new(Duration::from_millis(invocation_ms)));
    let mut listeners = MultiListener::new();
    listeners.add(Arc::new(LoggingListener));

    CommandScheduler::spawn(config, device_manager, config_factory, engine_factory, listeners)
}

async fn run_one(config: SchedulerConfig, argv: Vec<String>, devices: usize, invocation_ms: u64, json: bool) -> Result<()> {
    if argv.is_empty() {
        anyhow::bail!("run requires a non-empty argument vector");
    }
    let scheduler = build_scheduler(config, devices, invocation_ms);
    scheduler.wait_for_start(Some(Duration::from_secs(5))).await;

    let (_, id) = scheduler.add(argv, None).await?;
    tracing::info!(command_id = id, "command submitted, draining until it completes");

    scheduler.shutdown_on_empty();
    scheduler.join(Some(Duration::from_secs(30))).await;

    print_summary(&scheduler, json);
    Ok(())
}

async fn run_daemon(config: SchedulerConfig, devices: usize, invocation_ms: u64) -> Result<()> {
    let scheduler = build_scheduler(config, devices, invocation_ms);
    scheduler.wait_for_start(Some(Duration::from_secs(5))).await;
    tracing::info!(devices, "scheduler running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Ctrl-C received, draining gracefully");
    scheduler.shutdown(true);
    scheduler.join(None).await;
    Ok(())
}

async fn run_batch(config: SchedulerConfig, path: PathBuf, devices: usize, invocation_ms: u64, json: bool) -> Result<()> {
    let scheduler = build_scheduler(config, devices, invocation_ms);
    scheduler.wait_for_start(Some(Duration::from_secs(5))).await;

    let parser = LineCmdFileParser;
    let ids = scheduler.add_file(&path, Vec::new(), &parser).await?;
    tracing::info!(count = ids.len(), "batch submitted, draining until empty");

    scheduler.shutdown_on_empty();
    scheduler.join(None).await;

    print_summary(&scheduler, json);
    Ok(())
}

/// Prints the final `LastResult`/`QueueLengths` snapshot either as a log
/// line (the default) or as JSON via `serde_json`, for callers that want
/// to pipe `cmd_scheduler run`'s outcome into another tool.
fn print_summary(scheduler: &CommandScheduler, json: bool) {
    let summary = RunSummary {
        last_result: scheduler.last_result(),
        queue_lengths: scheduler.queue_lengths(),
    };
    if json {
        match serde_json::to_string(&summary) {
            Ok(s) => println!("{s}"),
            Err(e) => tracing::error!("failed to serialize run summary: {e}"),
        }
    } else {
        tracing::info!(last = ?summary.last_result, queues = ?summary.queue_lengths, "run complete");
    }
}
