//! Orchestrator Loop: drives a coding-agent CLI through the tasks in a
//! human-authored plan, one task at a time, persisting progress so an
//! interrupted run can resume exactly where it left off.
//!
//! This binary is a thin `clap` front door over [`runner::Runner`]: it
//! parses arguments, wires up telemetry, builds a `Runner` from layered
//! configuration, dispatches to one of the four subcommands, and converts
//! the result into a process exit code. All the actual control-flow logic
//! lives in the library modules below, not here.

mod config;
mod domain;
mod errors;
mod escalation;
mod invoker;
mod lock;
mod oracle;
mod runner;
mod state_store;
mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, Level};

use config::Config;
use runner::Runner;
use telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "agent-orchestrator")]
#[command(about = "Drives a coding agent through a plan's tasks, one at a time", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable OTLP trace export.
    #[arg(long, global = true, default_value = "false")]
    otel: bool,

    /// OTLP collector endpoint; falls back to `OTEL_EXPORTER_OTLP_ENDPOINT`
    /// or `http://localhost:4317` when `--otel` is set without one.
    #[arg(long, global = true)]
    otel_endpoint: Option<String>,

    /// Suppress informational logging; only errors are printed.
    #[arg(long, short = 's', global = true, default_value = "false")]
    silent: bool,

    /// Verbose debug logging.
    #[arg(long, short = 'v', global = true, default_value = "false")]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a fresh run of a plan. Fails if the plan already has state.
    Run {
        plan: PathBuf,
        #[command(flatten)]
        overrides: RunOverrides,
    },
    /// Continue a previously interrupted run. Fails if no state exists.
    Resume {
        plan: PathBuf,
        #[command(flatten)]
        overrides: RunOverrides,
    },
    /// List every plan id with persisted state.
    List,
    /// Sum the reported coding-agent cost across every persisted plan.
    Cost,
}

/// Per-run overrides layered on top of [`Config::from_env`], mirroring the
/// teacher's pattern of letting individual flags punch through the
/// environment-derived defaults without requiring all of them at once.
#[derive(clap::Args, Default)]
struct RunOverrides {
    /// Model identifier passed to the coding agent, e.g. `sonnet`, `opus`.
    #[arg(long)]
    model: Option<String>,
    /// Wall-clock cap per coding-agent invocation, in seconds.
    #[arg(long)]
    timeout_secs: Option<u64>,
    /// Hard turn-count backstop passed to the coding agent.
    #[arg(long)]
    max_turns: Option<u32>,
    /// Directory holding one JSON state file per plan.
    #[arg(long)]
    state_dir: Option<PathBuf>,
    /// Directory holding one lock file per plan.
    #[arg(long)]
    lock_dir: Option<PathBuf>,
}

impl RunOverrides {
    /// Layer the flags that were actually passed on top of `config`,
    /// leaving anything unset at its `from_env` value.
    fn apply(self, config: &mut Config) {
        if let Some(model) = self.model {
            config.default_model = model;
        }
        if let Some(secs) = self.timeout_secs {
            config.invocation_timeout = std::time::Duration::from_secs(secs);
        }
        if let Some(max_turns) = self.max_turns {
            config.max_turns = max_turns;
        }
        if let Some(state_dir) = self.state_dir {
            config.state_dir = state_dir;
        }
        if let Some(lock_dir) = self.lock_dir {
            config.lock_dir = lock_dir;
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Telemetry is configured from the environment first so `OTEL_*`
    // variables work unattended (cron, CI), then the CLI's `--otel`/
    // `--silent`/`--verbose` flags layer on top for interactive use.
    let mut telemetry_config = TelemetryConfig::from_env();
    telemetry_config.log_level = if cli.silent {
        Level::ERROR
    } else if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    if cli.otel {
        if let Some(endpoint) = &cli.otel_endpoint {
            telemetry_config.otlp_endpoint = Some(endpoint.clone());
        } else if telemetry_config.otlp_endpoint.is_none() {
            telemetry_config.otlp_endpoint = Some("http://localhost:4317".to_string());
        }
    }

    if let Err(e) = init_telemetry(telemetry_config) {
        if !cli.silent {
            eprintln!("warning: failed to initialize telemetry: {e}");
        }
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    let exit_code = match cli.command {
        Commands::Run { plan, overrides } => run_or_resume(&plan, false, overrides).await,
        Commands::Resume { plan, overrides } => run_or_resume(&plan, true, overrides).await,
        Commands::List => list_plans().await,
        Commands::Cost => total_cost().await,
    };

    shutdown_telemetry();
    std::process::exit(exit_code);
}

/// Build a `Runner` from environment-derived configuration alone, for the
/// subcommands that take no per-run flags (`list`, `cost`).
async fn build_runner() -> Option<Arc<Runner>> {
    build_runner_with(RunOverrides::default()).await
}

/// Build a `Runner` from environment-derived configuration with `overrides`
/// layered on top. Returns `None` (having already logged the cause) rather
/// than propagating, since every caller's only recourse on failure is the
/// same "print and exit 1".
async fn build_runner_with(overrides: RunOverrides) -> Option<Arc<Runner>> {
    let mut config = Config::from_env();
    overrides.apply(&mut config);
    match Runner::new(config) {
        Ok(runner) => Some(Arc::new(runner)),
        Err(e) => {
            error!(error = %e, "failed to initialize orchestrator");
            None
        }
    }
}

/// Drive a single `run` or `resume` invocation to completion, wiring
/// `SIGINT`/`Ctrl-C` into the Runner's cooperative cancellation signal so an
/// interrupted operator gets a checkpointed stop instead of a hard kill.
async fn run_or_resume(plan: &PathBuf, resume: bool, overrides: RunOverrides) -> i32 {
    let Some(runner) = build_runner_with(overrides).await else {
        return 1;
    };

    let cancel_runner = Arc::clone(&runner);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("cancellation requested, stopping at the next safe point");
            cancel_runner.cancel();
        }
    });

    match runner.run(plan, resume).await {
        Ok(()) => {
            info!("run finished");
            0
        }
        Err(e) => {
            error!(error = %e, kind = e.kind(), "run ended with an error");
            1
        }
    }
}

async fn list_plans() -> i32 {
    let Some(runner) = build_runner().await else {
        return 1;
    };
    match runner.list_plans() {
        Ok(ids) => {
            for id in ids {
                println!("{id}");
            }
            0
        }
        Err(e) => {
            error!(error = %e, "failed to list plans");
            1
        }
    }
}

async fn total_cost() -> i32 {
    let Some(runner) = build_runner().await else {
        return 1;
    };
    match runner.total_cost() {
        Ok(cost) => {
            println!("{cost:.4}");
            0
        }
        Err(e) => {
            error!(error = %e, "failed to sum cost");
            1
        }
    }
}
