//! weft CLI
//!
//! Runs the built-in demo programs on the execution engine and prints their
//! results together with the runtime counters.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod programs;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::Result;
use color_eyre::eyre::WrapErr;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use weft_core::Value;
use weft_runtime::{JoinType, MetricsSnapshot, Runtime, RuntimeConfig, RuntimeResult};

#[derive(Parser)]
#[command(name = "weft")]
#[command(about = "weft - fork-join concurrent execution engine", long_about = None)]
struct Cli {
    /// Runtime config file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Invoke a callable with N explicit workers
    FanOut {
        /// Number of workers
        #[arg(short, long, default_value_t = 4)]
        workers: usize,
        /// Index of a worker that raises an error
        #[arg(long)]
        fail: Option<usize>,
        /// Base delay per worker in milliseconds
        #[arg(long, default_value_t = 10)]
        delay_ms: u64,
    },
    /// Fork workers and join on all or some of them
    ForkJoin {
        /// Number of forked workers
        #[arg(short, long, default_value_t = 3)]
        workers: usize,
        /// Join condition
        #[arg(long, value_enum, default_value_t = JoinMode::All)]
        join: JoinMode,
        /// Workers required by a "some" join (defaults to every worker)
        #[arg(long)]
        count: Option<usize>,
        /// Join timeout in seconds
        #[arg(long)]
        timeout_secs: Option<i64>,
        /// Base delay per worker in milliseconds
        #[arg(long, default_value_t = 10)]
        delay_ms: u64,
    },
    /// Run the demo program entry point
    Run {
        /// Argument passed to demo.main
        #[arg(default_value_t = 7)]
        n: i64,
    },
    /// Print the effective runtime config
    Config,
}

#[derive(Clone, Copy, ValueEnum)]
enum JoinMode {
    All,
    Some,
}

#[derive(Serialize)]
struct Report {
    results: Vec<Value>,
    metrics: MetricsSnapshot,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => RuntimeConfig::default(),
    };

    match cli.command {
        Commands::FanOut {
            workers,
            fail,
            delay_ms,
        } => {
            let runtime = Runtime::new(Arc::new(programs::demo_program()), config)?;
            let callable = programs::fan_out(workers, fail, Duration::from_millis(delay_ms));
            info!(workers, "Fanning out");
            let results = runtime.invoke_blocking(&callable, Vec::new());
            report(runtime, results)
        }
        Commands::ForkJoin {
            workers,
            join,
            count,
            timeout_secs,
            delay_ms,
        } => {
            let join = match join {
                JoinMode::All => JoinType::All,
                JoinMode::Some => count.map_or(JoinType::SomeDefault, JoinType::Some),
            };
            let runtime = Runtime::new(Arc::new(programs::demo_program()), config)?;
            let callable = programs::fork_join(workers, join, timeout_secs, Duration::from_millis(delay_ms));
            info!(workers, ?join, ?timeout_secs, "Forking");
            let results = runtime.invoke_blocking(&callable, Vec::new());
            report(runtime, results)
        }
        Commands::Run { n } => {
            let runtime = Runtime::new(Arc::new(programs::demo_program()), config)?;
            let results = runtime.invoke_entrypoint(programs::DEMO_MODULE, "main", vec![Value::Int(n)]);
            report(runtime, results)
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("weft=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: &Path) -> Result<RuntimeConfig> {
    let text = std::fs::read_to_string(path).wrap_err_with(|| format!("reading config {}", path.display()))?;
    let config = RuntimeConfig::from_json(&text).wrap_err_with(|| format!("parsing config {}", path.display()))?;
    Ok(config)
}

/// Print results, or the rendered error trace and exit non-zero
fn report(runtime: Runtime, results: RuntimeResult<Vec<Value>>) -> Result<()> {
    match results {
        Ok(results) => {
            runtime.scheduler().wait_for_drain();
            let report = Report {
                results,
                metrics: runtime.metrics(),
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
            runtime.drain_and_exit();
            Ok(())
        }
        Err(err) if err.is_fatal() => {
            eprintln!("{}", err);
            if err.structured().is_some() {
                runtime.drain_and_exit();
            }
            std::process::exit(1);
        }
        Err(err) => {
            runtime.drain_and_exit();
            Err(err.into())
        }
    }
}
