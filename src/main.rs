//! taskforge command-line tool
//!
//! Runs the built-in tasks on either backend and doubles as the worker
//! program for the isolated backend (`taskforge worker`).

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use std::collections::HashMap;
use std::process::ExitCode;
use std::time::{Duration, Instant};
use taskforge::{
    as_completed, builtins, isolated, BackendKind, Config, Executor, Future, ShutdownOptions,
    StartMethod, TaskId,
};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "taskforge")]
#[command(about = "Run tasks on thread or process pools", long_about = None)]
#[command(version)]
struct Cli {
    /// Log more (-v debug, -vv trace). RUST_LOG overrides this.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a built-in task once per input
    Run(RunArgs),

    /// List the built-in tasks
    Tasks,

    /// Serve the isolated worker protocol on stdin/stdout
    #[command(hide = true)]
    Worker,
}

#[derive(Args)]
struct RunArgs {
    /// Task name (see `taskforge tasks`)
    #[arg(long)]
    task: String,

    /// JSON argument; repeat for several tasks
    #[arg(long = "input", required = true)]
    inputs: Vec<String>,

    /// Worker count (default: one per CPU)
    #[arg(long, env = "TASKFORGE_WORKERS")]
    workers: Option<usize>,

    /// Backend: shared (threads) or isolated (processes)
    #[arg(long, env = "TASKFORGE_BACKEND", default_value = "shared")]
    backend: BackendKind,

    /// Replace an isolated worker after this many tasks
    #[arg(long, env = "TASKFORGE_MAX_TASKS_PER_WORKER")]
    max_tasks_per_worker: Option<usize>,

    /// Bound on queued tasks
    #[arg(long, env = "TASKFORGE_QUEUE_CAPACITY")]
    queue_capacity: Option<usize>,

    /// How isolated workers start
    #[arg(long, env = "TASKFORGE_START_METHOD", value_enum, default_value_t = StartKind::Spawn)]
    start_method: StartKind,

    /// Dispatch inputs in chunks and print results in input order
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Give up on results not ready after this many milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Stop at the first failed task and exit with status 1
    #[arg(long)]
    fail_fast: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StartKind {
    Spawn,
    Fork,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Run(args) => run(args),
        Commands::Tasks => {
            for (name, about) in builtins::describe() {
                println!("{:<12} {}", name, about);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Worker => isolated::serve_stdio(&builtins::registry())
            .map(|()| ExitCode::SUCCESS)
            .context("worker failed"),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::from(2)
        }
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "taskforge=info",
        1 => "taskforge=debug",
        _ => "taskforge=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // stdout carries results only
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

fn run(args: RunArgs) -> Result<ExitCode> {
    let inputs = args
        .inputs
        .iter()
        .enumerate()
        .map(|(i, raw)| {
            serde_json::from_str::<Value>(raw).with_context(|| format!("input {} is not valid JSON: {}", i, raw))
        })
        .collect::<Result<Vec<Value>>>()?;

    let registry = builtins::registry();
    if !registry.contains(&args.task) {
        bail!(
            "unknown task `{}` (known: {})",
            args.task,
            registry.names().join(", ")
        );
    }

    let config = build_config(&args)?;
    let executor = Executor::new(config, registry).context("failed to start executor")?;
    let timeout = args.timeout_ms.map(Duration::from_millis);
    let started = Instant::now();

    let failed = match args.chunk_size {
        Some(chunk_size) => run_chunked(&executor, &args, inputs, chunk_size, timeout)?,
        None => run_each(&executor, &args, inputs, timeout)?,
    };

    let options = if failed && args.fail_fast {
        ShutdownOptions::default().cancel_pending(true)
    } else {
        ShutdownOptions::default()
    };
    executor.shutdown(options);

    let metrics = executor.metrics();
    tracing::info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        completed = metrics.tasks_completed,
        failed = metrics.tasks_failed + metrics.tasks_panicked,
        cancelled = metrics.tasks_cancelled,
        workers_lost = metrics.workers_lost,
        p99_us = metrics.p99_latency_ns / 1_000,
        "run finished"
    );

    if failed && args.fail_fast {
        Ok(ExitCode::from(1))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

fn build_config(args: &RunArgs) -> Result<Config> {
    let mut builder = Config::builder().backend(args.backend);
    if let Some(workers) = args.workers {
        builder = builder.workers(workers);
    }
    if let Some(capacity) = args.queue_capacity {
        builder = builder.queue_capacity(capacity);
    }
    if let Some(max) = args.max_tasks_per_worker {
        builder = builder.max_tasks_per_worker(max);
    }
    match args.start_method {
        StartKind::Spawn => {
            builder = builder.start_method(StartMethod::default());
        }
        #[cfg(unix)]
        StartKind::Fork => {
            builder = builder.start_method(StartMethod::Fork);
        }
        #[cfg(not(unix))]
        StartKind::Fork => bail!("--start-method fork needs a unix host"),
    }
    Ok(builder.build()?)
}

/// Submit every input on its own and print results as they complete.
/// Returns whether any task failed.
fn run_each(
    executor: &Executor,
    args: &RunArgs,
    inputs: Vec<Value>,
    timeout: Option<Duration>,
) -> Result<bool> {
    let mut index_of: HashMap<TaskId, usize> = HashMap::new();
    let mut futures: Vec<Future<Value>> = Vec::with_capacity(inputs.len());
    for (i, input) in inputs.into_iter().enumerate() {
        let future = executor.submit(&args.task, input)?;
        index_of.insert(future.id(), i);
        futures.push(future);
    }

    let mut failed = false;
    for completed in as_completed(futures.clone(), timeout) {
        let future = match completed {
            Ok(future) => future,
            Err(e) => {
                tracing::error!(error = %e, "gave up waiting for results");
                for future in &futures {
                    if !future.cancel() {
                        future.interrupt();
                    }
                }
                return Ok(true);
            }
        };
        let index = index_of.get(&future.id()).copied().unwrap_or_default();
        match future.result(Some(Duration::ZERO)) {
            Ok(value) => println!("{}\t{}", index, value),
            Err(e) => {
                failed = true;
                tracing::error!(input = index, error = %e, "task failed");
                if args.fail_fast {
                    break;
                }
            }
        }
    }
    Ok(failed)
}

/// Dispatch inputs in chunks and print results in input order.
fn run_chunked(
    executor: &Executor,
    args: &RunArgs,
    inputs: Vec<Value>,
    chunk_size: usize,
    timeout: Option<Duration>,
) -> Result<bool> {
    let mut results = executor.map::<Value, Value, _>(&args.task, inputs, chunk_size)?;
    if let Some(timeout) = timeout {
        results = results.with_timeout(timeout);
    }

    let mut failed = false;
    for (index, result) in results.enumerate() {
        match result {
            Ok(value) => println!("{}\t{}", index, value),
            Err(e) => {
                // the iterator ends after its first error
                failed = true;
                tracing::error!(input = index, error = %e, "task failed");
            }
        }
    }
    Ok(failed)
}
