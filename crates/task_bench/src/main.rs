// task-bench binary entry point.
//
// Wires the CLI, logging, signal plumbing, and exit-code mapping around the
// smoke / reliability / claim / stress modes.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use task_bench::claim::{self, ClaimConfig, ClaimHammer, ClaimStats};
use task_bench::client::{TaskApi, TaskClient, pick_task};
use task_bench::invoker::GrpcurlInvoker;
use task_bench::stats::{ErrorLog, RunStats};
use task_bench::stress::{self, RunOutcome, Scheduler, StreamDispatch, StressConfig};
use task_bench::{reliability, smoke};

/// Exit code for a forced stop on a second interrupt.
const EXIT_FORCED: i32 = 130;

#[derive(Parser, Debug)]
#[command(
    name = "task-bench",
    about = "Load and correctness harness for the tasks.v1 TaskService"
)]
struct Args {
    /// Mode: smoke (default) | reliability | claim | stress.
    mode: Option<String>,

    /// Target service address passed to the relay.
    #[arg(long, env = "GRPC_TARGET", default_value = "localhost:50051")]
    target: String,

    /// Acting user id; a fresh UUID when unset.
    #[arg(long, env = "USER_ID")]
    user_id: Option<String>,

    /// Pin the task under test instead of auto-selecting one.
    #[arg(long, env = "TASK_ID")]
    task_id: Option<String>,

    /// Stress run duration in seconds; 0 runs until interrupted.
    #[arg(long, env = "DURATION_SEC", default_value_t = 0)]
    duration_sec: u64,

    /// Maximum concurrently in-flight batches.
    #[arg(long, env = "CONCURRENCY", default_value_t = 32)]
    concurrency: usize,

    /// Events per batch.
    #[arg(long, env = "BATCH_SIZE", default_value_t = 50)]
    batch_size: usize,

    /// Claim-mode worker count.
    #[arg(long, env = "WORKERS", default_value_t = 2)]
    workers: usize,

    /// Claim-mode request budget shared by all workers.
    #[arg(long, env = "COUNT", default_value_t = 2)]
    count: u64,

    /// Claim until interrupted instead of honoring --count.
    #[arg(long, env = "FOREVER")]
    forever: bool,

    /// Per-worker pause between claims, in milliseconds.
    #[arg(long, env = "CLAIM_DELAY_MS", default_value_t = 0)]
    claim_delay_ms: u64,

    /// Log every Nth successful claim.
    #[arg(long, env = "LOG_EVERY", default_value_t = 100)]
    log_every: u64,

    /// File receiving one line per failed batch.
    #[arg(long, env = "ERROR_LOG", default_value = "task_bench_errors.txt")]
    error_log: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let user_id = args
        .user_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let invoker = Arc::new(GrpcurlInvoker::new(args.target.clone()));
    let client = TaskClient::new(invoker.clone());

    match args.mode.as_deref() {
        None | Some("smoke") => smoke::run(&client, &args.target, &user_id).await,
        Some("reliability") => {
            println!("Target: {}", args.target);
            reliability::run(&client, &user_id, args.task_id.as_deref()).await
        }
        Some("claim") => run_claim(&args, invoker, user_id).await,
        Some("stress") => run_stress(&args, invoker, &client, user_id).await,
        _ => {
            eprintln!("Usage: task-bench <smoke|reliability|claim|stress>");
            std::process::exit(1);
        }
    }
}

/// Run the claim hammer: spin up the worker pool, flip the cancel flag on the
/// first interrupt, and print the tally when the pool winds down.
async fn run_claim(
    args: &Args,
    invoker: Arc<GrpcurlInvoker>,
    user_id: String,
) -> anyhow::Result<()> {
    let Some(task_id) = args.task_id.clone() else {
        eprintln!("Usage: task-bench claim --task-id <id> [--user-id <id>]");
        std::process::exit(1);
    };

    let cfg = ClaimConfig {
        target: args.target.clone(),
        user_id,
        task_id,
        count: (!args.forever).then_some(args.count),
        workers: args.workers,
        delay: (args.claim_delay_ms > 0)
            .then(|| std::time::Duration::from_millis(args.claim_delay_ms)),
        log_every: args.log_every,
    };
    tracing::info!(
        target = %cfg.target,
        workers = cfg.workers,
        count = ?cfg.count,
        "starting claim run"
    );

    let stats = Arc::new(ClaimStats::new());
    let hammer = ClaimHammer::new(cfg, invoker, stats.clone());

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel_tx.send(true);
        }
    });

    hammer.run(cancel_rx).await;
    claim::print_summary(&stats.snapshot());
    Ok(())
}

/// Resolve the stress configuration, forward interrupt signals to the
/// scheduler, and map the outcome to the process exit code.
async fn run_stress(
    args: &Args,
    invoker: Arc<GrpcurlInvoker>,
    client: &TaskClient,
    user_id: String,
) -> anyhow::Result<()> {
    let task_id = match &args.task_id {
        Some(id) => id.clone(),
        None => {
            let list = client.tasks_with_progress(&user_id).await?;
            pick_task(&list)?.id.clone()
        }
    };

    let cfg = StressConfig {
        target: args.target.clone(),
        user_id,
        task_id,
        duration: (args.duration_sec > 0)
            .then(|| std::time::Duration::from_secs(args.duration_sec)),
        concurrency: args.concurrency,
        batch_size: args.batch_size,
    };
    let stats = Arc::new(RunStats::new());
    let errors = Arc::new(ErrorLog::open(&args.error_log).context("open error log")?);
    let scheduler = Scheduler::new(
        cfg.clone(),
        Arc::new(StreamDispatch::new(invoker)),
        stats.clone(),
        errors,
    );

    // Forward every SIGINT as one pulse; the scheduler runs the drain state
    // machine. An unfilled channel slot is fine: a third signal while the
    // second is still queued changes nothing.
    let (pulse_tx, pulse_rx) = mpsc::channel::<()>(2);
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            if pulse_tx.send(()).await.is_err() {
                return;
            }
        }
    });

    match scheduler.run(pulse_rx).await {
        RunOutcome::Forced => {
            // No stats flush on the forced path.
            std::process::exit(EXIT_FORCED);
        }
        RunOutcome::Completed | RunOutcome::Drained => {
            stress::print_summary(&cfg, stats.snapshot());
            Ok(())
        }
    }
}
