use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use dotenvy::dotenv;
use foreman::{Platform, Registry, WorkerConfig};
use tracing::{error, info, warn};

const EXIT_OK: u8 = 0;
const EXIT_IMPROPERLY_CONFIGURED: u8 = 78;
const EXIT_BROKER_EXHAUSTED: u8 = 69;
const EXIT_GENERIC_FAILURE: u8 = 1;

#[derive(Parser)]
#[command(author, version, about = "Foreman distributed task worker", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<String>,

    /// Override the configured log level (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,

    /// Override the worker's advertised hostname
    #[arg(long)]
    hostname: Option<String>,

    /// Override the pool's slot count
    #[arg(long)]
    concurrency: Option<usize>,

    /// Comma-separated queue names to consume; only the first is honored
    /// in this release
    #[arg(long, value_delimiter = ',')]
    queues: Vec<String>,

    /// Enable the periodic beat scheduler
    #[arg(long, conflicts_with = "no_beat")]
    beat: bool,

    /// Disable the periodic beat scheduler
    #[arg(long, conflicts_with = "beat")]
    no_beat: bool,

    /// Beat schedule file path
    #[arg(long)]
    schedule: Option<String>,

    /// Persisted worker state file path
    #[arg(long)]
    state_db: Option<String>,

    /// Enable monitoring event publication
    #[arg(long, conflicts_with = "no_events")]
    events: bool,

    /// Disable monitoring event publication
    #[arg(long, conflicts_with = "events")]
    no_events: bool,

    /// Hard time limit in seconds applied to every task lacking its own
    #[arg(long)]
    time_limit: Option<u64>,

    /// Soft time limit in seconds applied to every task lacking its own
    #[arg(long)]
    soft_time_limit: Option<u64>,

    /// Recycle a pool slot after this many completed tasks
    #[arg(long)]
    max_tasks_per_child: Option<u64>,

    /// Purge the default queue before consuming
    #[arg(long)]
    purge: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    let args = Args::parse();

    let mut config = match WorkerConfig::load_from_path(args.config.as_deref()) {
        Ok(c) => c,
        Err(err) => {
            eprintln!("improperly configured: {err:#}");
            return ExitCode::from(EXIT_IMPROPERLY_CONFIGURED);
        }
    };

    apply_overrides(&mut config, &args);

    if let Err(err) = validate(&config) {
        eprintln!("improperly configured: {err}");
        return ExitCode::from(EXIT_IMPROPERLY_CONFIGURED);
    }

    init_logging(&config, args.log_file.as_deref());

    print_banner(&config);

    if args.purge {
        warn!(queue = %config.routing.default_queue, "purge requested; the in-memory broker holds no state across restarts");
    }

    // Task handlers are registered by the embedding application before
    // boot; this binary ships with an empty registry and exists to
    // exercise the lifecycle, signal handling, and CLI surface.
    let registry = Registry::new();

    let platform = Platform::new(config, registry);
    let runtime = match platform.start().await {
        Ok(r) => r,
        Err(err) => {
            error!(error = %err, "failed to start worker");
            return ExitCode::from(EXIT_BROKER_EXHAUSTED);
        }
    };

    info!("worker ready, awaiting shutdown signal");
    await_shutdown_signal().await;

    info!("shutdown signal received, stopping gracefully");
    match runtime.shutdown().await {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(err) => {
            error!(error = %err, "error during shutdown");
            ExitCode::from(EXIT_GENERIC_FAILURE)
        }
    }
}

fn apply_overrides(config: &mut WorkerConfig, args: &Args) {
    if let Some(level) = &args.log_level {
        config.observability.log_level = level.clone();
    }
    if let Some(hostname) = &args.hostname {
        config.metadata.hostname = hostname.clone();
    }
    if let Some(concurrency) = args.concurrency {
        config.concurrency.worker_concurrency = concurrency;
    }
    if let Some(queue) = args.queues.first() {
        if args.queues.len() > 1 {
            warn!(requested = ?args.queues, using = %queue, "multiple queues requested; consuming only the first");
        }
        config.routing.default_queue = queue.clone();
        config.routing.default_exchange = queue.clone();
        config.routing.default_routing_key = queue.clone();
    }
    if args.beat {
        config.beat.enabled = true;
    }
    if args.no_beat {
        config.beat.enabled = false;
    }
    if let Some(schedule) = &args.schedule {
        config.beat.schedule_filename = schedule.clone();
    }
    if let Some(state_db) = &args.state_db {
        config.state.state_db = state_db.clone();
    }
    if args.events {
        config.observability.send_events = true;
    }
    if args.no_events {
        config.observability.send_events = false;
    }
    if let Some(secs) = args.time_limit {
        config.time_limits.task_time_limit_secs = Some(secs);
    }
    if let Some(secs) = args.soft_time_limit {
        config.time_limits.task_soft_time_limit_secs = Some(secs);
    }
    if let Some(max) = args.max_tasks_per_child {
        config.concurrency.max_tasks_per_child = Some(max);
    }
}

fn validate(config: &WorkerConfig) -> Result<(), String> {
    if let (Some(hard), Some(soft)) = (config.time_limits.hard_limit(), config.time_limits.soft_limit()) {
        if hard < soft {
            return Err(format!(
                "hard time limit ({hard:?}) is less than soft time limit ({soft:?})"
            ));
        }
    }
    if config.concurrency.worker_concurrency == 0 {
        return Err("concurrency must be at least 1".to_string());
    }
    Ok(())
}

fn init_logging(config: &WorkerConfig, log_file: Option<&str>) {
    let filter = config.observability.log_level.clone();
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let init_result = match log_file {
        Some(path) => match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => builder.with_writer(std::sync::Mutex::new(file)).try_init(),
            Err(err) => {
                eprintln!("failed to open log file {path}: {err}, logging to stderr instead");
                builder.try_init()
            }
        },
        None => builder.try_init(),
    };
    let _ = init_result;
}

fn print_banner(config: &WorkerConfig) {
    info!(
        worker = %config.metadata.worker_name,
        hostname = %config.metadata.hostname,
        concurrency = config.concurrency.worker_concurrency,
        queue = %config.routing.default_queue,
        beat = config.beat.enabled,
        "foreman worker starting"
    );
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sighup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sighup.recv() => info!("received SIGHUP, treating as shutdown"),
            _ = first_then_second_ctrl_c() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Waits for the first Ctrl-C (graceful shutdown request); a second
/// Ctrl-C within the grace window aborts the process immediately rather
/// than waiting for in-flight tasks to finish.
async fn first_then_second_ctrl_c() {
    let _ = tokio::signal::ctrl_c().await;
    info!("received SIGINT, shutting down (press again within 5s to force-exit)");

    let forced = tokio::time::timeout(Duration::from_secs(5), tokio::signal::ctrl_c()).await;
    if forced.is_ok() {
        warn!("second SIGINT received, forcing immediate exit");
        std::process::exit(130);
    }
}
