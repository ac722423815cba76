//! Gallery intake daemon.
//!
//! Polls the submission queue and processes pending photos in the
//! background. Ingestion sources (mail gateway, upload form, sync jobs)
//! only enqueue; this daemon does the work.
//!
//! ## Usage
//!
//! ```bash
//! gallery-intake-daemon              # Run in foreground
//! gallery-intake-daemon --once       # Process pending submissions once and exit
//! ```

use anyhow::{Context, Result};
use chrono::Local;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

use gallery_intake::config::Config;
use gallery_intake::db::Database;
use gallery_intake::logging::{self, LogTarget};
use gallery_intake::pipeline::{run_workers, Pipeline};

/// Command line options
struct DaemonArgs {
    /// Overrides `daemon.poll_interval_secs`
    poll_interval: Option<u64>,
    /// Run once and exit
    once: bool,
    config_path: Option<PathBuf>,
}

/// Per-invocation loop state.
#[derive(Debug, Default)]
struct LoopState {
    cycles: u64,
}

fn main() -> Result<()> {
    let args = parse_args();

    let config = match args.config_path {
        Some(ref path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    logging::init(LogTarget::Service {
        log_dir: Some(Config::config_dir().join("logs")),
    })?;

    info!("Gallery intake daemon starting...");

    // Create the schema once; workers open their own connections.
    let db = Database::open(&config.database.path)?;
    db.initialize().context("Failed to initialize database")?;
    info!(path = %config.database.path.display(), "Database opened");

    let poll_interval = args.poll_interval.unwrap_or(config.daemon.poll_interval_secs);
    let pipeline = Pipeline::from_config(config);
    let mut state = LoopState::default();

    if args.once {
        info!("Running in single-shot mode");
        run_cycle(&pipeline, &db, &mut state)?;
    } else {
        info!(poll_interval, "Running in daemon mode");
        run_daemon_loop(&pipeline, &db, poll_interval, &mut state);
    }

    info!("Gallery intake daemon stopped");
    Ok(())
}

fn parse_args() -> DaemonArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut daemon_args = DaemonArgs {
        poll_interval: None,
        once: false,
        config_path: None,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--once" | "-1" => {
                daemon_args.once = true;
            }
            "--interval" | "-i" => {
                if i + 1 < args.len() {
                    if let Ok(interval) = args[i + 1].parse() {
                        daemon_args.poll_interval = Some(interval);
                    }
                    i += 1;
                }
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    daemon_args.config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    daemon_args
}

fn print_help() {
    println!(
        r#"gallery-intake-daemon - Background processor for the photo submission queue

USAGE:
    gallery-intake-daemon [OPTIONS]

OPTIONS:
    --once, -1          Process pending submissions once and exit
    --interval, -i N    Poll interval in seconds (default: daemon.poll_interval_secs)
    --config, -c PATH   Path to config file
    --help, -h          Show this help message

ENVIRONMENT:
    GALLERY_INTAKE_CONFIG   Path to config file (overrides default location)
    GALLERY_INTAKE_LOG      Log filter (trace, debug, info, warn, error)

Each cycle the daemon:
  - fails submissions stuck in processing longer than queue.stale_processing_minutes
  - requeues failed submissions below the attempt limit (daemon.auto_retry)
  - processes up to queue.batch_size pending submissions
  - periodically purges old completed submissions

Processing only happens within daemon.hours_start..daemon.hours_end when set.
"#
    );
}

fn run_daemon_loop(pipeline: &Pipeline, db: &Database, poll_interval: u64, state: &mut LoopState) {
    let interval = Duration::from_secs(poll_interval.max(1));

    loop {
        if pipeline.config().daemon.within_hours(Local::now().time()) {
            if let Err(e) = run_cycle(pipeline, db, state) {
                error!(error = %e, "Error processing submissions");
            }
        }

        thread::sleep(interval);
    }
}

fn run_cycle(pipeline: &Pipeline, db: &Database, state: &mut LoopState) -> Result<()> {
    let config = pipeline.config();
    state.cycles += 1;

    let abandoned = db.fail_stale_processing(config.queue.stale_processing_minutes)?;
    if abandoned > 0 {
        warn!(abandoned, "Failed submissions abandoned while processing");
    }

    if config.daemon.auto_retry {
        let requeued = db.retry_failed(config.queue.max_attempts)?;
        if requeued > 0 {
            info!(requeued, "Requeued failed submissions");
        }
    }

    let pending = db.queue_stats()?.pending;
    if pending > 0 {
        info!(pending, "Processing pending submissions");
        let stats = run_workers(
            pipeline,
            &config.database.path,
            config.queue.workers,
            config.queue.batch_size,
        )?;
        info!(
            processed = stats.processed,
            catalogued = stats.catalogued,
            duplicates = stats.duplicates,
            failed = stats.failed,
            "Cycle complete"
        );
    }

    let cleanup_every = u64::from(config.daemon.cleanup_every.max(1));
    if state.cycles % cleanup_every == 0 {
        let removed = db.cleanup_completed(config.queue.completed_retention_days)?;
        if removed > 0 {
            info!(removed, "Purged completed submissions");
        }
    }

    Ok(())
}
