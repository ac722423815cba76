//! Logging setup with journald support on Linux.
//!
//! The daemon logs to systemd's journal when it is reachable and falls back to
//! a daily-rolling file otherwise. The CLI logs to stderr.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the log filter, e.g. `GALLERY_INTAKE_LOG=gallery_intake=debug`.
pub const LOG_ENV: &str = "GALLERY_INTAKE_LOG";

#[derive(Debug, Clone)]
pub enum LogTarget {
    Stderr,
    /// Journald when available, else files under the given directory.
    Service { log_dir: Option<PathBuf> },
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize the global subscriber. Call once at startup.
pub fn init(target: LogTarget) -> Result<()> {
    match target {
        LogTarget::Stderr => {
            tracing_subscriber::registry()
                .with(env_filter())
                .with(fmt::layer().with_writer(std::io::stderr))
                .try_init()
                .context("Failed to set tracing subscriber")?;
            Ok(())
        }
        LogTarget::Service { log_dir } => init_service(log_dir),
    }
}

fn init_service(log_dir: Option<PathBuf>) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        if let Ok(journald_layer) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(env_filter())
                .with(journald_layer)
                .try_init()
                .context("Failed to set tracing subscriber")?;

            tracing::info!("Logging initialized with journald backend");
            return Ok(());
        }
    }

    let log_dir = log_dir.unwrap_or_else(|| {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gallery-intake")
            .join("logs")
    });

    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "gallery-intake.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // The guard flushes on drop; keep it for the life of the process.
    static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
        std::sync::OnceLock::new();
    let _ = GUARD.set(guard);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .try_init()
        .context("Failed to set tracing subscriber")?;

    tracing::info!(log_dir = %log_dir.display(), "Logging initialized with file backend");
    Ok(())
}
