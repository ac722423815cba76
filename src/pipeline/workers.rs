//! Runs several pipelines at once, one thread and one connection each.
//!
//! Workers coordinate only through the queue's atomic claim.

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::thread;
use tracing::{debug, error};

use super::{Pipeline, ProcessingStats};
use crate::db::Database;

/// Process up to `limit` items across `workers` threads against the
/// database at `db_path`. Returns the combined stats.
pub fn run_workers(pipeline: &Pipeline, db_path: &Path, workers: usize, limit: usize) -> Result<ProcessingStats> {
    let workers = workers.max(1);
    if workers == 1 {
        let db = Database::open(db_path)?;
        return pipeline.process_batch(&db, limit);
    }

    // Split the limit so the total never exceeds it.
    let share = limit / workers;
    let remainder = limit % workers;

    let handles = (0..workers)
        .map(|index| {
            let pipeline = pipeline.clone();
            let db_path = db_path.to_path_buf();
            let quota = share + usize::from(index < remainder);
            thread::Builder::new()
                .name(format!("intake-worker-{}", index))
                .spawn(move || -> Result<ProcessingStats> {
                    if quota == 0 {
                        return Ok(ProcessingStats::default());
                    }
                    let db = Database::open(&db_path)?;
                    debug!(worker = index, quota, "Worker started");
                    pipeline.process_batch(&db, quota)
                })
                .context("Failed to spawn worker thread")
        })
        .collect::<Result<Vec<_>>>()?;

    let mut total = ProcessingStats::default();
    let mut first_error: Option<anyhow::Error> = None;
    for handle in handles {
        match handle.join() {
            Ok(Ok(stats)) => total.merge(&stats),
            Ok(Err(e)) => {
                error!(error = %e, "Worker stopped with an error");
                first_error = first_error.or(Some(e));
            }
            Err(_) => {
                error!("Worker thread panicked");
                first_error = first_error.or_else(|| Some(anyhow!("Worker thread panicked")));
            }
        }
    }

    match first_error {
        Some(e) if total.processed == 0 => Err(e),
        _ => Ok(total),
    }
}
