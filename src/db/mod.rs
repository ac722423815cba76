mod schema;
pub mod directory;
pub mod faces;
pub mod photos;
pub mod queue;

use anyhow::{Context, Result};
use chrono::{NaiveDateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use tracing::debug;

use schema::{MIGRATIONS, SCHEMA};

pub use directory::{DirectorySnapshot, EmbeddingSource, Event, ImportCounts, KnownEmbedding, Member};
pub use faces::{BoundingBox, FaceRecord, NewFace};
pub use photos::{CataloguedPhoto, NewPhoto, Photo, PhotoStatus};
pub use queue::{NewQueueItem, QueueItem, QueueState, QueueStats, SubmissionSource};

/// Timestamp format used for every TEXT timestamp column.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
        .ok()
}

pub fn now_timestamp() -> String {
    format_timestamp(&Utc::now().naive_utc())
}

/// One SQLite connection. Workers each open their own.
pub struct Database {
    pub(crate) conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        let db = Self { conn };
        db.configure_pragmas()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.configure_pragmas()?;
        db.initialize()?;
        Ok(db)
    }

    fn configure_pragmas(&self) -> Result<()> {
        self.conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        debug!("SQLite pragmas configured");
        Ok(())
    }

    pub fn initialize(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        self.run_migrations();
        Ok(())
    }

    fn run_migrations(&self) {
        for migration in MIGRATIONS {
            let _ = self.conn.execute(migration, []);
        }
    }
}
