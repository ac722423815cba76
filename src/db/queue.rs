//! Durable submission queue.
//!
//! Items move `pending -> processing -> completed | failed`, and `failed`
//! items go back to `pending` only through the explicit [`Database::retry_failed`]
//! sweep while they have attempts left.

use anyhow::Result;
use chrono::{Duration, Utc};
use rusqlite::{params, Row};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use super::{format_timestamp, now_timestamp, Database};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::Pending => "pending",
            QueueState::Processing => "processing",
            QueueState::Completed => "completed",
            QueueState::Failed => "failed",
        }
    }
}

impl FromStr for QueueState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueState::Pending),
            "processing" => Ok(QueueState::Processing),
            "completed" => Ok(QueueState::Completed),
            "failed" => Ok(QueueState::Failed),
            other => Err(format!("unknown queue state '{}'", other)),
        }
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channel a submission arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionSource {
    Email,
    Upload,
    Sync,
    Bot,
}

impl SubmissionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionSource::Email => "email",
            SubmissionSource::Upload => "upload",
            SubmissionSource::Sync => "sync",
            SubmissionSource::Bot => "bot",
        }
    }
}

impl FromStr for SubmissionSource {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "email" => Ok(SubmissionSource::Email),
            "upload" | "web" => Ok(SubmissionSource::Upload),
            "sync" => Ok(SubmissionSource::Sync),
            "bot" | "telegram" => Ok(SubmissionSource::Bot),
            other => Err(format!("unknown submission source '{}'", other)),
        }
    }
}

impl fmt::Display for SubmissionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A submission as handed over by an ingestion source.
#[derive(Debug, Clone)]
pub struct NewQueueItem {
    pub photo_path: PathBuf,
    pub original_filename: Option<String>,
    pub submitter_member_id: Option<String>,
    pub submitter_email: Option<String>,
    pub source: SubmissionSource,
    pub priority: i64,
}

impl NewQueueItem {
    pub fn new(photo_path: impl Into<PathBuf>, source: SubmissionSource) -> Self {
        let photo_path = photo_path.into();
        let original_filename = photo_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string());
        Self {
            photo_path,
            original_filename,
            submitter_member_id: None,
            submitter_email: None,
            source,
            priority: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: i64,
    pub photo_path: PathBuf,
    pub original_filename: Option<String>,
    pub submitter_member_id: Option<String>,
    pub submitter_email: Option<String>,
    pub source: SubmissionSource,
    pub state: QueueState,
    pub priority: i64,
    pub attempts: u32,
    pub error_message: Option<String>,
    pub photo_id: Option<String>,
    pub outcome_note: Option<String>,
    pub submitted_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub oldest_pending: Option<String>,
}

impl QueueStats {
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.completed + self.failed
    }
}

const ITEM_COLUMNS: &str = "id, photo_path, original_filename, submitter_member_id, submitter_email, \
     source, status, priority, attempts, error_message, photo_id, outcome_note, \
     submitted_at, started_at, completed_at";

fn parse_column<T>(row: &Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

fn row_to_item(row: &Row) -> rusqlite::Result<QueueItem> {
    let path: String = row.get(1)?;
    Ok(QueueItem {
        id: row.get(0)?,
        photo_path: PathBuf::from(path),
        original_filename: row.get(2)?,
        submitter_member_id: row.get(3)?,
        submitter_email: row.get(4)?,
        source: parse_column(row, 5)?,
        state: parse_column(row, 6)?,
        priority: row.get(7)?,
        attempts: row.get(8)?,
        error_message: row.get(9)?,
        photo_id: row.get(10)?,
        outcome_note: row.get(11)?,
        submitted_at: row.get(12)?,
        started_at: row.get(13)?,
        completed_at: row.get(14)?,
    })
}

impl Database {
    pub fn enqueue(&self, item: &NewQueueItem) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO processing_queue (
                photo_path, original_filename, submitter_member_id, submitter_email,
                source, status, priority, attempts, submitted_at
            ) VALUES (?, ?, ?, ?, ?, 'pending', ?, 0, ?)
            "#,
            params![
                item.photo_path.to_string_lossy(),
                item.original_filename,
                item.submitter_member_id,
                item.submitter_email,
                item.source.as_str(),
                item.priority,
                now_timestamp(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_item(&self, id: i64) -> Result<Option<QueueItem>> {
        let sql = format!("SELECT {} FROM processing_queue WHERE id = ?", ITEM_COLUMNS);
        let result = self.conn.query_row(&sql, [id], row_to_item);

        match result {
            Ok(item) => Ok(Some(item)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Pending items in claim order: priority descending, then oldest first.
    pub fn pending_items(&self, limit: usize) -> Result<Vec<QueueItem>> {
        let sql = format!(
            "SELECT {} FROM processing_queue WHERE status = 'pending' \
             ORDER BY priority DESC, submitted_at ASC, id ASC LIMIT ?",
            ITEM_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let items = stmt
            .query_map([limit as i64], row_to_item)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(items)
    }

    /// Atomically pick the next pending item and move it to `processing`.
    ///
    /// Selection and transition happen in one statement, so concurrent
    /// workers on separate connections never receive the same item.
    pub fn claim_next(&self) -> Result<Option<QueueItem>> {
        let sql = format!(
            r#"
            UPDATE processing_queue
            SET status = 'processing', attempts = attempts + 1, started_at = ?1
            WHERE id = (
                SELECT id FROM processing_queue
                WHERE status = 'pending'
                ORDER BY priority DESC, submitted_at ASC, id ASC
                LIMIT 1
            ) AND status = 'pending'
            RETURNING {}
            "#,
            ITEM_COLUMNS
        );
        let result = self.conn.query_row(&sql, [now_timestamp()], row_to_item);

        match result {
            Ok(item) => Ok(Some(item)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Claim a specific item. Returns false if it was not pending.
    pub fn mark_processing(&self, id: i64) -> Result<bool> {
        let updated = self.conn.execute(
            r#"
            UPDATE processing_queue
            SET status = 'processing', attempts = attempts + 1, started_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
            params![now_timestamp(), id],
        )?;
        Ok(updated == 1)
    }

    pub fn mark_completed(&self, id: i64, photo_id: Option<&str>, note: Option<&str>) -> Result<()> {
        self.conn.execute(
            r#"
            UPDATE processing_queue
            SET status = 'completed', completed_at = ?, photo_id = ?, outcome_note = ?,
                error_message = NULL
            WHERE id = ?
            "#,
            params![now_timestamp(), photo_id, note, id],
        )?;
        Ok(())
    }

    pub fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        self.conn.execute(
            r#"
            UPDATE processing_queue
            SET status = 'failed', completed_at = ?, error_message = ?
            WHERE id = ?
            "#,
            params![now_timestamp(), error, id],
        )?;
        Ok(())
    }

    /// Return failed items with attempts left to `pending`. Returns the number reset.
    pub fn retry_failed(&self, max_attempts: u32) -> Result<usize> {
        let count = self.conn.execute(
            r#"
            UPDATE processing_queue
            SET status = 'pending', started_at = NULL, completed_at = NULL
            WHERE status = 'failed' AND attempts < ?
            "#,
            [max_attempts],
        )?;
        Ok(count)
    }

    /// Fail items stuck in `processing` since before `older_than_minutes`
    /// ago, e.g. after a worker crash. The claim already counted the
    /// attempt, so `retry_failed` keeps them bounded. Returns the number failed.
    pub fn fail_stale_processing(&self, older_than_minutes: u32) -> Result<usize> {
        let now = Utc::now().naive_utc();
        let cutoff = now - Duration::minutes(older_than_minutes as i64);
        let count = self.conn.execute(
            r#"
            UPDATE processing_queue
            SET status = 'failed', completed_at = ?, error_message = 'abandoned while processing'
            WHERE status = 'processing' AND (started_at IS NULL OR started_at < ?)
            "#,
            params![format_timestamp(&now), format_timestamp(&cutoff)],
        )?;
        Ok(count)
    }

    /// Delete completed items older than `days`. Pending, processing and
    /// failed items are never touched.
    pub fn cleanup_completed(&self, days: u32) -> Result<usize> {
        let cutoff = Utc::now().naive_utc() - Duration::days(days as i64);
        let count = self.conn.execute(
            "DELETE FROM processing_queue WHERE status = 'completed' AND completed_at < ?",
            [format_timestamp(&cutoff)],
        )?;
        Ok(count)
    }

    pub fn queue_stats(&self) -> Result<QueueStats> {
        let mut stats = QueueStats::default();

        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM processing_queue GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for (status, count) in rows.filter_map(|r| r.ok()) {
            match status.parse::<QueueState>() {
                Ok(QueueState::Pending) => stats.pending = count,
                Ok(QueueState::Processing) => stats.processing = count,
                Ok(QueueState::Completed) => stats.completed = count,
                Ok(QueueState::Failed) => stats.failed = count,
                Err(_) => {}
            }
        }

        stats.oldest_pending = self.conn.query_row(
            "SELECT MIN(submitted_at) FROM processing_queue WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;

        Ok(stats)
    }

    #[cfg(test)]
    pub(crate) fn backdate_queue_item(&self, id: i64, column: &str, ts: &str) -> Result<()> {
        let sql = format!("UPDATE processing_queue SET {} = ? WHERE id = ?", column);
        self.conn.execute(&sql, params![ts, id])?;
        Ok(())
    }
}
