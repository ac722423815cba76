//! Members, events and registrations.
//!
//! This is reference data owned by the external membership directory. The
//! intake side only reads it, apart from caching geocoded event coordinates
//! and growing the embedding pool from confirmed faces.

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{params, params_from_iter, Row, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::{info, warn};

use super::{format_timestamp, parse_timestamp, Database};
use crate::faces::Embedding;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    pub display_name: String,
    #[serde(default)]
    pub face_recognition_opt_out: bool,
}

impl Member {
    pub fn new(id: &str, display_name: &str) -> Self {
        Self {
            id: id.to_string(),
            email: None,
            display_name: display_name.to_string(),
            face_recognition_opt_out: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: String,
    pub name: String,
    pub start: NaiveDateTime,
    pub end: Option<NaiveDateTime>,
    pub location_name: Option<String>,
    pub location_address: Option<String>,
    pub location_lat: Option<f64>,
    pub location_lon: Option<f64>,
    pub activity: Option<String>,
    pub is_public: bool,
}

impl Event {
    pub fn new(id: &str, name: &str, start: NaiveDateTime) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            start,
            end: None,
            location_name: None,
            location_address: None,
            location_lat: None,
            location_lon: None,
            activity: None,
            is_public: false,
        }
    }

    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.location_lat, self.location_lon) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }
}

/// Provenance of a reference embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingSource {
    Directory,
    SelfTag,
    Confirmed,
}

impl EmbeddingSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingSource::Directory => "directory",
            EmbeddingSource::SelfTag => "self_tag",
            EmbeddingSource::Confirmed => "confirmed",
        }
    }
}

impl FromStr for EmbeddingSource {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "directory" => Ok(EmbeddingSource::Directory),
            "self_tag" => Ok(EmbeddingSource::SelfTag),
            "confirmed" => Ok(EmbeddingSource::Confirmed),
            other => Err(format!("unknown embedding source '{}'", other)),
        }
    }
}

impl fmt::Display for EmbeddingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A member's reference embedding as loaded for matching.
#[derive(Debug, Clone)]
pub struct KnownEmbedding {
    pub member_id: String,
    pub embedding: Embedding,
    pub source: EmbeddingSource,
    pub quality_score: Option<f32>,
}

const EVENT_COLUMNS: &str = "id, name, start_date, end_date, location_name, location_address, \
     location_lat, location_lon, activity, is_public";

fn row_to_event(row: &Row) -> rusqlite::Result<Event> {
    let start: String = row.get(2)?;
    let end: Option<String> = row.get(3)?;
    let start = parse_timestamp(&start).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("bad event start '{}'", start).into(),
        )
    })?;
    Ok(Event {
        id: row.get(0)?,
        name: row.get(1)?,
        start,
        end: end.as_deref().and_then(parse_timestamp),
        location_name: row.get(4)?,
        location_address: row.get(5)?,
        location_lat: row.get(6)?,
        location_lon: row.get(7)?,
        activity: row.get(8)?,
        is_public: row.get(9)?,
    })
}

type RawEmbeddingRow = (i64, String, Vec<u8>, String, Option<f32>);

fn row_to_raw_embedding(row: &Row) -> rusqlite::Result<RawEmbeddingRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn row_to_member(row: &Row) -> rusqlite::Result<Member> {
    Ok(Member {
        id: row.get(0)?,
        email: row.get(1)?,
        display_name: row.get(2)?,
        face_recognition_opt_out: row.get(3)?,
    })
}

impl Database {
    // ========================================================================
    // Members
    // ========================================================================

    pub fn upsert_member(&self, member: &Member) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO members (id, email, display_name, face_recognition_opt_out, updated_at)
            VALUES (?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                email = excluded.email,
                display_name = excluded.display_name,
                face_recognition_opt_out = excluded.face_recognition_opt_out,
                updated_at = CURRENT_TIMESTAMP
            "#,
            params![
                member.id,
                member.email,
                member.display_name,
                member.face_recognition_opt_out
            ],
        )?;
        Ok(())
    }

    pub fn get_member(&self, id: &str) -> Result<Option<Member>> {
        let result = self.conn.query_row(
            "SELECT id, email, display_name, face_recognition_opt_out FROM members WHERE id = ?",
            [id],
            row_to_member,
        );

        match result {
            Ok(member) => Ok(Some(member)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve a free-text submitter email to a member (case-insensitive).
    pub fn member_by_email(&self, email: &str) -> Result<Option<Member>> {
        let result = self.conn.query_row(
            r#"
            SELECT id, email, display_name, face_recognition_opt_out FROM members
            WHERE email = ? COLLATE NOCASE
            ORDER BY id LIMIT 1
            "#,
            [email.trim()],
            row_to_member,
        );

        match result {
            Ok(member) => Ok(Some(member)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Display names for the given member ids. Unknown ids are absent.
    pub fn member_names(&self, ids: &[String]) -> Result<HashMap<String, String>> {
        let mut names = HashMap::new();
        if ids.is_empty() {
            return Ok(names);
        }

        for chunk in ids.chunks(500) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT id, display_name FROM members WHERE id IN ({})",
                placeholders
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            names.extend(rows.filter_map(|r| r.ok()));
        }

        Ok(names)
    }

    pub fn add_member_embedding(
        &self,
        member_id: &str,
        embedding: &Embedding,
        source: EmbeddingSource,
        quality_score: Option<f32>,
    ) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO member_embeddings (member_id, embedding, embedding_dim, source, quality_score)
            VALUES (?, ?, ?, ?, ?)
            "#,
            params![
                member_id,
                embedding.to_bytes(),
                embedding.dim() as i64,
                source.as_str(),
                quality_score
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Reference embeddings in load order, skipping members who opted out
    /// of face recognition. `member_ids` narrows the pool when given.
    pub fn load_member_embeddings(&self, member_ids: Option<&[String]>) -> Result<Vec<KnownEmbedding>> {
        let base = r#"
            SELECT e.id, e.member_id, e.embedding, e.source, e.quality_score
            FROM member_embeddings e
            JOIN members m ON m.id = e.member_id
            WHERE m.face_recognition_opt_out = 0
        "#;

        let raw: Vec<RawEmbeddingRow> = match member_ids {
            Some([]) => return Ok(Vec::new()),
            Some(ids) => {
                let mut all: Vec<RawEmbeddingRow> = Vec::new();
                for chunk in ids.chunks(500) {
                    let placeholders = vec!["?"; chunk.len()].join(", ");
                    let sql = format!(
                        "{} AND e.member_id IN ({}) ORDER BY e.id",
                        base, placeholders
                    );
                    let mut stmt = self.conn.prepare(&sql)?;
                    let rows = stmt.query_map(params_from_iter(chunk.iter()), row_to_raw_embedding)?;
                    all.extend(rows.filter_map(|r| r.ok()));
                }
                // Chunks are each ordered; restore one order across them.
                all.sort_by_key(|row| row.0);
                all
            }
            None => {
                let sql = format!("{} ORDER BY e.id", base);
                let mut stmt = self.conn.prepare(&sql)?;
                let rows = stmt.query_map([], row_to_raw_embedding)?;
                rows.filter_map(|r| r.ok()).collect()
            }
        };

        let mut pool = Vec::with_capacity(raw.len());
        for (_, member_id, blob, source, quality_score) in raw {
            match Embedding::from_bytes(&blob) {
                Ok(embedding) => pool.push(KnownEmbedding {
                    member_id,
                    embedding,
                    source: source.parse().unwrap_or(EmbeddingSource::Directory),
                    quality_score,
                }),
                Err(e) => warn!(member_id = %member_id, error = %e, "Skipping unreadable embedding"),
            }
        }

        Ok(pool)
    }

    // ========================================================================
    // Events
    // ========================================================================

    pub fn upsert_event(&self, event: &Event) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO events (
                id, name, start_date, end_date, location_name, location_address,
                location_lat, location_lon, activity, is_public, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                start_date = excluded.start_date,
                end_date = excluded.end_date,
                location_name = excluded.location_name,
                location_address = excluded.location_address,
                location_lat = COALESCE(excluded.location_lat, events.location_lat),
                location_lon = COALESCE(excluded.location_lon, events.location_lon),
                activity = excluded.activity,
                is_public = excluded.is_public,
                updated_at = CURRENT_TIMESTAMP
            "#,
            params![
                event.id,
                event.name,
                format_timestamp(&event.start),
                event.end.as_ref().map(format_timestamp),
                event.location_name,
                event.location_address,
                event.location_lat,
                event.location_lon,
                event.activity,
                event.is_public,
            ],
        )?;
        Ok(())
    }

    pub fn get_event(&self, id: &str) -> Result<Option<Event>> {
        let sql = format!("SELECT {} FROM events WHERE id = ?", EVENT_COLUMNS);
        let result = self.conn.query_row(&sql, [id], row_to_event);

        match result {
            Ok(event) => Ok(Some(event)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Events whose `[start - window, end + window]` day range contains `date`.
    pub fn events_in_window(&self, date: NaiveDate, window_days: i64) -> Result<Vec<Event>> {
        let sql = format!(
            r#"
            SELECT {} FROM events
            WHERE date(start_date, ?1) <= date(?3)
              AND date(COALESCE(end_date, start_date), ?2) >= date(?3)
            ORDER BY start_date, id
            "#,
            EVENT_COLUMNS
        );
        let before = format!("-{} days", window_days);
        let after = format!("+{} days", window_days);
        let day = date.format("%Y-%m-%d").to_string();

        let mut stmt = self.conn.prepare(&sql)?;
        let events = stmt
            .query_map(params![before, after, day], row_to_event)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(events)
    }

    /// Cache geocoded coordinates on the event.
    pub fn update_event_coordinates(&self, event_id: &str, lat: f64, lon: f64) -> Result<()> {
        self.conn.execute(
            "UPDATE events SET location_lat = ?, location_lon = ? WHERE id = ?",
            params![lat, lon, event_id],
        )?;
        Ok(())
    }

    // ========================================================================
    // Registrations
    // ========================================================================

    pub fn add_registration(&self, event_id: &str, member_id: &str, kind: Option<&str>) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO event_registrations (event_id, member_id, registration_type)
            VALUES (?, ?, ?)
            ON CONFLICT(event_id, member_id) DO UPDATE SET registration_type = excluded.registration_type
            "#,
            params![event_id, member_id, kind],
        )?;
        Ok(())
    }

    pub fn is_registered(&self, event_id: &str, member_id: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM event_registrations WHERE event_id = ? AND member_id = ?",
            params![event_id, member_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn registered_member_ids(&self, event_id: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT member_id FROM event_registrations WHERE event_id = ? ORDER BY member_id",
        )?;
        let ids = stmt
            .query_map([event_id], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }

    // ========================================================================
    // Bulk import
    // ========================================================================

    /// Load a directory export in one transaction. Existing rows are updated.
    pub fn import_directory(&self, snapshot: &DirectorySnapshot) -> Result<ImportCounts> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let mut counts = ImportCounts::default();

        for member in &snapshot.members {
            self.upsert_member(member)?;
            counts.members += 1;
        }

        for entry in &snapshot.events {
            let event = entry.to_event()?;
            self.upsert_event(&event)?;
            counts.events += 1;
        }

        for reg in &snapshot.registrations {
            self.add_registration(&reg.event_id, &reg.member_id, reg.registration_type.as_deref())?;
            counts.registrations += 1;
        }

        for entry in &snapshot.embeddings {
            self.add_member_embedding(&entry.member_id, &entry.values, entry.source, entry.quality_score)?;
            counts.embeddings += 1;
        }

        tx.commit()?;
        info!(
            members = counts.members,
            events = counts.events,
            registrations = counts.registrations,
            embeddings = counts.embeddings,
            "Directory imported"
        );
        Ok(counts)
    }
}

/// JSON shape of a directory export.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectorySnapshot {
    #[serde(default)]
    pub members: Vec<Member>,
    #[serde(default)]
    pub events: Vec<EventEntry>,
    #[serde(default)]
    pub registrations: Vec<RegistrationEntry>,
    #[serde(default)]
    pub embeddings: Vec<EmbeddingEntry>,
}

impl DirectorySnapshot {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read directory file {}", path.display()))?;
        let snapshot = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse directory file {}", path.display()))?;
        Ok(snapshot)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEntry {
    pub id: String,
    pub name: String,
    /// `YYYY-MM-DD` or `YYYY-MM-DDTHH:MM:SS`.
    pub start: String,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub location_name: Option<String>,
    #[serde(default)]
    pub location_address: Option<String>,
    #[serde(default)]
    pub location_lat: Option<f64>,
    #[serde(default)]
    pub location_lon: Option<f64>,
    #[serde(default)]
    pub activity: Option<String>,
    #[serde(default)]
    pub is_public: bool,
}

fn parse_event_time(s: &str) -> Option<NaiveDateTime> {
    parse_timestamp(s).or_else(|| {
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
    })
}

impl EventEntry {
    fn to_event(&self) -> Result<Event> {
        let start = parse_event_time(&self.start)
            .with_context(|| format!("Bad start date '{}' for event {}", self.start, self.id))?;
        let end = match &self.end {
            Some(end) => Some(
                parse_event_time(end)
                    .with_context(|| format!("Bad end date '{}' for event {}", end, self.id))?,
            ),
            None => None,
        };
        Ok(Event {
            id: self.id.clone(),
            name: self.name.clone(),
            start,
            end,
            location_name: self.location_name.clone(),
            location_address: self.location_address.clone(),
            location_lat: self.location_lat,
            location_lon: self.location_lon,
            activity: self.activity.clone(),
            is_public: self.is_public,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationEntry {
    pub event_id: String,
    pub member_id: String,
    #[serde(default)]
    pub registration_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingEntry {
    pub member_id: String,
    pub values: Embedding,
    #[serde(default = "default_embedding_source")]
    pub source: EmbeddingSource,
    #[serde(default)]
    pub quality_score: Option<f32>,
}

fn default_embedding_source() -> EmbeddingSource {
    EmbeddingSource::Directory
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportCounts {
    pub members: usize,
    pub events: usize,
    pub registrations: usize,
    pub embeddings: usize,
}
