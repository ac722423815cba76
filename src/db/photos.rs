//! Catalogued photos and their tags.

use anyhow::Result;
use chrono::NaiveDateTime;
use rusqlite::{params, params_from_iter, ErrorCode, Row, Transaction, TransactionBehavior};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use super::faces::{insert_face, NewFace};
use super::{format_timestamp, now_timestamp, parse_timestamp, Database};
use crate::error::IntakeError;
use crate::tags::{Tag, TagKind};

/// Review / visibility status of a catalogued photo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PhotoStatus {
    #[default]
    AwaitingReview,
    Restricted,
    Public,
    Rejected,
}

impl PhotoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhotoStatus::AwaitingReview => "awaiting_review",
            PhotoStatus::Restricted => "restricted",
            PhotoStatus::Public => "public",
            PhotoStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for PhotoStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "awaiting_review" => Ok(PhotoStatus::AwaitingReview),
            "restricted" => Ok(PhotoStatus::Restricted),
            "public" => Ok(PhotoStatus::Public),
            "rejected" => Ok(PhotoStatus::Rejected),
            other => Err(format!("unknown photo status '{}'", other)),
        }
    }
}

impl fmt::Display for PhotoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything known about a photo at catalogue time.
#[derive(Debug, Clone, Default)]
pub struct NewPhoto {
    pub id: String,
    pub content_hash: String,
    pub original_filename: Option<String>,
    pub submitter_member_id: Option<String>,
    pub submitter_email: Option<String>,
    pub submitted_via: Option<String>,
    pub submitted_at: Option<String>,
    pub taken_at: Option<NaiveDateTime>,
    pub gps_lat: Option<f64>,
    pub gps_lon: Option<f64>,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub event_id: Option<String>,
    pub event_match_confidence: Option<f64>,
    pub event_match_method: Option<String>,
    pub original_path: String,
    pub display_path: String,
    pub thumb_path: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub file_size: Option<u64>,
}

/// A photo together with its faces and tags, written as one unit.
#[derive(Debug, Clone, Default)]
pub struct CataloguedPhoto {
    pub photo: NewPhoto,
    pub faces: Vec<NewFace>,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone)]
pub struct Photo {
    pub id: String,
    pub content_hash: String,
    pub original_filename: Option<String>,
    pub submitter_member_id: Option<String>,
    pub submitter_email: Option<String>,
    pub submitted_via: Option<String>,
    pub submitted_at: Option<String>,
    pub taken_at: Option<NaiveDateTime>,
    pub gps_lat: Option<f64>,
    pub gps_lon: Option<f64>,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub event_id: Option<String>,
    pub event_match_confidence: Option<f64>,
    pub event_match_method: Option<String>,
    pub status: PhotoStatus,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<String>,
    pub original_path: String,
    pub display_path: String,
    pub thumb_path: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub file_size: Option<u64>,
    pub processed_at: String,
}

const PHOTO_COLUMNS: &str = "id, content_hash, original_filename, submitter_member_id, \
     submitter_email, submitted_via, submitted_at, taken_at, gps_lat, gps_lon, camera_make, \
     camera_model, event_id, event_match_confidence, event_match_method, status, reviewed_by, \
     reviewed_at, original_path, display_path, thumb_path, width, height, file_size, processed_at";

fn row_to_photo(row: &Row) -> rusqlite::Result<Photo> {
    let taken_at: Option<String> = row.get(7)?;
    let status: String = row.get(15)?;
    let file_size: Option<i64> = row.get(23)?;
    Ok(Photo {
        id: row.get(0)?,
        content_hash: row.get(1)?,
        original_filename: row.get(2)?,
        submitter_member_id: row.get(3)?,
        submitter_email: row.get(4)?,
        submitted_via: row.get(5)?,
        submitted_at: row.get(6)?,
        taken_at: taken_at.as_deref().and_then(parse_timestamp),
        gps_lat: row.get(8)?,
        gps_lon: row.get(9)?,
        camera_make: row.get(10)?,
        camera_model: row.get(11)?,
        event_id: row.get(12)?,
        event_match_confidence: row.get(13)?,
        event_match_method: row.get(14)?,
        status: status.parse().unwrap_or_default(),
        reviewed_by: row.get(16)?,
        reviewed_at: row.get(17)?,
        original_path: row.get(18)?,
        display_path: row.get(19)?,
        thumb_path: row.get(20)?,
        width: row.get(21)?,
        height: row.get(22)?,
        file_size: file_size.map(|s| s as u64),
        processed_at: row.get(24)?,
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::ConstraintViolation
                && e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn insert_tag(conn: &rusqlite::Connection, photo_id: &str, tag: &Tag) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT OR IGNORE INTO photo_tags (photo_id, tag, tag_type, auto_generated) VALUES (?, ?, ?, ?)",
        params![photo_id, tag.name, tag.kind.as_str(), tag.auto_generated],
    )
}

impl Database {
    /// Write a photo, its faces and its tags in one transaction.
    ///
    /// A second photo with the same content hash is rejected by the unique
    /// index and reported as [`IntakeError::DuplicatePhoto`] naming the
    /// photo that won.
    pub fn insert_catalogued(&self, record: &CataloguedPhoto) -> crate::error::Result<()> {
        let photo = &record.photo;
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;

        let inserted = tx.execute(
            r#"
            INSERT INTO photos (
                id, content_hash, original_filename, submitter_member_id, submitter_email,
                submitted_via, submitted_at, taken_at, gps_lat, gps_lon, camera_make,
                camera_model, event_id, event_match_confidence, event_match_method,
                status, original_path, display_path, thumb_path, width, height,
                file_size, processed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                photo.id,
                photo.content_hash,
                photo.original_filename,
                photo.submitter_member_id,
                photo.submitter_email,
                photo.submitted_via,
                photo.submitted_at,
                photo.taken_at.as_ref().map(format_timestamp),
                photo.gps_lat,
                photo.gps_lon,
                photo.camera_make,
                photo.camera_model,
                photo.event_id,
                photo.event_match_confidence,
                photo.event_match_method,
                PhotoStatus::AwaitingReview.as_str(),
                photo.original_path,
                photo.display_path,
                photo.thumb_path,
                photo.width,
                photo.height,
                photo.file_size.map(|s| s as i64),
                now_timestamp(),
            ],
        );

        if let Err(e) = inserted {
            if is_unique_violation(&e) {
                drop(tx);
                if let Some(existing) = self.find_by_fingerprint(&photo.content_hash)? {
                    return Err(IntakeError::DuplicatePhoto {
                        fingerprint: photo.content_hash.clone(),
                        existing_photo_id: existing,
                    });
                }
            }
            return Err(e.into());
        }

        for face in &record.faces {
            insert_face(&tx, &photo.id, face)?;
        }
        for tag in &record.tags {
            insert_tag(&tx, &photo.id, tag)?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Photo id holding the given content hash, if any.
    pub fn find_by_fingerprint(&self, content_hash: &str) -> crate::error::Result<Option<String>> {
        let result = self.conn.query_row(
            "SELECT id FROM photos WHERE content_hash = ?",
            [content_hash],
            |row| row.get(0),
        );

        match result {
            Ok(id) => Ok(Some(id)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Map of content hash -> photo id for the hashes already catalogued.
    pub fn find_by_fingerprints(&self, hashes: &[String]) -> Result<HashMap<String, String>> {
        let mut found = HashMap::new();

        // Stay well under SQLite's bound-parameter limit.
        for chunk in hashes.chunks(500) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT content_hash, id FROM photos WHERE content_hash IN ({})",
                placeholders
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            found.extend(rows.filter_map(|r| r.ok()));
        }

        Ok(found)
    }

    pub fn all_fingerprints(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT content_hash FROM photos WHERE content_hash != ''")?;
        let hashes = stmt
            .query_map([], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(hashes)
    }

    pub fn set_photo_fingerprint(&self, photo_id: &str, content_hash: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE photos SET content_hash = ? WHERE id = ?",
            params![content_hash, photo_id],
        )?;
        Ok(())
    }

    pub fn get_photo(&self, id: &str) -> Result<Option<Photo>> {
        let sql = format!("SELECT {} FROM photos WHERE id = ?", PHOTO_COLUMNS);
        let result = self.conn.query_row(&sql, [id], row_to_photo);

        match result {
            Ok(photo) => Ok(Some(photo)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Photos ordered by capture time, optionally filtered by status.
    pub fn list_photos(&self, status: Option<PhotoStatus>) -> Result<Vec<Photo>> {
        let photos = match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {} FROM photos WHERE status = ? ORDER BY taken_at, id",
                    PHOTO_COLUMNS
                );
                let mut stmt = self.conn.prepare(&sql)?;
                let rows = stmt.query_map([status.as_str()], row_to_photo)?;
                rows.filter_map(|r| r.ok()).collect()
            }
            None => {
                let sql = format!("SELECT {} FROM photos ORDER BY taken_at, id", PHOTO_COLUMNS);
                let mut stmt = self.conn.prepare(&sql)?;
                let rows = stmt.query_map([], row_to_photo)?;
                rows.filter_map(|r| r.ok()).collect()
            }
        };
        Ok(photos)
    }

    pub fn photo_count(&self) -> Result<i64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM photos", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Set the review status. Returns false if the photo does not exist.
    pub fn update_photo_status(
        &self,
        photo_id: &str,
        status: PhotoStatus,
        reviewed_by: Option<&str>,
    ) -> Result<bool> {
        let updated = self.conn.execute(
            "UPDATE photos SET status = ?, reviewed_by = ?, reviewed_at = ? WHERE id = ?",
            params![status.as_str(), reviewed_by, now_timestamp(), photo_id],
        )?;
        Ok(updated == 1)
    }

    /// Add tags, ignoring ones the photo already carries. Returns the number added.
    pub fn add_photo_tags(&self, photo_id: &str, tags: &[Tag]) -> Result<usize> {
        let mut added = 0;
        for tag in tags {
            added += insert_tag(&self.conn, photo_id, tag)?;
        }
        Ok(added)
    }

    /// Swap the photo's generated person tags for `tags` in one transaction.
    /// Manually added tags are kept. Returns the number inserted.
    pub fn replace_auto_person_tags(&self, photo_id: &str, tags: &[Tag]) -> Result<usize> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM photo_tags WHERE photo_id = ? AND tag_type = ? AND auto_generated = 1",
            params![photo_id, TagKind::Person.as_str()],
        )?;
        let mut added = 0;
        for tag in tags {
            added += insert_tag(&tx, photo_id, tag)?;
        }
        tx.commit()?;
        Ok(added)
    }

    pub fn photo_tags(&self, photo_id: &str) -> Result<Vec<Tag>> {
        let mut stmt = self.conn.prepare(
            "SELECT tag, tag_type, auto_generated FROM photo_tags WHERE photo_id = ? ORDER BY tag",
        )?;
        let tags = stmt
            .query_map([photo_id], |row| {
                let kind: String = row.get(1)?;
                Ok(Tag {
                    name: row.get(0)?,
                    kind: kind.parse().unwrap_or(TagKind::Manual),
                    auto_generated: row.get(2)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(tags)
    }
}
