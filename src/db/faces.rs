//! Faces detected in catalogued photos, and their review state.

use anyhow::{bail, Result};
use rusqlite::{params, Connection, Row, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};

use super::directory::EmbeddingSource;
use super::{now_timestamp, Database};
use crate::faces::Embedding;
use crate::matching::Candidate;

/// Face region in pixel coordinates of the original image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub left: i32,
}

impl BoundingBox {
    pub fn new(top: i32, right: i32, bottom: i32, left: i32) -> Self {
        Self {
            top,
            right,
            bottom,
            left,
        }
    }

    pub fn width(&self) -> i32 {
        (self.right - self.left).max(0)
    }

    pub fn height(&self) -> i32 {
        (self.bottom - self.top).max(0)
    }
}

/// A face about to be written, with its matching result.
#[derive(Debug, Clone)]
pub struct NewFace {
    pub bbox: BoundingBox,
    pub embedding: Option<Embedding>,
    pub matched_member_id: Option<String>,
    pub match_confidence: Option<f32>,
    pub match_rank: Option<u32>,
    pub is_high_confidence: bool,
    pub candidates: Vec<Candidate>,
}

impl NewFace {
    pub fn unmatched(bbox: BoundingBox, embedding: Option<Embedding>) -> Self {
        Self {
            bbox,
            embedding,
            matched_member_id: None,
            match_confidence: None,
            match_rank: None,
            is_high_confidence: false,
            candidates: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FaceRecord {
    pub id: i64,
    pub photo_id: String,
    pub bbox: BoundingBox,
    pub embedding: Option<Embedding>,
    pub matched_member_id: Option<String>,
    pub match_confidence: Option<f32>,
    pub match_rank: Option<u32>,
    pub is_high_confidence: bool,
    pub candidates: Vec<Candidate>,
    pub confirmed: bool,
    pub confirmed_member_id: Option<String>,
    pub confirmed_by: Option<String>,
    pub confirmed_at: Option<String>,
    pub is_guest: bool,
}

impl FaceRecord {
    /// Member this face can be attributed to without further review:
    /// the confirmed identity, else a high-confidence match. Guests never are.
    pub fn trusted_member_id(&self) -> Option<&str> {
        if self.is_guest {
            return None;
        }
        if self.confirmed {
            return self.confirmed_member_id.as_deref();
        }
        if self.is_high_confidence {
            return self.matched_member_id.as_deref();
        }
        None
    }
}

const FACE_COLUMNS: &str = "id, photo_id, box_top, box_right, box_bottom, box_left, embedding, \
     matched_member_id, match_confidence, match_rank, is_high_confidence, candidates_json, \
     confirmed, confirmed_member_id, confirmed_by, confirmed_at, is_guest";

fn row_to_face(row: &Row) -> rusqlite::Result<FaceRecord> {
    let blob: Option<Vec<u8>> = row.get(6)?;
    let candidates_json: Option<String> = row.get(11)?;
    Ok(FaceRecord {
        id: row.get(0)?,
        photo_id: row.get(1)?,
        bbox: BoundingBox::new(row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?),
        embedding: blob.and_then(|b| Embedding::from_bytes(&b).ok()),
        matched_member_id: row.get(7)?,
        match_confidence: row.get(8)?,
        match_rank: row.get(9)?,
        is_high_confidence: row.get(10)?,
        candidates: candidates_json
            .and_then(|json| serde_json::from_str(&json).ok())
            .unwrap_or_default(),
        confirmed: row.get(12)?,
        confirmed_member_id: row.get(13)?,
        confirmed_by: row.get(14)?,
        confirmed_at: row.get(15)?,
        is_guest: row.get(16)?,
    })
}

pub(crate) fn insert_face(conn: &Connection, photo_id: &str, face: &NewFace) -> rusqlite::Result<i64> {
    let candidates_json = if face.candidates.is_empty() {
        None
    } else {
        serde_json::to_string(&face.candidates).ok()
    };

    conn.execute(
        r#"
        INSERT INTO photo_faces (
            photo_id, box_top, box_right, box_bottom, box_left, embedding, embedding_dim,
            matched_member_id, match_confidence, match_rank, is_high_confidence, candidates_json
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            photo_id,
            face.bbox.top,
            face.bbox.right,
            face.bbox.bottom,
            face.bbox.left,
            face.embedding.as_ref().map(|e| e.to_bytes()),
            face.embedding.as_ref().map(|e| e.dim() as i64),
            face.matched_member_id,
            face.match_confidence,
            face.match_rank,
            face.is_high_confidence,
            candidates_json,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

impl Database {
    pub fn faces_for_photo(&self, photo_id: &str) -> Result<Vec<FaceRecord>> {
        let sql = format!(
            "SELECT {} FROM photo_faces WHERE photo_id = ? ORDER BY id",
            FACE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let faces = stmt
            .query_map([photo_id], row_to_face)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(faces)
    }

    pub fn get_face(&self, face_id: i64) -> Result<Option<FaceRecord>> {
        let sql = format!("SELECT {} FROM photo_faces WHERE id = ?", FACE_COLUMNS);
        let result = self.conn.query_row(&sql, [face_id], row_to_face);

        match result {
            Ok(face) => Ok(Some(face)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Record a human decision about who a face is. `member_id = None` with
    /// `is_guest = true` marks a non-member. Returns false if the face does not exist.
    pub fn confirm_face_identity(
        &self,
        face_id: i64,
        member_id: Option<&str>,
        confirmed_by: &str,
        is_guest: bool,
    ) -> Result<bool> {
        let updated = self.conn.execute(
            r#"
            UPDATE photo_faces
            SET confirmed = 1, confirmed_member_id = ?, confirmed_by = ?, confirmed_at = ?,
                is_guest = ?
            WHERE id = ?
            "#,
            params![member_id, confirmed_by, now_timestamp(), is_guest, face_id],
        )?;
        Ok(updated == 1)
    }

    /// Feed a confirmed face back into the member's reference embeddings.
    pub fn save_confirmed_embedding(&self, face_id: i64, member_id: &str) -> Result<i64> {
        let face = match self.get_face(face_id)? {
            Some(face) => face,
            None => bail!("Face {} not found", face_id),
        };
        let embedding = match face.embedding {
            Some(embedding) => embedding,
            None => bail!("Face {} has no embedding", face_id),
        };

        self.add_member_embedding(member_id, &embedding, EmbeddingSource::Confirmed, None)
    }

    /// Replace the unconfirmed faces of a photo, keeping reviewed ones.
    /// Returns the number of faces inserted.
    pub fn replace_unconfirmed_faces(&self, photo_id: &str, faces: &[NewFace]) -> Result<usize> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM photo_faces WHERE photo_id = ? AND confirmed = 0",
            [photo_id],
        )?;
        for face in faces {
            insert_face(&tx, photo_id, face)?;
        }
        tx.commit()?;
        Ok(faces.len())
    }
}
