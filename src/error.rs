//! Error types for the intake core.
//!
//! Application edges (CLI, daemon, collaborator plumbing) use `anyhow`;
//! the types here name the failures the pipeline has to tell apart.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IntakeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Could not fingerprint {path}")]
    MissingFingerprint { path: String },

    /// A second photo with an already catalogued fingerprint was about to be
    /// inserted. Raised by the UNIQUE constraint on `photos.content_hash`.
    #[error("Photo with fingerprint {fingerprint} already catalogued as {existing_photo_id}")]
    DuplicatePhoto {
        fingerprint: String,
        existing_photo_id: String,
    },

    #[error("Invalid embedding: {0}")]
    InvalidEmbedding(String),

    #[error("Queue item {0} not found")]
    QueueItemNotFound(i64),

    #[error("{service} failed: {message}")]
    Collaborator { service: &'static str, message: String },
}

impl IntakeError {
    pub fn collaborator(service: &'static str, err: impl std::fmt::Display) -> Self {
        IntakeError::Collaborator {
            service,
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, IntakeError>;
