//! Content fingerprints for duplicate detection.
//!
//! A fingerprint is the hex SHA-256 of the full file content, so renamed or
//! re-sent copies of the same bytes are caught regardless of filename.

use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::error::{IntakeError, Result};

/// Hex SHA-256 of the file's content, streamed in 8 KiB chunks.
pub fn compute_fingerprint(path: &Path) -> Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();

    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Outcome of checking one file against the catalogue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintCheck {
    /// `None` when the file could not be read.
    pub fingerprint: Option<String>,
    pub existing_photo_id: Option<String>,
}

impl FingerprintCheck {
    pub fn is_duplicate(&self) -> bool {
        self.existing_photo_id.is_some()
    }

    /// The fingerprint, or `MissingFingerprint` for an unreadable file.
    pub fn require_fingerprint(&self, path: &Path) -> Result<&str> {
        self.fingerprint
            .as_deref()
            .ok_or_else(|| IntakeError::MissingFingerprint {
                path: path.display().to_string(),
            })
    }
}

/// Read-only duplicate checks against the photo catalogue. Recording
/// happens when the photo row is written; the unique index on
/// `photos.content_hash` is the final arbiter.
pub struct FingerprintStore<'a> {
    db: &'a Database,
}

impl<'a> FingerprintStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Unreadable files are reported as not duplicate so the read error
    /// surfaces later in the pipeline instead of the submission vanishing.
    pub fn check(&self, path: &Path) -> Result<FingerprintCheck> {
        let fingerprint = match compute_fingerprint(path) {
            Ok(fp) => fp,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Could not fingerprint file");
                return Ok(FingerprintCheck {
                    fingerprint: None,
                    existing_photo_id: None,
                });
            }
        };

        let existing_photo_id = self.db.find_by_fingerprint(&fingerprint)?;
        if let Some(ref existing) = existing_photo_id {
            info!(path = %path.display(), photo_id = %existing, "Duplicate content detected");
        }

        Ok(FingerprintCheck {
            fingerprint: Some(fingerprint),
            existing_photo_id,
        })
    }

    /// Hash many files in parallel and look them up in one pass. Returns
    /// only the paths whose content is already catalogued, mapped to the
    /// existing photo id.
    pub fn check_batch(&self, paths: &[PathBuf]) -> anyhow::Result<HashMap<PathBuf, String>> {
        let hashed: Vec<(PathBuf, String)> = paths
            .par_iter()
            .filter_map(|path| match compute_fingerprint(path) {
                Ok(fp) => Some((path.clone(), fp)),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Could not fingerprint file");
                    None
                }
            })
            .collect();

        if hashed.is_empty() {
            return Ok(HashMap::new());
        }

        let mut unique: Vec<String> = hashed.iter().map(|(_, fp)| fp.clone()).collect();
        unique.sort();
        unique.dedup();
        let known = self.db.find_by_fingerprints(&unique)?;

        let duplicates: HashMap<PathBuf, String> = hashed
            .into_iter()
            .filter_map(|(path, fp)| known.get(&fp).map(|id| (path, id.clone())))
            .collect();

        debug!(checked = paths.len(), duplicates = duplicates.len(), "Batch fingerprint check");
        Ok(duplicates)
    }

    pub fn record(&self, fingerprint: &str, photo_id: &str) -> anyhow::Result<()> {
        self.db.set_photo_fingerprint(photo_id, fingerprint)
    }

    /// Stored fingerprint of a photo, computing and storing it from the
    /// original rendition if the row has none.
    pub fn fingerprint_for_photo(&self, photo_id: &str, storage_root: &Path) -> anyhow::Result<Option<String>> {
        let photo = match self.db.get_photo(photo_id)? {
            Some(photo) => photo,
            None => return Ok(None),
        };

        if !photo.content_hash.is_empty() {
            return Ok(Some(photo.content_hash));
        }

        let path = storage_root.join(&photo.original_path);
        match compute_fingerprint(&path) {
            Ok(fp) => {
                self.record(&fp, photo_id)?;
                Ok(Some(fp))
            }
            Err(e) => {
                warn!(photo_id, error = %e, "Could not backfill fingerprint");
                Ok(None)
            }
        }
    }
}

/// In-memory set of known fingerprints for bulk imports, where one query
/// per file would dominate.
#[derive(Debug, Default)]
pub struct KnownFingerprints {
    hashes: HashSet<String>,
}

impl KnownFingerprints {
    pub fn load(db: &Database) -> anyhow::Result<Self> {
        let hashes: HashSet<String> = db.all_fingerprints()?.into_iter().collect();
        info!(count = hashes.len(), "Loaded existing photo fingerprints");
        Ok(Self { hashes })
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Returns whether the file is a duplicate and its fingerprint. An
    /// unreadable file is `(false, None)`.
    pub fn is_duplicate(&self, path: &Path) -> (bool, Option<String>) {
        match compute_fingerprint(path) {
            Ok(fp) => (self.hashes.contains(&fp), Some(fp)),
            Err(_) => (false, None),
        }
    }

    /// Remember a fingerprint after a successful import.
    pub fn add(&mut self, fingerprint: &str) {
        if !fingerprint.is_empty() {
            self.hashes.insert(fingerprint.to_string());
        }
    }
}
