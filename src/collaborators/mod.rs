//! Services the pipeline calls out to.
//!
//! Each concern is a `Send + Sync` trait so workers can share one set of
//! implementations. The local implementations here cover a single-host
//! deployment: EXIF parsing, JPEG renditions on disk, an HTTP embedding
//! service, Nominatim geocoding and exiftool or sidecar metadata export.

pub mod exif_metadata;
pub mod face_service;
pub mod geocoder;
pub mod metadata_writer;
pub mod renditions;

use anyhow::Result;
use chrono::NaiveDateTime;
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::config::{Config, MetadataWriterMode};
use crate::db::BoundingBox;
use crate::faces::Embedding;
use crate::matching::GeoPoint;

pub use exif_metadata::ExifMetadataExtractor;
pub use face_service::{DisabledFaceExtractor, HttpFaceExtractor};
pub use geocoder::{DisabledGeocoder, NominatimGeocoder};
pub use metadata_writer::{DisabledMetadataWriter, ExiftoolWriter, SidecarWriter};
pub use renditions::LocalRenditions;

/// Metadata read from an image. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhotoMetadata {
    pub taken_at: Option<NaiveDateTime>,
    pub gps: Option<GeoPoint>,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

pub trait MetadataExtractor: Send + Sync {
    fn extract(&self, path: &Path) -> Result<PhotoMetadata>;
}

/// Storage-relative locations of a stored photo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Renditions {
    pub original_path: String,
    pub display_path: String,
    pub thumb_path: String,
    pub width: u32,
    pub height: u32,
    pub file_size: u64,
}

pub trait RenditionService: Send + Sync {
    /// Store the canonical original and derived renditions for a photo.
    fn create(&self, source: &Path, photo_id: &str, taken_at: Option<NaiveDateTime>) -> Result<Renditions>;

    /// Delete stored renditions, e.g. after losing a duplicate race.
    fn remove(&self, renditions: &Renditions) -> Result<()>;

    /// Absolute path of a storage-relative path.
    fn resolve(&self, relative: &str) -> PathBuf;
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
}

pub trait FaceExtractor: Send + Sync {
    /// Zero faces is a normal result.
    fn extract_faces(&self, path: &Path) -> Result<Vec<DetectedFace>>;

    fn name(&self) -> &'static str;
}

pub trait Geocoder: Send + Sync {
    /// `Ok(None)` when the address is unknown to the service.
    fn geocode(&self, address: &str) -> Result<Option<GeoPoint>>;

    fn name(&self) -> &'static str;
}

/// Human-readable summary written into or next to a stored original.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PhotoSummary {
    pub photo_id: String,
    pub taken_at: Option<NaiveDateTime>,
    pub event_name: Option<String>,
    pub event_date: Option<NaiveDateTime>,
    pub location: Option<String>,
    pub people: Vec<String>,
    pub keywords: Vec<String>,
    pub submitted_by: Option<String>,
    pub submitter_email: Option<String>,
    pub source: Option<String>,
}

impl PhotoSummary {
    pub fn description(&self) -> String {
        let mut parts = Vec::new();
        if let Some(ref event) = self.event_name {
            parts.push(event.clone());
        }
        if let Some(ref location) = self.location {
            parts.push(location.clone());
        }
        if !self.people.is_empty() {
            parts.push(format!("With {}", self.people.join(", ")));
        }
        parts.join(" - ")
    }
}

pub trait MetadataWriter: Send + Sync {
    fn write(&self, asset: &Path, summary: &PhotoSummary) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// The full set of services used by the pipeline.
pub struct Collaborators {
    pub metadata: Box<dyn MetadataExtractor>,
    pub renditions: Box<dyn RenditionService>,
    pub faces: Box<dyn FaceExtractor>,
    pub geocoder: Box<dyn Geocoder>,
    pub writer: Box<dyn MetadataWriter>,
}

impl Collaborators {
    pub fn from_config(config: &Config) -> Self {
        let faces: Box<dyn FaceExtractor> = match config.faces.embedding_endpoint {
            Some(ref endpoint) => Box::new(
                HttpFaceExtractor::new(endpoint, config.faces.embedding_timeout_secs)
                    .with_expected_dim(config.faces.embedding_dim),
            ),
            None => Box::new(DisabledFaceExtractor),
        };

        let geocoder: Box<dyn Geocoder> = if config.geocoding.enabled {
            Box::new(NominatimGeocoder::new(&config.geocoding))
        } else {
            Box::new(DisabledGeocoder)
        };

        let writer: Box<dyn MetadataWriter> = match config.metadata_writer.mode {
            MetadataWriterMode::Exiftool => Box::new(ExiftoolWriter),
            MetadataWriterMode::Sidecar => Box::new(SidecarWriter),
            MetadataWriterMode::Disabled => Box::new(DisabledMetadataWriter),
        };

        Self {
            metadata: Box::new(ExifMetadataExtractor),
            renditions: Box::new(LocalRenditions::new(&config.storage)),
            faces,
            geocoder,
            writer,
        }
    }
}
