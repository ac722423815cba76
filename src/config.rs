use anyhow::{Context, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable that overrides the config file location.
pub const CONFIG_ENV: &str = "GALLERY_INTAKE_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub event_match: EventMatchConfig,

    #[serde(default)]
    pub faces: FaceMatchConfig,

    #[serde(default)]
    pub geocoding: GeocodingConfig,

    #[serde(default)]
    pub metadata_writer: MetadataWriterConfig,

    #[serde(default)]
    pub daemon: DaemonConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gallery-intake")
        .join("gallery.db")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root that rendition paths stored on photos are relative to.
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,

    #[serde(default = "default_display_size")]
    pub display_size: u32,

    #[serde(default = "default_thumbnail_size")]
    pub thumbnail_size: u32,

    #[serde(default = "default_jpeg_quality_original")]
    pub jpeg_quality_original: u8,

    #[serde(default = "default_jpeg_quality_display")]
    pub jpeg_quality_display: u8,

    #[serde(default = "default_jpeg_quality_thumb")]
    pub jpeg_quality_thumb: u8,
}

fn default_storage_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gallery-intake")
        .join("photos")
}

fn default_display_size() -> u32 {
    1200
}

fn default_thumbnail_size() -> u32 {
    300
}

fn default_jpeg_quality_original() -> u8 {
    95
}

fn default_jpeg_quality_display() -> u8 {
    85
}

fn default_jpeg_quality_thumb() -> u8 {
    80
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            display_size: default_display_size(),
            thumbnail_size: default_thumbnail_size(),
            jpeg_quality_original: default_jpeg_quality_original(),
            jpeg_quality_display: default_jpeg_quality_display(),
            jpeg_quality_thumb: default_jpeg_quality_thumb(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Completed items older than this are purged by `cleanup`.
    #[serde(default = "default_completed_retention_days")]
    pub completed_retention_days: u32,

    /// Items in `processing` longer than this are treated as abandoned.
    #[serde(default = "default_stale_processing_minutes")]
    pub stale_processing_minutes: u32,

    /// Number of worker threads, each with its own database connection.
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,
}

fn default_batch_size() -> usize {
    50
}

fn default_max_attempts() -> u32 {
    3
}

fn default_completed_retention_days() -> u32 {
    7
}

fn default_stale_processing_minutes() -> u32 {
    30
}

fn default_workers() -> usize {
    1
}

fn default_image_extensions() -> Vec<String> {
    [
        "jpg", "jpeg", "png", "heic", "heif", "tiff", "tif", "webp", "bmp", "nef", "nrw", "cr2",
        "cr3", "arw", "srf", "raf", "orf", "rw2", "pef", "dng", "raw",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            completed_retention_days: default_completed_retention_days(),
            stale_processing_minutes: default_stale_processing_minutes(),
            workers: default_workers(),
            image_extensions: default_image_extensions(),
        }
    }
}

/// Scoring parameters for matching a photo to an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMatchConfig {
    #[serde(default = "default_high_confidence_meters")]
    pub high_confidence_meters: f64,

    #[serde(default = "default_medium_confidence_meters")]
    pub medium_confidence_meters: f64,

    #[serde(default = "default_date_score")]
    pub date_score: f64,

    #[serde(default = "default_gps_high_score")]
    pub gps_high_score: f64,

    #[serde(default = "default_gps_medium_score")]
    pub gps_medium_score: f64,

    #[serde(default = "default_gps_low_score")]
    pub gps_low_score: f64,

    #[serde(default = "default_rsvp_boost")]
    pub rsvp_boost: f64,

    #[serde(default = "default_score_cap")]
    pub score_cap: f64,

    /// Best candidates scoring below this are not assigned.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    #[serde(default = "default_rsvp_fallback_confidence")]
    pub rsvp_fallback_confidence: f64,

    /// Days of slack on either side of an event's date range.
    #[serde(default = "default_window_days")]
    pub window_days: i64,
}

fn default_high_confidence_meters() -> f64 {
    500.0
}

fn default_medium_confidence_meters() -> f64 {
    2000.0
}

fn default_date_score() -> f64 {
    0.5
}

fn default_gps_high_score() -> f64 {
    0.95
}

fn default_gps_medium_score() -> f64 {
    0.75
}

fn default_gps_low_score() -> f64 {
    0.3
}

fn default_rsvp_boost() -> f64 {
    0.2
}

fn default_score_cap() -> f64 {
    0.95
}

fn default_min_confidence() -> f64 {
    0.3
}

fn default_rsvp_fallback_confidence() -> f64 {
    0.6
}

fn default_window_days() -> i64 {
    1
}

impl Default for EventMatchConfig {
    fn default() -> Self {
        Self {
            high_confidence_meters: default_high_confidence_meters(),
            medium_confidence_meters: default_medium_confidence_meters(),
            date_score: default_date_score(),
            gps_high_score: default_gps_high_score(),
            gps_medium_score: default_gps_medium_score(),
            gps_low_score: default_gps_low_score(),
            rsvp_boost: default_rsvp_boost(),
            score_cap: default_score_cap(),
            min_confidence: default_min_confidence(),
            rsvp_fallback_confidence: default_rsvp_fallback_confidence(),
            window_days: default_window_days(),
        }
    }
}

/// Distance thresholds for face identity matching. Lower distance = better match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceMatchConfig {
    #[serde(default = "default_face_high_confidence")]
    pub high_confidence: f32,

    #[serde(default = "default_face_medium_confidence")]
    pub medium_confidence: f32,

    /// Stricter high-confidence cutoff used for public events.
    #[serde(default = "default_public_event_threshold")]
    pub public_event_threshold: f32,

    /// Distance at which the display confidence reaches 0%.
    #[serde(default = "default_zero_confidence_distance")]
    pub zero_confidence_distance: f32,

    /// How far behind the overall best a registered attendee may be and still be promoted.
    #[serde(default = "default_rsvp_priority_window")]
    pub rsvp_priority_window: f32,

    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,

    /// Match only against registered attendees' embeddings when the event has any.
    #[serde(default = "default_narrow_to_registered")]
    pub narrow_to_registered: bool,

    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,

    /// Embedding extraction service; face matching is skipped when unset.
    #[serde(default)]
    pub embedding_endpoint: Option<String>,

    #[serde(default = "default_embedding_timeout_secs")]
    pub embedding_timeout_secs: u64,
}

fn default_face_high_confidence() -> f32 {
    0.4
}

fn default_face_medium_confidence() -> f32 {
    0.5
}

fn default_public_event_threshold() -> f32 {
    0.35
}

fn default_zero_confidence_distance() -> f32 {
    0.6
}

fn default_rsvp_priority_window() -> f32 {
    0.1
}

fn default_max_candidates() -> usize {
    5
}

fn default_narrow_to_registered() -> bool {
    true
}

fn default_embedding_dim() -> usize {
    128
}

fn default_embedding_timeout_secs() -> u64 {
    120
}

impl Default for FaceMatchConfig {
    fn default() -> Self {
        Self {
            high_confidence: default_face_high_confidence(),
            medium_confidence: default_face_medium_confidence(),
            public_event_threshold: default_public_event_threshold(),
            zero_confidence_distance: default_zero_confidence_distance(),
            rsvp_priority_window: default_rsvp_priority_window(),
            max_candidates: default_max_candidates(),
            narrow_to_registered: default_narrow_to_registered(),
            embedding_dim: default_embedding_dim(),
            embedding_endpoint: None,
            embedding_timeout_secs: default_embedding_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeocodingConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_geocoding_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_geocoding_timeout_secs")]
    pub timeout_secs: u64,

    /// Appended to addresses that do not already mention it, e.g. "Springfield, OR".
    #[serde(default)]
    pub region_hint: Option<String>,

    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

fn default_geocoding_endpoint() -> String {
    "https://nominatim.openstreetmap.org/search".to_string()
}

fn default_user_agent() -> String {
    format!("gallery-intake/{}", env!("CARGO_PKG_VERSION"))
}

fn default_geocoding_timeout_secs() -> u64 {
    10
}

fn default_cache_capacity() -> usize {
    1024
}

impl Default for GeocodingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_geocoding_endpoint(),
            user_agent: default_user_agent(),
            timeout_secs: default_geocoding_timeout_secs(),
            region_hint: None,
            cache_capacity: default_cache_capacity(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MetadataWriterMode {
    /// Embed keywords, people and event into the stored original with exiftool.
    Exiftool,
    /// Write a JSON summary next to the stored original.
    #[default]
    Sidecar,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetadataWriterConfig {
    #[serde(default)]
    pub mode: MetadataWriterMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Start hour for hours of operation (0-23).
    #[serde(default)]
    pub hours_start: Option<u8>,

    /// End hour for hours of operation (0-23).
    #[serde(default)]
    pub hours_end: Option<u8>,

    /// Run the failed-item retry sweep at the start of every cycle.
    #[serde(default)]
    pub auto_retry: bool,

    /// Cycles between completed-item cleanups.
    #[serde(default = "default_cleanup_every")]
    pub cleanup_every: u32,
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_cleanup_every() -> u32 {
    60
}

impl DaemonConfig {
    /// Whether `now` falls inside the configured hours of operation.
    /// Ranges may wrap midnight (22 to 6). No hours means always.
    pub fn within_hours(&self, now: NaiveTime) -> bool {
        let (start, end) = match (self.hours_start, self.hours_end) {
            (Some(s), Some(e)) => (s, e),
            _ => return true,
        };

        let start_time = NaiveTime::from_hms_opt(start as u32, 0, 0).unwrap_or(NaiveTime::MIN);
        let end_time = NaiveTime::from_hms_opt(end as u32, 0, 0).unwrap_or(NaiveTime::MIN);

        if start <= end {
            now >= start_time && now < end_time
        } else {
            now >= start_time || now < end_time
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            hours_start: None,
            hours_end: None,
            auto_retry: false,
            cleanup_every: default_cleanup_every(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return PathBuf::from(path);
        }

        Self::config_dir().join("config.toml")
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gallery-intake")
    }
}
