pub const SCHEMA: &str = r#"
-- Members: known people, maintained by the directory sync
CREATE TABLE IF NOT EXISTS members (
    id TEXT PRIMARY KEY,
    email TEXT,
    display_name TEXT NOT NULL,
    face_recognition_opt_out INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_members_email ON members(email COLLATE NOCASE);

-- Reference face embeddings per member
CREATE TABLE IF NOT EXISTS member_embeddings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    member_id TEXT NOT NULL,
    embedding BLOB NOT NULL,       -- little-endian f32 array
    embedding_dim INTEGER NOT NULL,
    source TEXT NOT NULL,          -- 'directory', 'self_tag', 'confirmed'
    quality_score REAL,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (member_id) REFERENCES members(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_member_embeddings_member ON member_embeddings(member_id);

-- Events, maintained by the directory sync
CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    start_date TEXT NOT NULL,
    end_date TEXT,
    location_name TEXT,
    location_address TEXT,
    location_lat REAL,             -- filled lazily by geocoding
    location_lon REAL,
    activity TEXT,
    is_public INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_events_start ON events(start_date);

CREATE TABLE IF NOT EXISTS event_registrations (
    event_id TEXT NOT NULL,
    member_id TEXT NOT NULL,
    registration_type TEXT,
    PRIMARY KEY (event_id, member_id),
    FOREIGN KEY (event_id) REFERENCES events(id) ON DELETE CASCADE,
    FOREIGN KEY (member_id) REFERENCES members(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_event_registrations_member ON event_registrations(member_id);

-- Catalogued photos
CREATE TABLE IF NOT EXISTS photos (
    id TEXT PRIMARY KEY,
    content_hash TEXT NOT NULL,    -- SHA-256 of file content
    original_filename TEXT,
    submitter_member_id TEXT,
    submitter_email TEXT,
    submitted_via TEXT,
    submitted_at TEXT,

    taken_at TEXT,
    gps_lat REAL,
    gps_lon REAL,
    camera_make TEXT,
    camera_model TEXT,

    event_id TEXT,
    event_match_confidence REAL,
    event_match_method TEXT,

    status TEXT NOT NULL DEFAULT 'awaiting_review',
    reviewed_by TEXT,
    reviewed_at TEXT,

    original_path TEXT NOT NULL,
    display_path TEXT NOT NULL,
    thumb_path TEXT NOT NULL,
    width INTEGER,
    height INTEGER,
    file_size INTEGER,

    processed_at TEXT NOT NULL,
    FOREIGN KEY (event_id) REFERENCES events(id) ON DELETE SET NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_photos_content_hash ON photos(content_hash);
CREATE INDEX IF NOT EXISTS idx_photos_status ON photos(status);
CREATE INDEX IF NOT EXISTS idx_photos_event ON photos(event_id);
CREATE INDEX IF NOT EXISTS idx_photos_taken_at ON photos(taken_at);

-- Faces detected in catalogued photos
CREATE TABLE IF NOT EXISTS photo_faces (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    photo_id TEXT NOT NULL,
    box_top INTEGER NOT NULL,
    box_right INTEGER NOT NULL,
    box_bottom INTEGER NOT NULL,
    box_left INTEGER NOT NULL,
    embedding BLOB,
    embedding_dim INTEGER,

    matched_member_id TEXT,
    match_confidence REAL,
    match_rank INTEGER,
    is_high_confidence INTEGER NOT NULL DEFAULT 0,
    candidates_json TEXT,          -- ranked candidates, best first

    confirmed INTEGER NOT NULL DEFAULT 0,
    confirmed_member_id TEXT,
    confirmed_by TEXT,
    confirmed_at TEXT,
    is_guest INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (photo_id) REFERENCES photos(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_photo_faces_photo ON photo_faces(photo_id);
CREATE INDEX IF NOT EXISTS idx_photo_faces_member ON photo_faces(matched_member_id);

CREATE TABLE IF NOT EXISTS photo_tags (
    photo_id TEXT NOT NULL,
    tag TEXT NOT NULL,
    tag_type TEXT NOT NULL,
    auto_generated INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (photo_id, tag),
    FOREIGN KEY (photo_id) REFERENCES photos(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_photo_tags_tag ON photo_tags(tag);

-- Submissions waiting to be catalogued
CREATE TABLE IF NOT EXISTS processing_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    photo_path TEXT NOT NULL,
    original_filename TEXT,
    submitter_member_id TEXT,
    submitter_email TEXT,
    source TEXT NOT NULL,          -- 'email', 'upload', 'sync', 'bot'
    status TEXT NOT NULL DEFAULT 'pending',
    priority INTEGER NOT NULL DEFAULT 0,
    attempts INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    photo_id TEXT,                 -- set when the item produced a photo
    outcome_note TEXT,             -- e.g. duplicate rejection reason
    submitted_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_processing_queue_status ON processing_queue(status);
CREATE INDEX IF NOT EXISTS idx_processing_queue_order
    ON processing_queue(status, priority DESC, submitted_at ASC);
"#;

/// Additive column migrations; failures (column already exists) are ignored.
pub const MIGRATIONS: &[&str] = &[
    "ALTER TABLE photo_faces ADD COLUMN is_high_confidence INTEGER NOT NULL DEFAULT 0",
    "ALTER TABLE processing_queue ADD COLUMN outcome_note TEXT",
];
