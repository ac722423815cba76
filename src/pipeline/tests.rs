use super::*;
use crate::collaborators::{
    DetectedFace, DisabledGeocoder, FaceExtractor, MetadataExtractor, MetadataWriter, RenditionService,
};
use crate::db::{BoundingBox, EmbeddingSource, Member, NewQueueItem, QueueState, SubmissionSource};
use crate::faces::Embedding;
use crate::matching::GeoPoint;
use chrono::{NaiveDate, NaiveDateTime};
use std::path::PathBuf;
use std::sync::Mutex;

struct FixedMetadata(PhotoMetadata);

impl MetadataExtractor for FixedMetadata {
    fn extract(&self, _path: &Path) -> Result<PhotoMetadata> {
        Ok(self.0.clone())
    }
}

/// Copies the upload to all three locations instead of decoding it.
struct CopyRenditions {
    root: PathBuf,
    fail: bool,
}

impl RenditionService for CopyRenditions {
    fn create(&self, source: &Path, photo_id: &str, _taken_at: Option<NaiveDateTime>) -> Result<Renditions> {
        if self.fail {
            bail!("decoder exploded");
        }
        let renditions = Renditions {
            original_path: format!("originals/{}.jpg", photo_id),
            display_path: format!("display/{}.jpg", photo_id),
            thumb_path: format!("thumbs/{}.jpg", photo_id),
            width: 640,
            height: 480,
            file_size: fs::metadata(source)?.len(),
        };
        for relative in [&renditions.original_path, &renditions.display_path, &renditions.thumb_path] {
            let target = self.resolve(relative);
            fs::create_dir_all(target.parent().unwrap())?;
            fs::copy(source, target)?;
        }
        Ok(renditions)
    }

    fn remove(&self, renditions: &Renditions) -> Result<()> {
        for relative in [&renditions.original_path, &renditions.display_path, &renditions.thumb_path] {
            let _ = fs::remove_file(self.resolve(relative));
        }
        Ok(())
    }

    fn resolve(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }
}

struct FixedFaces {
    faces: Vec<DetectedFace>,
    fail: bool,
}

impl FixedFaces {
    fn new(faces: Vec<DetectedFace>) -> Self {
        Self { faces, fail: false }
    }
}

impl FaceExtractor for FixedFaces {
    fn extract_faces(&self, _path: &Path) -> Result<Vec<DetectedFace>> {
        if self.fail {
            bail!("embedding service unreachable");
        }
        Ok(self.faces.clone())
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}

#[derive(Clone, Default)]
struct RecordingWriter {
    written: Arc<Mutex<Vec<PhotoSummary>>>,
    fail: bool,
}

impl MetadataWriter for RecordingWriter {
    fn write(&self, _asset: &Path, summary: &PhotoSummary) -> Result<()> {
        if self.fail {
            bail!("exiftool not installed");
        }
        self.written.lock().unwrap().push(summary.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    incoming: PathBuf,
    store: PathBuf,
    db: Database,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let incoming = dir.path().join("incoming");
        let store = dir.path().join("store");
        fs::create_dir_all(&incoming).unwrap();
        Self {
            incoming,
            store,
            db: Database::open_in_memory().unwrap(),
            _dir: dir,
        }
    }

    fn upload(&self, name: &str, content: &[u8]) -> PathBuf {
        let path = self.incoming.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    fn enqueue(&self, path: &Path, submitter: Option<&str>) -> i64 {
        let mut item = NewQueueItem::new(path, SubmissionSource::Upload);
        item.original_filename = path.file_name().map(|n| n.to_string_lossy().to_string());
        item.submitter_member_id = submitter.map(str::to_string);
        self.db.enqueue(&item).unwrap()
    }

    fn pipeline(&self, metadata: PhotoMetadata, faces: FixedFaces, writer: RecordingWriter) -> Pipeline {
        self.pipeline_with(metadata, faces, writer, false)
    }

    fn pipeline_with(
        &self,
        metadata: PhotoMetadata,
        faces: FixedFaces,
        writer: RecordingWriter,
        fail_renditions: bool,
    ) -> Pipeline {
        let services = Collaborators {
            metadata: Box::new(FixedMetadata(metadata)),
            renditions: Box::new(CopyRenditions {
                root: self.store.clone(),
                fail: fail_renditions,
            }),
            faces: Box::new(faces),
            geocoder: Box::new(DisabledGeocoder),
            writer: Box::new(writer),
        };
        Pipeline::new(Config::default(), services)
    }
}

fn taken() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 9, 15)
        .unwrap()
        .and_hms_opt(14, 30, 0)
        .unwrap()
}

fn face(values: Vec<f32>) -> DetectedFace {
    DetectedFace {
        bbox: BoundingBox::new(10, 90, 100, 20),
        embedding: Embedding::new(values).unwrap(),
    }
}

/// Event at a known point, Ada registered, Grace with a reference embedding.
fn seed_directory(db: &Database) -> GeoPoint {
    let venue = GeoPoint::new(44.0462, -123.0220);
    let mut ada = Member::new("m1", "Ada Lovelace");
    ada.email = Some("ada@example.org".to_string());
    db.upsert_member(&ada).unwrap();
    db.upsert_member(&Member::new("m2", "Grace Hopper")).unwrap();
    db.add_member_embedding(
        "m2",
        &Embedding::new(vec![0.0, 0.0, 0.0]).unwrap(),
        EmbeddingSource::Directory,
        None,
    )
    .unwrap();

    let start = NaiveDate::from_ymd_opt(2025, 9, 15)
        .unwrap()
        .and_hms_opt(10, 0, 0)
        .unwrap();
    let mut event = crate::db::Event::new("e1", "Fall Paddle", start);
    event.location_name = Some("Fern Ridge".to_string());
    event.location_lat = Some(venue.lat);
    event.location_lon = Some(venue.lon);
    event.activity = Some("paddling".to_string());
    db.upsert_event(&event).unwrap();
    db.add_registration("e1", "m1", Some("rsvp")).unwrap();
    venue
}

#[test]
fn test_submission_catalogued_end_to_end() {
    let h = Harness::new();
    let venue = seed_directory(&h.db);
    let source = h.upload("IMG_0001.jpg", b"photo one");
    let queue_id = h.enqueue(&source, Some("m1"));

    let metadata = PhotoMetadata {
        taken_at: Some(taken()),
        gps: Some(venue.offset_north(300.0)),
        camera_make: Some("Canon".to_string()),
        ..Default::default()
    };
    let writer = RecordingWriter::default();
    let pipeline = h.pipeline(metadata, FixedFaces::new(vec![face(vec![0.1, 0.0, 0.0])]), writer.clone());

    let outcome = pipeline.process_next(&h.db).unwrap().unwrap();
    let photo_id = match outcome {
        ItemOutcome::Catalogued { photo_id } => photo_id,
        other => panic!("unexpected outcome {:?}", other),
    };

    let photo = h.db.get_photo(&photo_id).unwrap().unwrap();
    assert_eq!(photo.event_id.as_deref(), Some("e1"));
    assert_eq!(photo.event_match_method.as_deref(), Some("gps_high+rsvp"));
    assert!(photo.event_match_confidence.unwrap() >= 0.95);
    assert_eq!(photo.submitter_member_id.as_deref(), Some("m1"));
    assert_eq!(photo.camera_make.as_deref(), Some("Canon"));
    assert_eq!(photo.original_filename.as_deref(), Some("IMG_0001.jpg"));

    let faces = h.db.faces_for_photo(&photo_id).unwrap();
    assert_eq!(faces.len(), 1);
    assert_eq!(faces[0].matched_member_id.as_deref(), Some("m2"));
    assert!(faces[0].is_high_confidence);

    let tags: Vec<String> = h.db.photo_tags(&photo_id).unwrap().into_iter().map(|t| t.name).collect();
    for expected in ["2025", "Sep2025", "FallPaddle", "Paddling", "FernRidge", "GraceHopper", "SubmittedByAdaLovelace"] {
        assert!(tags.contains(&expected.to_string()), "missing tag {}", expected);
    }

    let item = h.db.get_item(queue_id).unwrap().unwrap();
    assert_eq!(item.state, QueueState::Completed);
    assert_eq!(item.photo_id.as_deref(), Some(photo_id.as_str()));
    assert!(!source.exists());
    assert!(h.store.join(&photo.original_path).exists());

    let written = writer.written.lock().unwrap();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].people, vec!["Grace Hopper".to_string()]);
    assert_eq!(written[0].event_name.as_deref(), Some("Fall Paddle"));
}

#[test]
fn test_duplicate_content_completes_without_photo() {
    let h = Harness::new();
    let first = h.upload("a.jpg", b"same bytes");
    let second = h.upload("b.jpg", b"same bytes");
    h.enqueue(&first, None);
    let second_id = h.enqueue(&second, None);

    let pipeline = h.pipeline(PhotoMetadata::default(), FixedFaces::new(Vec::new()), RecordingWriter::default());
    let first_outcome = pipeline.process_next(&h.db).unwrap().unwrap();
    let ItemOutcome::Catalogued { photo_id } = first_outcome else {
        panic!("first import should be catalogued");
    };

    let second_outcome = pipeline.process_next(&h.db).unwrap().unwrap();
    assert_eq!(
        second_outcome,
        ItemOutcome::Duplicate {
            existing_photo_id: photo_id.clone()
        }
    );

    assert_eq!(h.db.photo_count().unwrap(), 1);
    let item = h.db.get_item(second_id).unwrap().unwrap();
    assert_eq!(item.state, QueueState::Completed);
    assert_eq!(item.photo_id, None);
    assert!(item.outcome_note.unwrap().contains(&photo_id));
    assert!(!second.exists());
}

#[test]
fn test_rendition_failure_marks_item_failed() {
    let h = Harness::new();
    let source = h.upload("broken.jpg", b"not really an image");
    let queue_id = h.enqueue(&source, None);

    let pipeline = h.pipeline_with(
        PhotoMetadata::default(),
        FixedFaces::new(Vec::new()),
        RecordingWriter::default(),
        true,
    );
    let outcome = pipeline.process_next(&h.db).unwrap().unwrap();
    assert!(matches!(outcome, ItemOutcome::Failed { .. }));

    let item = h.db.get_item(queue_id).unwrap().unwrap();
    assert_eq!(item.state, QueueState::Failed);
    assert!(item.error_message.unwrap().contains("decoder exploded"));
    assert_eq!(h.db.photo_count().unwrap(), 0);
    // Kept so a retry can pick it up.
    assert!(source.exists());
}

#[test]
fn test_failed_insert_leaves_no_rows_or_files() {
    let h = Harness::new();
    let source = h.upload("c.jpg", b"photo three");
    let queue_id = h.enqueue(&source, None);
    h.db.conn.execute_batch("DROP TABLE photo_tags").unwrap();

    let metadata = PhotoMetadata {
        taken_at: Some(taken()),
        ..Default::default()
    };
    let pipeline = h.pipeline(metadata, FixedFaces::new(Vec::new()), RecordingWriter::default());
    let outcome = pipeline.process_next(&h.db).unwrap().unwrap();
    assert!(matches!(outcome, ItemOutcome::Failed { .. }));

    assert_eq!(h.db.photo_count().unwrap(), 0);
    assert_eq!(h.db.get_item(queue_id).unwrap().unwrap().state, QueueState::Failed);
    let leftovers = walkdir::WalkDir::new(&h.store)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .count();
    assert_eq!(leftovers, 0);
}

#[test]
fn test_missing_upload_fails_with_bounded_retries() {
    let h = Harness::new();
    let queue_id = h.enqueue(&h.incoming.join("vanished.jpg"), None);
    let pipeline = h.pipeline(PhotoMetadata::default(), FixedFaces::new(Vec::new()), RecordingWriter::default());
    let max_attempts = pipeline.config().queue.max_attempts;

    for attempt in 1..=max_attempts {
        let outcome = pipeline.process_next(&h.db).unwrap().unwrap();
        assert!(matches!(outcome, ItemOutcome::Failed { .. }));
        let item = h.db.get_item(queue_id).unwrap().unwrap();
        assert_eq!(item.attempts, attempt);
        assert!(item.error_message.unwrap().contains("fingerprint"));
        h.db.retry_failed(max_attempts).unwrap();
    }

    assert_eq!(h.db.get_item(queue_id).unwrap().unwrap().state, QueueState::Failed);
    assert_eq!(pipeline.process_next(&h.db).unwrap(), None);
}

#[test]
fn test_face_service_outage_is_not_fatal() {
    let h = Harness::new();
    let source = h.upload("d.jpg", b"photo four");
    h.enqueue(&source, None);

    let faces = FixedFaces {
        faces: Vec::new(),
        fail: true,
    };
    let pipeline = h.pipeline(PhotoMetadata::default(), faces, RecordingWriter::default());
    let ItemOutcome::Catalogued { photo_id } = pipeline.process_next(&h.db).unwrap().unwrap() else {
        panic!("expected a catalogued photo");
    };
    assert!(h.db.faces_for_photo(&photo_id).unwrap().is_empty());
}

#[test]
fn test_metadata_write_failure_is_not_fatal() {
    let h = Harness::new();
    let source = h.upload("e.jpg", b"photo five");
    let queue_id = h.enqueue(&source, None);

    let writer = RecordingWriter {
        fail: true,
        ..Default::default()
    };
    let pipeline = h.pipeline(PhotoMetadata::default(), FixedFaces::new(Vec::new()), writer);
    let outcome = pipeline.process_next(&h.db).unwrap().unwrap();
    assert!(matches!(outcome, ItemOutcome::Catalogued { .. }));
    assert_eq!(h.db.get_item(queue_id).unwrap().unwrap().state, QueueState::Completed);
}

#[test]
fn test_submitter_resolved_by_email() {
    let h = Harness::new();
    seed_directory(&h.db);
    let source = h.upload("f.jpg", b"photo six");
    let mut item = NewQueueItem::new(&source, SubmissionSource::Email);
    item.submitter_email = Some(" ADA@example.org".to_string());
    h.db.enqueue(&item).unwrap();

    let pipeline = h.pipeline(PhotoMetadata::default(), FixedFaces::new(Vec::new()), RecordingWriter::default());
    let ItemOutcome::Catalogued { photo_id } = pipeline.process_next(&h.db).unwrap().unwrap() else {
        panic!("expected a catalogued photo");
    };
    let photo = h.db.get_photo(&photo_id).unwrap().unwrap();
    assert_eq!(photo.submitter_member_id.as_deref(), Some("m1"));
    assert_eq!(photo.submitted_via.as_deref(), Some("email"));
}

#[test]
fn test_batch_stops_at_limit() {
    let h = Harness::new();
    for i in 0..3 {
        let path = h.upload(&format!("{}.jpg", i), format!("distinct {}", i).as_bytes());
        h.enqueue(&path, None);
    }

    let pipeline = h.pipeline(PhotoMetadata::default(), FixedFaces::new(Vec::new()), RecordingWriter::default());
    let stats = pipeline.process_batch(&h.db, 2).unwrap();
    assert_eq!(stats.processed, 2);
    assert_eq!(stats.catalogued, 2);
    assert_eq!(h.db.queue_stats().unwrap().pending, 1);

    let rest = pipeline.process_batch(&h.db, 10).unwrap();
    assert_eq!(rest.processed, 1);
}

#[test]
fn test_rematch_picks_up_new_reference_embeddings() {
    let h = Harness::new();
    h.db.upsert_member(&Member::new("m2", "Grace Hopper")).unwrap();
    let source = h.upload("g.jpg", b"photo seven");
    h.enqueue(&source, None);

    let pipeline = h.pipeline(
        PhotoMetadata::default(),
        FixedFaces::new(vec![face(vec![0.1, 0.0, 0.0])]),
        RecordingWriter::default(),
    );
    let ItemOutcome::Catalogued { photo_id } = pipeline.process_next(&h.db).unwrap().unwrap() else {
        panic!("expected a catalogued photo");
    };
    let before = h.db.faces_for_photo(&photo_id).unwrap();
    assert_eq!(before[0].matched_member_id, None);

    h.db.add_member_embedding(
        "m2",
        &Embedding::new(vec![0.0, 0.0, 0.0]).unwrap(),
        EmbeddingSource::Directory,
        None,
    )
    .unwrap();

    let summary = pipeline.rematch_photo(&h.db, &photo_id).unwrap();
    assert_eq!(summary, RematchSummary { faces: 1, matched: 1 });

    let after = h.db.faces_for_photo(&photo_id).unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].matched_member_id.as_deref(), Some("m2"));
    let tags: Vec<String> = h.db.photo_tags(&photo_id).unwrap().into_iter().map(|t| t.name).collect();
    assert!(tags.contains(&"GraceHopper".to_string()));

    assert!(pipeline.rematch_photo(&h.db, "no-such-photo").is_err());
}

#[test]
fn test_rematch_replaces_person_tag_when_best_match_changes() {
    let h = Harness::new();
    seed_directory(&h.db);
    let source = h.upload("a.jpg", b"photo eight");
    h.enqueue(&source, None);

    let pipeline = h.pipeline(
        PhotoMetadata::default(),
        FixedFaces::new(vec![face(vec![0.1, 0.0, 0.0])]),
        RecordingWriter::default(),
    );
    let ItemOutcome::Catalogued { photo_id } = pipeline.process_next(&h.db).unwrap().unwrap() else {
        panic!("expected a catalogued photo");
    };
    let tag_names = |db: &Database| -> Vec<String> {
        db.photo_tags(&photo_id).unwrap().into_iter().map(|t| t.name).collect()
    };
    assert!(tag_names(&h.db).contains(&"GraceHopper".to_string()));

    h.db.upsert_member(&Member::new("m3", "Alan Turing")).unwrap();
    h.db.add_member_embedding(
        "m3",
        &Embedding::new(vec![0.1, 0.0, 0.0]).unwrap(),
        EmbeddingSource::Directory,
        None,
    )
    .unwrap();

    pipeline.rematch_photo(&h.db, &photo_id).unwrap();

    let faces = h.db.faces_for_photo(&photo_id).unwrap();
    assert_eq!(faces[0].matched_member_id.as_deref(), Some("m3"));
    let tags = tag_names(&h.db);
    assert!(tags.contains(&"AlanTuring".to_string()));
    assert!(!tags.contains(&"GraceHopper".to_string()));
}

#[test]
fn test_face_review_updates_person_tags() {
    let h = Harness::new();
    seed_directory(&h.db);
    let source = h.upload("r.jpg", b"photo nine");
    h.enqueue(&source, None);

    let pipeline = h.pipeline(
        PhotoMetadata::default(),
        FixedFaces::new(vec![face(vec![5.0, 5.0, 5.0])]),
        RecordingWriter::default(),
    );
    let ItemOutcome::Catalogued { photo_id } = pipeline.process_next(&h.db).unwrap().unwrap() else {
        panic!("expected a catalogued photo");
    };
    let face_id = h.db.faces_for_photo(&photo_id).unwrap()[0].id;
    let has_ada = |db: &Database| {
        db.photo_tags(&photo_id)
            .unwrap()
            .iter()
            .any(|t| t.name == "AdaLovelace" && t.kind == TagKind::Person)
    };
    assert!(!has_ada(&h.db));

    assert!(review_face(&h.db, face_id, Some("m1"), "admin", false).unwrap());
    assert!(has_ada(&h.db));

    assert!(review_face(&h.db, face_id, None, "admin", true).unwrap());
    assert!(!has_ada(&h.db));

    assert!(!review_face(&h.db, 9999, Some("m1"), "admin", false).unwrap());
}
