//! Several workers, each with its own connection, sharing one database file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};
use std::thread;

use gallery_intake::config::{Config, MetadataWriterMode};
use gallery_intake::db::{Database, NewQueueItem, QueueState, SubmissionSource};
use gallery_intake::pipeline::{run_workers, Pipeline};
use walkdir::WalkDir;

fn temp_database(dir: &Path) -> PathBuf {
    let path = dir.join("gallery.db");
    let db = Database::open(&path).unwrap();
    db.initialize().unwrap();
    path
}

fn write_image(path: &Path, shade: u8) {
    let img = image::RgbImage::from_pixel(48, 32, image::Rgb([shade, 90, 200]));
    img.save(path).unwrap();
}

#[test]
fn concurrent_claims_never_hand_out_an_item_twice() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = temp_database(dir.path());

    let db = Database::open(&db_path).unwrap();
    for i in 0..40 {
        db.enqueue(&NewQueueItem::new(format!("/incoming/{}.jpg", i), SubmissionSource::Upload))
            .unwrap();
    }

    let workers = 4;
    let barrier = Arc::new(Barrier::new(workers));
    let handles: Vec<_> = (0..workers)
        .map(|_| {
            let db_path = db_path.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let db = Database::open(&db_path).unwrap();
                barrier.wait();
                let mut claimed = Vec::new();
                while let Some(item) = db.claim_next().unwrap() {
                    assert_eq!(item.state, QueueState::Processing);
                    claimed.push(item.id);
                }
                claimed
            })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.join().unwrap());
    }

    let unique: HashSet<i64> = all.iter().copied().collect();
    assert_eq!(all.len(), 40);
    assert_eq!(unique.len(), 40);

    let stats = db.queue_stats().unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.processing, 40);
}

#[test]
fn racing_identical_uploads_catalogue_one_photo() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = temp_database(dir.path());
    let incoming = dir.path().join("incoming");
    let store = dir.path().join("store");
    std::fs::create_dir_all(&incoming).unwrap();

    write_image(&incoming.join("first.png"), 10);
    std::fs::copy(incoming.join("first.png"), incoming.join("copy.png")).unwrap();
    write_image(&incoming.join("other.png"), 240);

    let db = Database::open(&db_path).unwrap();
    for name in ["first.png", "copy.png", "other.png"] {
        db.enqueue(&NewQueueItem::new(incoming.join(name), SubmissionSource::Email))
            .unwrap();
    }

    let mut config = Config::default();
    config.database.path = db_path.clone();
    config.storage.root = store.clone();
    config.metadata_writer.mode = MetadataWriterMode::Disabled;
    let pipeline = Pipeline::from_config(config);

    let stats = run_workers(&pipeline, &db_path, 3, 3).unwrap();

    assert_eq!(stats.processed, 3);
    assert_eq!(stats.catalogued, 2);
    assert_eq!(stats.duplicates, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(db.photo_count().unwrap(), 2);

    let queue = db.queue_stats().unwrap();
    assert_eq!(queue.completed, 3);

    // The loser of the race leaves no renditions behind.
    let originals = WalkDir::new(store.join("originals"))
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .count();
    assert_eq!(originals, 2);
}
