use anyhow::{bail, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

use crate::db::{format_timestamp, Database, Event, PhotoStatus};
use crate::naming::export_filename;

/// Export format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(format!("Unknown export format: {}", other)),
        }
    }
}

/// One catalogued photo as it appears in an export.
#[derive(Debug, Serialize)]
pub struct ExportedPhoto {
    pub id: String,
    pub export_name: String,
    pub original_path: String,
    pub original_filename: Option<String>,
    pub taken_at: Option<String>,
    pub status: String,
    pub event_id: Option<String>,
    pub event_name: Option<String>,
    pub event_match_confidence: Option<f64>,
    pub event_match_method: Option<String>,
    pub submitted_by: Option<String>,
    pub submitted_via: Option<String>,
    pub people: Vec<String>,
    pub tags: Vec<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub file_size: Option<u64>,
    pub content_hash: String,
}

/// Export the catalogue, optionally only photos in one review status.
/// Returns the number of photos written.
pub fn export_catalogue(
    db: &Database,
    output_path: &Path,
    format: ExportFormat,
    status: Option<PhotoStatus>,
) -> Result<usize> {
    let photos = collect_photos(db, status)?;
    let count = photos.len();

    match format {
        ExportFormat::Json => export_json(&photos, output_path)?,
        ExportFormat::Csv => export_csv(&photos, output_path)?,
    }

    Ok(count)
}

pub fn collect_photos(db: &Database, status: Option<PhotoStatus>) -> Result<Vec<ExportedPhoto>> {
    let photos = db.list_photos(status)?;
    let mut events: HashMap<String, Option<Event>> = HashMap::new();
    let mut exported = Vec::with_capacity(photos.len());

    for photo in photos {
        let event = match photo.event_id {
            Some(ref id) => {
                if !events.contains_key(id) {
                    events.insert(id.clone(), db.get_event(id)?);
                }
                events.get(id).and_then(|e| e.as_ref())
            }
            None => None,
        };

        let faces = db.faces_for_photo(&photo.id)?;
        let mut people_ids: Vec<String> = Vec::new();
        for face in &faces {
            if let Some(id) = face.trusted_member_id() {
                if !people_ids.iter().any(|p| p == id) {
                    people_ids.push(id.to_string());
                }
            }
        }

        let mut lookup = people_ids.clone();
        if let Some(ref submitter) = photo.submitter_member_id {
            lookup.push(submitter.clone());
        }
        let names = if lookup.is_empty() {
            HashMap::new()
        } else {
            db.member_names(&lookup)?
        };

        let people: Vec<String> = people_ids.iter().filter_map(|id| names.get(id).cloned()).collect();
        let submitted_by = photo
            .submitter_member_id
            .as_ref()
            .and_then(|id| names.get(id).cloned());

        // Stored originals are always JPEG, whatever was uploaded.
        let export_name = export_filename(
            &photo.original_path,
            photo.taken_at,
            submitted_by.as_deref(),
            event.map(|e| e.start.date()),
            Some(&photo.id),
        );

        let tags = db.photo_tags(&photo.id)?.into_iter().map(|t| t.name).collect();

        exported.push(ExportedPhoto {
            export_name,
            original_path: photo.original_path,
            original_filename: photo.original_filename,
            taken_at: photo.taken_at.as_ref().map(format_timestamp),
            status: photo.status.as_str().to_string(),
            event_id: photo.event_id.clone(),
            event_name: event.map(|e| e.name.clone()),
            event_match_confidence: photo.event_match_confidence,
            event_match_method: photo.event_match_method,
            submitted_by,
            submitted_via: photo.submitted_via,
            people,
            tags,
            width: photo.width,
            height: photo.height,
            file_size: photo.file_size,
            content_hash: photo.content_hash,
            id: photo.id,
        });
    }

    Ok(exported)
}

fn export_json(photos: &[ExportedPhoto], output_path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(photos)?;
    let mut file = File::create(output_path)?;
    file.write_all(json.as_bytes())?;
    Ok(())
}

fn export_csv(photos: &[ExportedPhoto], output_path: &Path) -> Result<()> {
    if output_path.is_dir() {
        bail!("{} is a directory", output_path.display());
    }
    let mut wtr = csv::Writer::from_path(output_path)?;

    wtr.write_record([
        "id",
        "export_name",
        "original_path",
        "original_filename",
        "taken_at",
        "status",
        "event_id",
        "event_name",
        "event_match_confidence",
        "event_match_method",
        "submitted_by",
        "submitted_via",
        "people",
        "tags",
        "width",
        "height",
        "file_size",
        "content_hash",
    ])?;

    for photo in photos {
        let row: Vec<String> = vec![
            photo.id.clone(),
            photo.export_name.clone(),
            photo.original_path.clone(),
            photo.original_filename.clone().unwrap_or_default(),
            photo.taken_at.clone().unwrap_or_default(),
            photo.status.clone(),
            photo.event_id.clone().unwrap_or_default(),
            photo.event_name.clone().unwrap_or_default(),
            photo
                .event_match_confidence
                .map(|v| format!("{:.2}", v))
                .unwrap_or_default(),
            photo.event_match_method.clone().unwrap_or_default(),
            photo.submitted_by.clone().unwrap_or_default(),
            photo.submitted_via.clone().unwrap_or_default(),
            photo.people.join("; "),
            photo.tags.join("; "),
            photo.width.map(|v| v.to_string()).unwrap_or_default(),
            photo.height.map(|v| v.to_string()).unwrap_or_default(),
            photo.file_size.map(|v| v.to_string()).unwrap_or_default(),
            photo.content_hash.clone(),
        ];
        wtr.write_record(&row)?;
    }

    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{BoundingBox, CataloguedPhoto, Member, NewFace, NewPhoto};
    use crate::tags::{Tag, TagKind};
    use chrono::NaiveDate;

    fn seeded() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.upsert_member(&Member::new("m1", "Ada Lovelace")).unwrap();
        db.upsert_member(&Member::new("m2", "Grace Hopper")).unwrap();
        let start = NaiveDate::from_ymd_opt(2025, 9, 15).unwrap().and_hms_opt(10, 0, 0).unwrap();
        db.upsert_event(&Event::new("e1", "Fall Paddle", start)).unwrap();

        let mut trusted = NewFace::unmatched(BoundingBox::new(0, 10, 10, 0), None);
        trusted.matched_member_id = Some("m2".to_string());
        trusted.is_high_confidence = true;
        let mut unsure = NewFace::unmatched(BoundingBox::new(0, 20, 10, 10), None);
        unsure.matched_member_id = Some("m1".to_string());

        db.insert_catalogued(&CataloguedPhoto {
            photo: NewPhoto {
                id: "photo-abcd".to_string(),
                content_hash: "h1".to_string(),
                original_filename: Some("IMG_1.JPEG".to_string()),
                submitter_member_id: Some("m1".to_string()),
                taken_at: NaiveDate::from_ymd_opt(2025, 9, 15).unwrap().and_hms_opt(14, 30, 5),
                event_id: Some("e1".to_string()),
                event_match_confidence: Some(0.95),
                event_match_method: Some("gps_high".to_string()),
                original_path: "originals/2025/09/photo-abcd.jpg".to_string(),
                display_path: "display/2025/09/photo-abcd.jpg".to_string(),
                thumb_path: "thumbs/2025/09/photo-abcd.jpg".to_string(),
                ..Default::default()
            },
            faces: vec![trusted, unsure],
            tags: vec![Tag::auto("2025", TagKind::Date), Tag::auto("FallPaddle", TagKind::Event)],
        })
        .unwrap();
        db
    }

    #[test]
    fn test_collect_resolves_names_and_trusted_people() {
        let db = seeded();
        let photos = collect_photos(&db, None).unwrap();

        assert_eq!(photos.len(), 1);
        let photo = &photos[0];
        assert_eq!(photo.export_name, "20250915_143005_AL_abcd.jpg");
        assert_eq!(photo.event_name.as_deref(), Some("Fall Paddle"));
        assert_eq!(photo.submitted_by.as_deref(), Some("Ada Lovelace"));
        assert_eq!(photo.people, vec!["Grace Hopper".to_string()]);
        assert!(photo.tags.contains(&"FallPaddle".to_string()));
    }

    #[test]
    fn test_export_json_and_csv() {
        let db = seeded();
        let dir = tempfile::tempdir().unwrap();

        let json_path = dir.path().join("catalogue.json");
        assert_eq!(export_catalogue(&db, &json_path, ExportFormat::Json, None).unwrap(), 1);
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&json_path).unwrap()).unwrap();
        assert_eq!(value[0]["id"], "photo-abcd");

        let csv_path = dir.path().join("catalogue.csv");
        export_catalogue(&db, &csv_path, ExportFormat::Csv, None).unwrap();
        let mut reader = csv::Reader::from_path(&csv_path).unwrap();
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(&rows[0][0], "photo-abcd");
        assert_eq!(&rows[0][8], "0.95");

        let filtered = export_catalogue(&db, &csv_path, ExportFormat::Csv, Some(PhotoStatus::Public)).unwrap();
        assert_eq!(filtered, 0);
    }

    #[test]
    fn test_format_from_str() {
        assert_eq!("CSV".parse::<ExportFormat>(), Ok(ExportFormat::Csv));
        assert!("html".parse::<ExportFormat>().is_err());
    }
}
