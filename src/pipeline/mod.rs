//! Drives queue items from raw submission to catalogued photo.
//!
//! One item runs its stages strictly in order: fingerprint gate, metadata
//! and renditions, event match, identity match per face, tags, a single
//! transactional insert, then a best-effort metadata write. Independent
//! items may run on separate workers, each with its own connection.

pub mod workers;

use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::collaborators::{Collaborators, DetectedFace, PhotoMetadata, PhotoSummary, Renditions};
use crate::config::Config;
use crate::db::{CataloguedPhoto, Database, Event, FaceRecord, NewFace, NewPhoto, QueueItem};
use crate::error::IntakeError;
use crate::fingerprint::FingerprintStore;
use crate::matching::{EventMatch, EventMatcher, GeocodeCache, IdentityMatcher};
use crate::tags::{generate_tags, sanitize_tag, Tag, TagKind, TagSources};

pub use workers::run_workers;

/// How a claimed queue item ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Catalogued { photo_id: String },
    /// Content already catalogued. Not a failure.
    Duplicate { existing_photo_id: String },
    Failed { error: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessingStats {
    pub processed: usize,
    pub catalogued: usize,
    pub duplicates: usize,
    pub failed: usize,
}

impl ProcessingStats {
    fn record(&mut self, outcome: &ItemOutcome) {
        self.processed += 1;
        match outcome {
            ItemOutcome::Catalogued { .. } => self.catalogued += 1,
            ItemOutcome::Duplicate { .. } => self.duplicates += 1,
            ItemOutcome::Failed { .. } => self.failed += 1,
        }
    }

    pub fn merge(&mut self, other: &ProcessingStats) {
        self.processed += other.processed;
        self.catalogued += other.catalogued;
        self.duplicates += other.duplicates;
        self.failed += other.failed;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RematchSummary {
    pub faces: usize,
    pub matched: usize,
}

/// Shared, thread-safe processing context. Clone it into each worker.
#[derive(Clone)]
pub struct Pipeline {
    config: Arc<Config>,
    services: Arc<Collaborators>,
    geocode_cache: Arc<GeocodeCache>,
}

impl Pipeline {
    pub fn new(config: Config, services: Collaborators) -> Self {
        let geocode_cache = GeocodeCache::new(config.geocoding.cache_capacity);
        Self {
            config: Arc::new(config),
            services: Arc::new(services),
            geocode_cache: Arc::new(geocode_cache),
        }
    }

    pub fn from_config(config: Config) -> Self {
        let services = Collaborators::from_config(&config);
        Self::new(config, services)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Claim and process the next pending item. `None` when the queue is empty.
    pub fn process_next(&self, db: &Database) -> Result<Option<ItemOutcome>> {
        let item = match db.claim_next()? {
            Some(item) => item,
            None => return Ok(None),
        };
        self.process_item(db, &item).map(Some)
    }

    /// Process up to `limit` items on this connection.
    pub fn process_batch(&self, db: &Database, limit: usize) -> Result<ProcessingStats> {
        let mut stats = ProcessingStats::default();
        while stats.processed < limit {
            match self.process_next(db)? {
                Some(outcome) => stats.record(&outcome),
                None => break,
            }
        }
        if stats.processed > 0 {
            info!(
                processed = stats.processed,
                catalogued = stats.catalogued,
                duplicates = stats.duplicates,
                failed = stats.failed,
                "Batch complete"
            );
        }
        Ok(stats)
    }

    /// Run an already claimed item to its terminal state. Stage failures
    /// are recorded on the queue row; only bookkeeping errors are returned.
    pub fn process_item(&self, db: &Database, item: &QueueItem) -> Result<ItemOutcome> {
        debug!(queue_id = item.id, path = %item.photo_path.display(), "Processing queue item");

        match self.catalogue(db, item) {
            Ok(ItemOutcome::Catalogued { photo_id }) => {
                db.mark_completed(item.id, Some(&photo_id), None)?;
                remove_source(&item.photo_path);
                info!(queue_id = item.id, photo_id = %photo_id, "Photo catalogued");
                Ok(ItemOutcome::Catalogued { photo_id })
            }
            Ok(ItemOutcome::Duplicate { existing_photo_id }) => {
                let note = format!("Duplicate of photo {}", existing_photo_id);
                db.mark_completed(item.id, None, Some(&note))?;
                remove_source(&item.photo_path);
                info!(queue_id = item.id, existing = %existing_photo_id, "Duplicate submission rejected");
                Ok(ItemOutcome::Duplicate { existing_photo_id })
            }
            Ok(ItemOutcome::Failed { error }) | Err(IntakeFailure(error)) => {
                db.mark_failed(item.id, &error)?;
                error!(queue_id = item.id, attempts = item.attempts, error = %error, "Queue item failed");
                Ok(ItemOutcome::Failed { error })
            }
        }
    }

    fn catalogue(&self, db: &Database, item: &QueueItem) -> std::result::Result<ItemOutcome, IntakeFailure> {
        let source = item.photo_path.as_path();

        // Fingerprint gate, before anything expensive.
        let check = FingerprintStore::new(db).check(source)?;
        if let Some(existing_photo_id) = check.existing_photo_id.clone() {
            return Ok(ItemOutcome::Duplicate { existing_photo_id });
        }
        let fingerprint = check.require_fingerprint(source)?.to_string();

        let metadata = match self.services.metadata.extract(source) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(queue_id = item.id, error = %e, "Metadata extraction failed, continuing without");
                PhotoMetadata::default()
            }
        };

        let photo_id = uuid::Uuid::new_v4().to_string();
        let renditions = self
            .services
            .renditions
            .create(source, &photo_id, metadata.taken_at)
            .map_err(|e| IntakeError::collaborator("renditions", format!("{:#}", e)))?;

        let result = self.catalogue_stored(db, item, &photo_id, &fingerprint, &metadata, &renditions);

        if !matches!(result, Ok(ItemOutcome::Catalogued { .. })) {
            if let Err(e) = self.services.renditions.remove(&renditions) {
                warn!(photo_id = %photo_id, error = %e, "Failed to remove orphaned renditions");
            }
        }
        result
    }

    /// Everything after the renditions exist. Any error here leaves no rows.
    fn catalogue_stored(
        &self,
        db: &Database,
        item: &QueueItem,
        photo_id: &str,
        fingerprint: &str,
        metadata: &PhotoMetadata,
        renditions: &Renditions,
    ) -> std::result::Result<ItemOutcome, IntakeFailure> {
        let submitter = self.resolve_submitter(db, item)?;
        let submitter_id = submitter.as_ref().map(|(id, _)| id.as_str());

        let event_match = self.match_event(db, metadata, submitter_id)?;
        let event = event_match.event.as_ref();

        let stored_original = self.services.renditions.resolve(&renditions.original_path);
        let faces = self.match_faces(db, &stored_original, event)?;

        let people = self.trusted_people(db, &faces)?;
        let tags = generate_tags(&TagSources {
            taken_at: metadata.taken_at,
            event,
            people: people.clone(),
            submitter_name: submitter.as_ref().and_then(|(_, name)| name.clone()),
        });

        let record = CataloguedPhoto {
            photo: NewPhoto {
                id: photo_id.to_string(),
                content_hash: fingerprint.to_string(),
                original_filename: item.original_filename.clone(),
                submitter_member_id: submitter_id.map(str::to_string),
                submitter_email: item.submitter_email.clone(),
                submitted_via: Some(item.source.as_str().to_string()),
                submitted_at: Some(item.submitted_at.clone()),
                taken_at: metadata.taken_at,
                gps_lat: metadata.gps.map(|p| p.lat),
                gps_lon: metadata.gps.map(|p| p.lon),
                camera_make: metadata.camera_make.clone(),
                camera_model: metadata.camera_model.clone(),
                event_id: event_match.event_id().map(str::to_string),
                event_match_confidence: event_match.is_match().then_some(event_match.confidence),
                event_match_method: event_match.is_match().then(|| event_match.method.clone()),
                original_path: renditions.original_path.clone(),
                display_path: renditions.display_path.clone(),
                thumb_path: renditions.thumb_path.clone(),
                width: Some(renditions.width),
                height: Some(renditions.height),
                file_size: Some(renditions.file_size),
            },
            faces,
            tags,
        };

        match db.insert_catalogued(&record) {
            Ok(()) => {}
            Err(IntakeError::DuplicatePhoto { existing_photo_id, .. }) => {
                info!(photo_id, existing = %existing_photo_id, "Lost duplicate race at insert");
                return Ok(ItemOutcome::Duplicate { existing_photo_id });
            }
            Err(e) => return Err(e.into()),
        }

        let summary = PhotoSummary {
            photo_id: photo_id.to_string(),
            taken_at: metadata.taken_at,
            event_name: event.map(|e| e.name.clone()),
            event_date: event.map(|e| e.start),
            location: event.and_then(|e| e.location_name.clone()),
            people,
            keywords: record.tags.iter().map(|t| t.name.clone()).collect(),
            submitted_by: submitter.and_then(|(_, name)| name),
            submitter_email: item.submitter_email.clone(),
            source: Some(item.source.as_str().to_string()),
        };
        if let Err(e) = self.services.writer.write(&stored_original, &summary) {
            warn!(photo_id, writer = self.services.writer.name(), error = %e, "Metadata write failed");
        }

        Ok(ItemOutcome::Catalogued {
            photo_id: photo_id.to_string(),
        })
    }

    /// Member id and display name of the submitter, by id or by email.
    fn resolve_submitter(&self, db: &Database, item: &QueueItem) -> Result<Option<(String, Option<String>)>> {
        if let Some(ref member_id) = item.submitter_member_id {
            let name = db.get_member(member_id)?.map(|m| m.display_name);
            return Ok(Some((member_id.clone(), name)));
        }
        if let Some(ref email) = item.submitter_email {
            if let Some(member) = db.member_by_email(email)? {
                return Ok(Some((member.id, Some(member.display_name))));
            }
        }
        Ok(None)
    }

    fn match_event(&self, db: &Database, metadata: &PhotoMetadata, submitter_id: Option<&str>) -> Result<EventMatch> {
        let matcher = EventMatcher::new(
            db,
            &self.config.event_match,
            self.services.geocoder.as_ref(),
            &self.geocode_cache,
        )
        .with_region_hint(self.config.geocoding.region_hint.as_deref());

        let result = matcher.find_matching_event(metadata.taken_at, metadata.gps, submitter_id)?;
        match result.event {
            Some(ref event) => debug!(
                event_id = %event.id,
                confidence = result.confidence,
                method = %result.method,
                "Event matched"
            ),
            None => debug!(reason = result.reason.as_deref().unwrap_or(""), "No event match"),
        }
        Ok(result)
    }

    /// Extract and match faces. An unavailable embedding service means no
    /// faces, not a failed item.
    fn match_faces(&self, db: &Database, image: &Path, event: Option<&Event>) -> Result<Vec<NewFace>> {
        let detected = match self.services.faces.extract_faces(image) {
            Ok(detected) => detected,
            Err(e) => {
                warn!(
                    service = self.services.faces.name(),
                    error = %e,
                    "Face extraction failed, continuing with no faces"
                );
                return Ok(Vec::new());
            }
        };
        if detected.is_empty() {
            return Ok(Vec::new());
        }

        self.match_detected(db, detected, event)
    }

    /// Match each detected face against the member pool, narrowed to the
    /// event's registered attendees when there is an event.
    fn match_detected(&self, db: &Database, detected: Vec<DetectedFace>, event: Option<&Event>) -> Result<Vec<NewFace>> {
        let registered = match event {
            Some(event) => Some(db.registered_member_ids(&event.id)?),
            None => None,
        };
        let matcher = IdentityMatcher::load(db, &self.config.faces, registered.as_deref())?;
        let registered_set: Option<HashSet<String>> = registered.map(|ids| ids.into_iter().collect());
        let is_public = event.map(|e| e.is_public).unwrap_or(false);

        let faces = detected
            .into_iter()
            .map(|face| {
                let result = matcher.match_face(&face.embedding, is_public, registered_set.as_ref());
                NewFace {
                    bbox: face.bbox,
                    embedding: Some(face.embedding),
                    matched_member_id: result.matched_member_id,
                    match_confidence: result.confidence,
                    match_rank: result.rank,
                    is_high_confidence: result.is_high_confidence,
                    candidates: result.candidates,
                }
            })
            .collect();
        Ok(faces)
    }

    /// Display names of high-confidence matches, first occurrence order.
    fn trusted_people(&self, db: &Database, faces: &[NewFace]) -> Result<Vec<String>> {
        let mut seen = HashSet::new();
        let ids: Vec<String> = faces
            .iter()
            .filter(|f| f.is_high_confidence)
            .filter_map(|f| f.matched_member_id.clone())
            .filter(|id| seen.insert(id.clone()))
            .collect();
        people_names(db, &ids)
    }

    /// Re-run face extraction and matching for a catalogued photo. Reviewed
    /// faces are kept; unreviewed ones are replaced.
    pub fn rematch_photo(&self, db: &Database, photo_id: &str) -> Result<RematchSummary> {
        let photo = match db.get_photo(photo_id)? {
            Some(photo) => photo,
            None => bail!("Photo {} not found", photo_id),
        };

        let event = match photo.event_id {
            Some(ref id) => db.get_event(id)?,
            None => None,
        };

        let image = self.services.renditions.resolve(&photo.original_path);
        let detected = self
            .services
            .faces
            .extract_faces(&image)
            .with_context(|| format!("Face extraction failed for {}", image.display()))?;

        let faces = self.match_detected(db, detected, event.as_ref())?;

        let matched = faces.iter().filter(|f| f.matched_member_id.is_some()).count();
        let inserted = db.replace_unconfirmed_faces(photo_id, &faces)?;

        let people = refresh_person_tags(db, photo_id)?;

        info!(photo_id, faces = inserted, matched, people, "Photo rematched");
        Ok(RematchSummary {
            faces: inserted,
            matched,
        })
    }
}

/// Error carried out of a stage: the message that ends up on the queue row.
#[derive(Debug)]
struct IntakeFailure(String);

impl From<anyhow::Error> for IntakeFailure {
    fn from(e: anyhow::Error) -> Self {
        IntakeFailure(format!("{:#}", e))
    }
}

impl From<IntakeError> for IntakeFailure {
    fn from(e: IntakeError) -> Self {
        IntakeFailure(e.to_string())
    }
}

fn people_names(db: &Database, ids: &[String]) -> Result<Vec<String>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let names = db.member_names(ids)?;
    Ok(ids.iter().filter_map(|id| names.get(id).cloned()).collect())
}

/// Person tags for every face attributable without review.
fn person_tags(db: &Database, faces: &[FaceRecord]) -> Result<Vec<Tag>> {
    let mut seen = HashSet::new();
    let ids: Vec<String> = faces
        .iter()
        .filter_map(|f| f.trusted_member_id().map(str::to_string))
        .filter(|id| seen.insert(id.clone()))
        .collect();

    Ok(people_names(db, &ids)?
        .iter()
        .filter_map(|name| sanitize_tag(name))
        .map(|tag| Tag::auto(&tag, TagKind::Person))
        .collect())
}

/// Rebuild a photo's generated person tags from its current faces, after a
/// rematch or a review decision. Returns the number of person tags.
pub fn refresh_person_tags(db: &Database, photo_id: &str) -> Result<usize> {
    let faces = db.faces_for_photo(photo_id)?;
    let tags = person_tags(db, &faces)?;
    db.replace_auto_person_tags(photo_id, &tags)
}

/// Record a review decision for a face and bring the photo's person tags
/// in line with it. Returns false if the face does not exist.
pub fn review_face(
    db: &Database,
    face_id: i64,
    member_id: Option<&str>,
    confirmed_by: &str,
    is_guest: bool,
) -> Result<bool> {
    let face = match db.get_face(face_id)? {
        Some(face) => face,
        None => return Ok(false),
    };
    if !db.confirm_face_identity(face_id, member_id, confirmed_by, is_guest)? {
        return Ok(false);
    }
    refresh_person_tags(db, &face.photo_id)?;
    Ok(true)
}

fn remove_source(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed processed upload"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove processed upload"),
    }
}

#[cfg(test)]
mod tests;
