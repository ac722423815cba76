//! Photo to event matching.
//!
//! Candidates are the events whose day range, widened by the configured
//! window, contains the capture date. Each is scored on date alone, or on
//! GPS distance when both sides have coordinates, plus a boost when the
//! submitter registered for it.

use anyhow::Result;
use chrono::NaiveDateTime;
use serde::Serialize;
use tracing::{debug, warn};

use super::geocode::{GeoPoint, GeocodeCache};
use crate::collaborators::Geocoder;
use crate::config::EventMatchConfig;
use crate::db::{Database, Event};

/// Why a candidate scored what it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreBasis {
    Date,
    GpsHigh,
    GpsMedium,
    GpsLow,
}

impl ScoreBasis {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScoreBasis::Date => "date",
            ScoreBasis::GpsHigh => "gps_high",
            ScoreBasis::GpsMedium => "gps_medium",
            ScoreBasis::GpsLow => "gps_low",
        }
    }
}

pub const METHOD_SUBMITTER_RSVP: &str = "submitter_rsvp";
pub const METHOD_NONE: &str = "none";

#[derive(Debug, Clone, Serialize)]
pub struct EventMatch {
    #[serde(skip)]
    pub event: Option<Event>,
    pub confidence: f64,
    pub method: String,
    /// Set when nothing matched.
    pub reason: Option<String>,
}

impl EventMatch {
    fn matched(event: Event, confidence: f64, method: String) -> Self {
        Self {
            event: Some(event),
            confidence,
            method,
            reason: None,
        }
    }

    fn none(reason: &str) -> Self {
        Self {
            event: None,
            confidence: 0.0,
            method: METHOD_NONE.to_string(),
            reason: Some(reason.to_string()),
        }
    }

    pub fn is_match(&self) -> bool {
        self.event.is_some()
    }

    pub fn event_id(&self) -> Option<&str> {
        self.event.as_ref().map(|e| e.id.as_str())
    }

    pub fn event_name(&self) -> Option<&str> {
        self.event.as_ref().map(|e| e.name.as_str())
    }
}

pub struct EventMatcher<'a> {
    db: &'a Database,
    config: &'a EventMatchConfig,
    geocoder: &'a dyn Geocoder,
    cache: &'a GeocodeCache,
    region_hint: Option<&'a str>,
}

impl<'a> EventMatcher<'a> {
    pub fn new(
        db: &'a Database,
        config: &'a EventMatchConfig,
        geocoder: &'a dyn Geocoder,
        cache: &'a GeocodeCache,
    ) -> Self {
        Self {
            db,
            config,
            geocoder,
            cache,
            region_hint: None,
        }
    }

    /// Appended to addresses that do not mention it before geocoding.
    pub fn with_region_hint(mut self, hint: Option<&'a str>) -> Self {
        self.region_hint = hint;
        self
    }

    pub fn find_matching_event(
        &self,
        taken_at: Option<NaiveDateTime>,
        gps: Option<GeoPoint>,
        submitter_id: Option<&str>,
    ) -> Result<EventMatch> {
        let taken_at = match taken_at {
            Some(ts) => ts,
            None => return Ok(EventMatch::none("No photo datetime available")),
        };

        let candidates = self
            .db
            .events_in_window(taken_at.date(), self.config.window_days)?;
        if candidates.is_empty() {
            return Ok(EventMatch::none("No events found for this date"));
        }

        let mut best: Option<(usize, f64, String)> = None;
        for (idx, event) in candidates.iter().enumerate() {
            let (score, method) = self.score_event(event, gps, submitter_id)?;
            debug!(event_id = %event.id, score, method = %method, "Scored event candidate");

            let better = match &best {
                Some((_, best_score, _)) => score > *best_score,
                None => score > 0.0,
            };
            if better {
                best = Some((idx, score, method));
            }
        }

        if let Some((idx, score, method)) = best {
            if score >= self.config.min_confidence {
                return Ok(EventMatch::matched(candidates[idx].clone(), score, method));
            }
        }

        if let Some(member_id) = submitter_id {
            for event in &candidates {
                if self.db.is_registered(&event.id, member_id)? {
                    return Ok(EventMatch::matched(
                        event.clone(),
                        self.config.rsvp_fallback_confidence,
                        METHOD_SUBMITTER_RSVP.to_string(),
                    ));
                }
            }
        }

        Ok(EventMatch::none("No confident match found"))
    }

    /// Score one candidate. Returns the score and its method label.
    pub fn score_event(
        &self,
        event: &Event,
        gps: Option<GeoPoint>,
        submitter_id: Option<&str>,
    ) -> Result<(f64, String)> {
        let mut score = self.config.date_score;
        let mut basis = ScoreBasis::Date;

        if let Some(photo_point) = gps {
            if let Some(event_point) = self.event_coordinates(event) {
                let distance = photo_point.distance_meters(&event_point);
                let (s, b) = self.score_distance(distance);
                score = s;
                basis = b;
            }
        }

        let mut method = basis.as_str().to_string();
        if let Some(member_id) = submitter_id {
            if self.db.is_registered(&event.id, member_id)? {
                score = (score + self.config.rsvp_boost).min(self.config.score_cap);
                method.push_str("+rsvp");
            }
        }

        Ok((score, method))
    }

    pub fn score_distance(&self, distance_meters: f64) -> (f64, ScoreBasis) {
        if distance_meters <= self.config.high_confidence_meters {
            (self.config.gps_high_score, ScoreBasis::GpsHigh)
        } else if distance_meters <= self.config.medium_confidence_meters {
            (self.config.gps_medium_score, ScoreBasis::GpsMedium)
        } else {
            (self.config.gps_low_score, ScoreBasis::GpsLow)
        }
    }

    /// Stored coordinates, else a geocoded address. Lookup failures are
    /// cached and treated as "no coordinates".
    fn event_coordinates(&self, event: &Event) -> Option<GeoPoint> {
        if let Some((lat, lon)) = event.coordinates() {
            return Some(GeoPoint::new(lat, lon));
        }

        let address = event
            .location_address
            .as_deref()
            .or(event.location_name.as_deref())
            .filter(|a| !a.trim().is_empty())?;

        if let Some(cached) = self.cache.get(address) {
            return cached;
        }

        let query = match self.region_hint {
            Some(hint) if !address.to_lowercase().contains(&hint.to_lowercase()) => {
                format!("{}, {}", address, hint)
            }
            _ => address.to_string(),
        };

        let point = match self.geocoder.geocode(&query) {
            Ok(point) => point,
            Err(e) => {
                warn!(event_id = %event.id, address = %query, error = %e, "Geocoding failed");
                None
            }
        };

        self.cache.insert(address, point);

        if let Some(p) = point {
            if let Err(e) = self.db.update_event_coordinates(&event.id, p.lat, p.lon) {
                warn!(event_id = %event.id, error = %e, "Failed to store event coordinates");
            }
        }

        point
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Member;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedGeocoder {
        point: Option<GeoPoint>,
        fail: bool,
        calls: AtomicUsize,
    }

    impl FixedGeocoder {
        fn returning(point: Option<GeoPoint>) -> Self {
            Self {
                point,
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                point: None,
                fail: true,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl Geocoder for FixedGeocoder {
        fn geocode(&self, _address: &str) -> Result<Option<GeoPoint>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("timed out");
            }
            Ok(self.point)
        }

        fn name(&self) -> &'static str {
            "fixed"
        }
    }

    fn venue() -> GeoPoint {
        GeoPoint::new(44.0452, -123.0228)
    }

    fn at(d: u32, h: u32, m: u32) -> NaiveDateTime {
        chrono::NaiveDate::from_ymd_opt(2025, 9, d)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn setup() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.upsert_member(&Member::new("sub", "Sam Submitter")).unwrap();
        let mut event = Event::new("e1", "Fall Picnic", at(15, 11, 0));
        event.location_lat = Some(venue().lat);
        event.location_lon = Some(venue().lon);
        db.upsert_event(&event).unwrap();
        db
    }

    fn run(
        db: &Database,
        taken_at: Option<NaiveDateTime>,
        gps: Option<GeoPoint>,
        submitter: Option<&str>,
    ) -> EventMatch {
        let config = EventMatchConfig::default();
        let geocoder = FixedGeocoder::returning(None);
        let cache = GeocodeCache::new(16);
        EventMatcher::new(db, &config, &geocoder, &cache)
            .find_matching_event(taken_at, gps, submitter)
            .unwrap()
    }

    #[test]
    fn test_gps_near_registered_submitter() {
        let db = setup();
        db.add_registration("e1", "sub", None).unwrap();

        let result = run(&db, Some(at(15, 14, 30)), Some(venue().offset_north(300.0)), Some("sub"));

        assert_eq!(result.event_id(), Some("e1"));
        assert!(result.confidence >= 0.95);
        assert_eq!(result.method, "gps_high+rsvp");
    }

    #[test]
    fn test_date_only_match_for_unregistered_submitter() {
        let db = setup();
        let result = run(&db, Some(at(15, 14, 30)), None, Some("sub"));

        assert_eq!(result.event_id(), Some("e1"));
        assert!((result.confidence - 0.5).abs() < 1e-9);
        assert_eq!(result.method, "date");
        assert_eq!(result.event_name(), Some("Fall Picnic"));
    }

    #[test]
    fn test_distance_scores_are_monotonic() {
        let db = setup();
        let config = EventMatchConfig::default();
        let geocoder = FixedGeocoder::returning(None);
        let cache = GeocodeCache::new(16);
        let matcher = EventMatcher::new(&db, &config, &geocoder, &cache);

        let mut last = f64::INFINITY;
        for meters in [0.0, 100.0, 500.0, 501.0, 1500.0, 2000.0, 2001.0, 5000.0, 50_000.0] {
            let (score, _) = matcher.score_distance(meters);
            assert!(score <= last, "score rose at {} m", meters);
            last = score;
        }

        let event = db.get_event("e1").unwrap().unwrap();
        let score_at = |m: f64| {
            matcher
                .score_event(&event, Some(venue().offset_north(m)), None)
                .unwrap()
        };
        assert_eq!(score_at(100.0).1, "gps_high");
        assert_eq!(score_at(1500.0).1, "gps_medium");
        assert_eq!(score_at(5000.0).1, "gps_low");
        assert!(score_at(100.0).0 >= score_at(1500.0).0);
        assert!(score_at(1500.0).0 >= score_at(5000.0).0);
    }

    #[test]
    fn test_no_timestamp_and_no_events() {
        let db = setup();
        let result = run(&db, None, None, None);
        assert!(!result.is_match());
        assert_eq!(result.reason.as_deref(), Some("No photo datetime available"));

        let result = run(&db, Some(at(25, 12, 0)), None, None);
        assert!(!result.is_match());
        assert_eq!(result.reason.as_deref(), Some("No events found for this date"));
        assert_eq!(result.method, METHOD_NONE);
    }

    #[test]
    fn test_below_floor_falls_back_to_submitter_rsvp() {
        let db = setup();
        db.add_registration("e1", "sub", None).unwrap();

        let config = EventMatchConfig {
            min_confidence: 0.99,
            ..Default::default()
        };
        let geocoder = FixedGeocoder::returning(None);
        let cache = GeocodeCache::new(16);
        let matcher = EventMatcher::new(&db, &config, &geocoder, &cache);

        let far = venue().offset_north(10_000.0);
        let result = matcher
            .find_matching_event(Some(at(15, 12, 0)), Some(far), Some("sub"))
            .unwrap();
        assert_eq!(result.event_id(), Some("e1"));
        assert_eq!(result.method, METHOD_SUBMITTER_RSVP);
        assert!((result.confidence - 0.6).abs() < 1e-9);

        let result = matcher
            .find_matching_event(Some(at(15, 12, 0)), Some(far), None)
            .unwrap();
        assert!(!result.is_match());
        assert_eq!(result.reason.as_deref(), Some("No confident match found"));
    }

    #[test]
    fn test_first_candidate_wins_ties() {
        let db = setup();
        db.upsert_event(&Event::new("e2", "Evening Social", at(15, 18, 0))).unwrap();

        let result = run(&db, Some(at(15, 12, 0)), None, None);
        assert_eq!(result.event_id(), Some("e1"));
    }

    #[test]
    fn test_geocodes_once_and_persists_coordinates() {
        let db = Database::open_in_memory().unwrap();
        let mut event = Event::new("e1", "Hike", at(15, 9, 0));
        event.location_address = Some("Spencer Butte Trailhead".to_string());
        db.upsert_event(&event).unwrap();

        let config = EventMatchConfig::default();
        let geocoder = FixedGeocoder::returning(Some(venue()));
        let cache = GeocodeCache::new(16);
        let matcher = EventMatcher::new(&db, &config, &geocoder, &cache)
            .with_region_hint(Some("Eugene, OR"));

        let result = matcher
            .find_matching_event(Some(at(15, 10, 0)), Some(venue()), None)
            .unwrap();
        assert_eq!(result.method, "gps_high");
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            db.get_event("e1").unwrap().unwrap().coordinates(),
            Some((venue().lat, venue().lon))
        );
    }

    #[test]
    fn test_geocoder_failure_is_cached_and_falls_back_to_date() {
        let db = Database::open_in_memory().unwrap();
        let mut event = Event::new("e1", "Hike", at(15, 9, 0));
        event.location_name = Some("Mystery Spot".to_string());
        db.upsert_event(&event).unwrap();

        let config = EventMatchConfig::default();
        let geocoder = FixedGeocoder::failing();
        let cache = GeocodeCache::new(16);
        let matcher = EventMatcher::new(&db, &config, &geocoder, &cache);

        for _ in 0..3 {
            let result = matcher
                .find_matching_event(Some(at(15, 10, 0)), Some(venue()), None)
                .unwrap();
            assert_eq!(result.method, "date");
        }
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get("Mystery Spot"), Some(None));
    }
}
