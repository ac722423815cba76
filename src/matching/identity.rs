//! Face identity matching against the members' reference embeddings.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::config::FaceMatchConfig;
use crate::db::{Database, KnownEmbedding};
use crate::faces::Embedding;

/// One ranked member suggestion for a face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub member_id: String,
    pub distance: f32,
    /// Display percentage: 100 at distance 0, 0 at the zero-confidence distance.
    pub confidence: f32,
    pub is_registered: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdentityMatch {
    pub matched_member_id: Option<String>,
    /// `1 - distance` of the top candidate.
    pub confidence: Option<f32>,
    pub rank: Option<u32>,
    pub candidates: Vec<Candidate>,
    pub is_high_confidence: bool,
}

/// Linear 0..100 scale rounded to one decimal.
pub fn display_confidence(distance: f32, zero_at: f32) -> f32 {
    if distance >= zero_at {
        return 0.0;
    }
    ((1.0 - distance / zero_at) * 1000.0).round() / 10.0
}

pub struct IdentityMatcher {
    pool: Vec<KnownEmbedding>,
    config: FaceMatchConfig,
}

impl IdentityMatcher {
    pub fn new(pool: Vec<KnownEmbedding>, config: FaceMatchConfig) -> Self {
        Self { pool, config }
    }

    /// Load the embedding pool. With `registered` given and narrowing on,
    /// only those members are loaded; an empty narrowed pool falls back to
    /// everyone.
    pub fn load(db: &Database, config: &FaceMatchConfig, registered: Option<&[String]>) -> Result<Self> {
        let narrowed = match registered {
            Some(ids) if config.narrow_to_registered && !ids.is_empty() => {
                let pool = db.load_member_embeddings(Some(ids))?;
                if pool.is_empty() {
                    debug!("No embeddings for registered attendees, using full pool");
                    None
                } else {
                    Some(pool)
                }
            }
            _ => None,
        };

        let pool = match narrowed {
            Some(pool) => pool,
            None => db.load_member_embeddings(None)?,
        };

        debug!(embeddings = pool.len(), "Loaded member embeddings");
        Ok(Self::new(pool, config.clone()))
    }

    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }

    pub fn match_face(
        &self,
        embedding: &Embedding,
        is_public_event: bool,
        registered: Option<&HashSet<String>>,
    ) -> IdentityMatch {
        if self.pool.is_empty() {
            return IdentityMatch::default();
        }

        let is_registered = |id: &str| registered.map(|r| r.contains(id)).unwrap_or(false);

        let mut candidates: Vec<Candidate> = Vec::with_capacity(self.pool.len());
        for known in &self.pool {
            let distance = match embedding.distance(&known.embedding) {
                Some(d) => d,
                None => {
                    warn!(
                        member_id = %known.member_id,
                        expected = embedding.dim(),
                        found = known.embedding.dim(),
                        "Skipping embedding with mismatched dimension"
                    );
                    continue;
                }
            };
            candidates.push(Candidate {
                member_id: known.member_id.clone(),
                distance,
                confidence: display_confidence(distance, self.config.zero_confidence_distance),
                is_registered: is_registered(&known.member_id),
            });
        }

        if candidates.is_empty() {
            return IdentityMatch::default();
        }

        // Stable: equal distances keep load order.
        candidates.sort_by(|a, b| a.distance.total_cmp(&b.distance));

        let best_overall = candidates[0].distance;
        let best_registered = candidates
            .iter()
            .find(|c| c.is_registered)
            .map(|c| c.distance);
        if let Some(best_registered) = best_registered {
            if best_registered <= self.config.medium_confidence
                && best_registered <= best_overall + self.config.rsvp_priority_window
            {
                let (mut promoted, rest): (Vec<_>, Vec<_>) =
                    candidates.into_iter().partition(|c| c.is_registered);
                promoted.extend(rest);
                candidates = promoted;
            }
        }

        let top_distance = candidates[0].distance;
        let high_threshold = if is_public_event {
            self.config.public_event_threshold
        } else {
            self.config.high_confidence
        };

        let (matched_member_id, rank) = if top_distance <= self.config.medium_confidence {
            (Some(candidates[0].member_id.clone()), Some(1))
        } else {
            (None, None)
        };

        candidates.truncate(self.config.max_candidates);

        IdentityMatch {
            matched_member_id,
            confidence: Some(1.0 - top_distance),
            rank,
            candidates,
            is_high_confidence: top_distance <= high_threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::EmbeddingSource;

    fn known(member_id: &str, values: Vec<f32>) -> KnownEmbedding {
        KnownEmbedding {
            member_id: member_id.to_string(),
            embedding: Embedding::new(values).unwrap(),
            source: EmbeddingSource::Directory,
            quality_score: None,
        }
    }

    fn probe() -> Embedding {
        Embedding::new(vec![0.0, 0.0]).unwrap()
    }

    fn registered(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_empty_pool_is_not_an_error() {
        let matcher = IdentityMatcher::new(Vec::new(), FaceMatchConfig::default());
        let result = matcher.match_face(&probe(), false, None);

        assert_eq!(result.matched_member_id, None);
        assert!(result.candidates.is_empty());
        assert!(!result.is_high_confidence);
        assert_eq!(result.confidence, None);
    }

    #[test]
    fn test_accepts_at_medium_threshold_only() {
        let config = FaceMatchConfig::default();

        let at_threshold = IdentityMatcher::new(vec![known("m1", vec![0.5, 0.0])], config.clone());
        let result = at_threshold.match_face(&probe(), false, None);
        assert_eq!(result.matched_member_id.as_deref(), Some("m1"));
        assert_eq!(result.rank, Some(1));
        assert!(!result.is_high_confidence);

        let beyond = IdentityMatcher::new(vec![known("m1", vec![0.5001, 0.0])], config);
        let result = beyond.match_face(&probe(), false, None);
        assert_eq!(result.matched_member_id, None);
        assert_eq!(result.rank, None);
        assert_eq!(result.candidates.len(), 1);
    }

    #[test]
    fn test_public_events_use_stricter_high_confidence() {
        let matcher = IdentityMatcher::new(
            vec![known("m1", vec![0.38, 0.0])],
            FaceMatchConfig::default(),
        );

        assert!(matcher.match_face(&probe(), false, None).is_high_confidence);
        let public = matcher.match_face(&probe(), true, None);
        assert!(!public.is_high_confidence);
        assert_eq!(public.matched_member_id.as_deref(), Some("m1"));
        assert!((public.confidence.unwrap() - 0.62).abs() < 1e-6);
    }

    #[test]
    fn test_registered_attendee_promoted_when_close() {
        let matcher = IdentityMatcher::new(
            vec![
                known("stranger", vec![0.30, 0.0]),
                known("attendee", vec![0.35, 0.0]),
                known("other", vec![0.32, 0.0]),
            ],
            FaceMatchConfig::default(),
        );

        let result = matcher.match_face(&probe(), false, Some(&registered(&["attendee"])));
        let order: Vec<&str> = result.candidates.iter().map(|c| c.member_id.as_str()).collect();
        assert_eq!(order, vec!["attendee", "stranger", "other"]);
        assert_eq!(result.matched_member_id.as_deref(), Some("attendee"));
        assert!(result.candidates[0].is_registered);
    }

    #[test]
    fn test_clearly_better_stranger_is_not_overridden() {
        let matcher = IdentityMatcher::new(
            vec![
                known("stranger", vec![0.20, 0.0]),
                known("attendee", vec![0.45, 0.0]),
            ],
            FaceMatchConfig::default(),
        );

        let result = matcher.match_face(&probe(), false, Some(&registered(&["attendee"])));
        assert_eq!(result.matched_member_id.as_deref(), Some("stranger"));
        assert_eq!(result.candidates[1].member_id, "attendee");
    }

    #[test]
    fn test_candidates_sorted_truncated_and_ties_keep_load_order() {
        let pool = vec![
            known("f", vec![0.9, 0.0]),
            known("tie_a", vec![0.1, 0.0]),
            known("tie_b", vec![0.1, 0.0]),
            known("c", vec![0.3, 0.0]),
            known("d", vec![0.4, 0.0]),
            known("e", vec![0.6, 0.0]),
            known("wrong_dim", vec![0.0, 0.0, 0.0]),
        ];
        let matcher = IdentityMatcher::new(pool, FaceMatchConfig::default());
        let result = matcher.match_face(&probe(), false, None);

        let order: Vec<&str> = result.candidates.iter().map(|c| c.member_id.as_str()).collect();
        assert_eq!(order, vec!["tie_a", "tie_b", "c", "d", "e"]);
        assert_eq!(result.candidates[4].confidence, 0.0);
        assert_eq!(result.candidates[0].confidence, 83.3);
    }

    #[test]
    fn test_display_confidence_scale() {
        assert_eq!(display_confidence(0.0, 0.6), 100.0);
        assert_eq!(display_confidence(0.3, 0.6), 50.0);
        assert_eq!(display_confidence(0.6, 0.6), 0.0);
        assert_eq!(display_confidence(0.9, 0.6), 0.0);
    }

    #[test]
    fn test_load_narrows_to_registered_with_fallback() {
        let db = Database::open_in_memory().unwrap();
        for id in ["m1", "m2", "m3"] {
            db.upsert_member(&crate::db::Member::new(id, id)).unwrap();
        }
        let emb = Embedding::new(vec![0.1, 0.2]).unwrap();
        db.add_member_embedding("m1", &emb, EmbeddingSource::Directory, None).unwrap();
        db.add_member_embedding("m2", &emb, EmbeddingSource::Directory, None).unwrap();

        let config = FaceMatchConfig::default();
        let narrowed = IdentityMatcher::load(&db, &config, Some(&["m2".to_string()])).unwrap();
        assert_eq!(narrowed.pool_size(), 1);

        let fallback = IdentityMatcher::load(&db, &config, Some(&["m3".to_string()])).unwrap();
        assert_eq!(fallback.pool_size(), 2);

        let everyone = IdentityMatcher::load(&db, &config, None).unwrap();
        assert_eq!(everyone.pool_size(), 2);
    }
}
