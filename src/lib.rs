//! Photo submission intake: deduplicates incoming photos, matches them to
//! events and known members, and catalogues them for review.

pub mod collaborators;
pub mod config;
pub mod db;
pub mod error;
pub mod export;
pub mod faces;
pub mod fingerprint;
pub mod logging;
pub mod matching;
pub mod naming;
pub mod pipeline;
pub mod tags;
