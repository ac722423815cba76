pub mod event;
pub mod geocode;
pub mod identity;

pub use event::{EventMatch, EventMatcher, ScoreBasis};
pub use geocode::{GeoPoint, GeocodeCache};
pub use identity::{display_confidence, Candidate, IdentityMatch, IdentityMatcher};
