use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::Geocoder;
use crate::config::GeocodingConfig;
use crate::matching::GeoPoint;

/// Forward geocoding against a Nominatim-compatible search endpoint.
pub struct NominatimGeocoder {
    endpoint: String,
    user_agent: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    lat: String,
    lon: String,
}

impl NominatimGeocoder {
    pub fn new(config: &GeocodingConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            user_agent: config.user_agent.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

fn first_point(results: &[SearchResult]) -> Option<GeoPoint> {
    let first = results.first()?;
    let lat = first.lat.trim().parse::<f64>().ok()?;
    let lon = first.lon.trim().parse::<f64>().ok()?;
    Some(GeoPoint::new(lat, lon))
}

impl Geocoder for NominatimGeocoder {
    fn geocode(&self, address: &str) -> Result<Option<GeoPoint>> {
        let agent = ureq::AgentBuilder::new()
            .timeout(self.timeout)
            .user_agent(&self.user_agent)
            .build();

        let response = agent
            .get(&self.endpoint)
            .query("q", address)
            .query("format", "json")
            .query("limit", "1")
            .call()
            .map_err(|e| anyhow!("Geocoding request failed: {}", e))?;

        let results: Vec<SearchResult> = response
            .into_json()
            .map_err(|e| anyhow!("Failed to parse geocoding response: {}", e))?;

        let point = first_point(&results);
        debug!(address, found = point.is_some(), "Geocoded address");
        Ok(point)
    }

    fn name(&self) -> &'static str {
        "nominatim"
    }
}

pub struct DisabledGeocoder;

impl Geocoder for DisabledGeocoder {
    fn geocode(&self, _address: &str) -> Result<Option<GeoPoint>> {
        Ok(None)
    }

    fn name(&self) -> &'static str {
        "disabled"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_point_parses_string_coordinates() {
        let results: Vec<SearchResult> =
            serde_json::from_str(r#"[{"lat": "44.0462", "lon": "-123.0220", "display_name": "x"}]"#).unwrap();
        let point = first_point(&results).unwrap();
        assert!((point.lat - 44.0462).abs() < 1e-9);
        assert!((point.lon + 123.022).abs() < 1e-9);
    }

    #[test]
    fn test_first_point_empty_or_garbage() {
        assert_eq!(first_point(&[]), None);
        let results = vec![SearchResult {
            lat: "north".to_string(),
            lon: "1.0".to_string(),
        }];
        assert_eq!(first_point(&results), None);
    }

    #[test]
    fn test_disabled_geocoder_knows_nothing() {
        assert_eq!(DisabledGeocoder.geocode("1 Main St").unwrap(), None);
    }
}
