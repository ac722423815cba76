//! Coordinates, distances and the per-process geocode cache.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Great-circle distance in meters (haversine).
    pub fn distance_meters(&self, other: &GeoPoint) -> f64 {
        let lat1 = self.lat.to_radians();
        let lat2 = other.lat.to_radians();
        let delta_lat = (other.lat - self.lat).to_radians();
        let delta_lon = (other.lon - self.lon).to_radians();

        let a = (delta_lat / 2.0).sin().powi(2)
            + lat1.cos() * lat2.cos() * (delta_lon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

        EARTH_RADIUS_METERS * c
    }

    /// Point `meters` due north of this one.
    pub fn offset_north(&self, meters: f64) -> GeoPoint {
        GeoPoint::new(self.lat + (meters / EARTH_RADIUS_METERS).to_degrees(), self.lon)
    }
}

struct CacheInner {
    entries: HashMap<String, Option<GeoPoint>>,
    order: VecDeque<String>,
}

/// Bounded address -> coordinates cache shared by the workers of one
/// process. Failed lookups are stored as `None` so a slow or broken
/// geocoder is not retried for the same address. The oldest entry is
/// evicted once `capacity` is reached.
pub struct GeocodeCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

impl GeocodeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// `Some(result)` when the address has been looked up before.
    pub fn get(&self, address: &str) -> Option<Option<GeoPoint>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.get(address).copied()
    }

    pub fn insert(&self, address: &str, point: Option<GeoPoint>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if inner.entries.insert(address.to_string(), point).is_none() {
            inner.order.push_back(address.to_string());
        }

        while inner.entries.len() > self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for GeocodeCache {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_meters() {
        let here = GeoPoint::new(44.0521, -123.0868);
        assert!(here.distance_meters(&here) < 1e-6);

        let north = here.offset_north(300.0);
        assert!((here.distance_meters(&north) - 300.0).abs() < 0.5);

        // One degree of latitude is about 111 km.
        let degree = GeoPoint::new(45.0521, -123.0868);
        let d = here.distance_meters(&degree);
        assert!((d - 111_195.0).abs() < 100.0);
    }

    #[test]
    fn test_cache_remembers_failures() {
        let cache = GeocodeCache::new(10);
        assert_eq!(cache.get("Nowhere"), None);

        cache.insert("Nowhere", None);
        cache.insert("Park", Some(GeoPoint::new(1.0, 2.0)));

        assert_eq!(cache.get("Nowhere"), Some(None));
        assert_eq!(cache.get("Park"), Some(Some(GeoPoint::new(1.0, 2.0))));
    }

    #[test]
    fn test_cache_evicts_oldest() {
        let cache = GeocodeCache::new(2);
        cache.insert("a", None);
        cache.insert("b", None);
        cache.insert("a", Some(GeoPoint::new(0.0, 0.0)));
        cache.insert("c", None);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), None);
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }
}
