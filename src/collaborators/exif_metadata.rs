use anyhow::Result;
use chrono::{NaiveDate, NaiveDateTime};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use super::{MetadataExtractor, PhotoMetadata};
use crate::matching::GeoPoint;

/// Reads capture time, GPS and camera fields from EXIF, and pixel
/// dimensions from the image header.
pub struct ExifMetadataExtractor;

impl MetadataExtractor for ExifMetadataExtractor {
    fn extract(&self, path: &Path) -> Result<PhotoMetadata> {
        let mut metadata = PhotoMetadata::default();

        if let Ok(reader) = image::ImageReader::open(path) {
            if let Ok(reader) = reader.with_guessed_format() {
                if let Ok((width, height)) = reader.into_dimensions() {
                    metadata.width = Some(width);
                    metadata.height = Some(height);
                }
            }
        }

        let file = File::open(path)?;
        let mut bufreader = BufReader::new(file);
        let exif = match exif::Reader::new().read_from_container(&mut bufreader) {
            Ok(exif) => exif,
            // No EXIF block is common (screenshots, stripped uploads).
            Err(_) => return Ok(metadata),
        };

        metadata.camera_make = text_field(&exif, exif::Tag::Make);
        metadata.camera_model = text_field(&exif, exif::Tag::Model);

        metadata.taken_at = [
            exif::Tag::DateTimeOriginal,
            exif::Tag::DateTimeDigitized,
            exif::Tag::DateTime,
        ]
        .iter()
        .filter_map(|tag| text_field(&exif, *tag))
        .find_map(|value| parse_exif_datetime(&value));

        metadata.gps = gps_point(&exif);

        Ok(metadata)
    }
}

fn text_field(exif: &exif::Exif, tag: exif::Tag) -> Option<String> {
    exif.get_field(tag, exif::In::PRIMARY)
        .map(|field| field.display_value().to_string().trim_matches('"').trim().to_string())
        .filter(|s| !s.is_empty())
}

fn gps_point(exif: &exif::Exif) -> Option<GeoPoint> {
    let lat_field = exif.get_field(exif::Tag::GPSLatitude, exif::In::PRIMARY)?;
    let lat_ref = exif.get_field(exif::Tag::GPSLatitudeRef, exif::In::PRIMARY)?;
    let lon_field = exif.get_field(exif::Tag::GPSLongitude, exif::In::PRIMARY)?;
    let lon_ref = exif.get_field(exif::Tag::GPSLongitudeRef, exif::In::PRIMARY)?;

    let (lat_vals, lon_vals) = match (&lat_field.value, &lon_field.value) {
        (exif::Value::Rational(lat), exif::Value::Rational(lon)) if lat.len() >= 3 && lon.len() >= 3 => {
            (lat, lon)
        }
        _ => return None,
    };

    let lat = dms_to_decimal(
        lat_vals[0].to_f64(),
        lat_vals[1].to_f64(),
        lat_vals[2].to_f64(),
    );
    let lon = dms_to_decimal(
        lon_vals[0].to_f64(),
        lon_vals[1].to_f64(),
        lon_vals[2].to_f64(),
    );
    if !lat.is_finite() || !lon.is_finite() {
        return None;
    }

    let lat = if lat_ref.display_value().to_string().contains('S') { -lat } else { lat };
    let lon = if lon_ref.display_value().to_string().contains('W') { -lon } else { lon };

    Some(GeoPoint::new(lat, lon))
}

fn dms_to_decimal(degrees: f64, minutes: f64, seconds: f64) -> f64 {
    degrees + minutes / 60.0 + seconds / 3600.0
}

/// Parse the timestamp layouts seen in EXIF in the wild. Date-only
/// values resolve to midnight.
pub fn parse_exif_datetime(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    for fmt in ["%Y:%m:%d %H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(ts);
        }
    }
    for fmt in ["%Y:%m:%d", "%Y-%m-%d"] {
        if let Ok(day) = NaiveDate::parse_from_str(value, fmt) {
            return day.and_hms_opt(0, 0, 0);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_exif_datetime_layouts() {
        let expected = NaiveDate::from_ymd_opt(2025, 11, 5)
            .unwrap()
            .and_hms_opt(9, 15, 0)
            .unwrap();
        assert_eq!(parse_exif_datetime("2025:11:05 09:15:00"), Some(expected));
        assert_eq!(parse_exif_datetime(" 2025-11-05T09:15:00 "), Some(expected));
        assert_eq!(
            parse_exif_datetime("2025:11:05"),
            NaiveDate::from_ymd_opt(2025, 11, 5).unwrap().and_hms_opt(0, 0, 0)
        );
        assert_eq!(parse_exif_datetime("0000:00:00 00:00:00"), None);
    }

    #[test]
    fn test_dms_to_decimal() {
        assert!((dms_to_decimal(44.0, 3.0, 0.0) - 44.05).abs() < 1e-9);
    }

    #[test]
    fn test_image_without_exif_still_reports_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.png");
        image::RgbImage::new(40, 30).save(&path).unwrap();

        let metadata = ExifMetadataExtractor.extract(&path).unwrap();
        assert_eq!(metadata.width, Some(40));
        assert_eq!(metadata.height, Some(30));
        assert_eq!(metadata.taken_at, None);
        assert_eq!(metadata.gps, None);
    }

    #[test]
    fn test_unreadable_file_is_an_error() {
        assert!(ExifMetadataExtractor
            .extract(Path::new("/no/such/file.jpg"))
            .is_err());
    }
}
