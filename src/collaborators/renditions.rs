use anyhow::{Context, Result};
use chrono::{NaiveDateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, GenericImageView, ImageDecoder, ImageReader};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{RenditionService, Renditions};
use crate::config::StorageConfig;

const ORIGINALS_DIR: &str = "originals";
const DISPLAY_DIR: &str = "display";
const THUMBS_DIR: &str = "thumbs";

/// Writes JPEG renditions under `{root}/{originals,display,thumbs}/YYYY/MM/{id}.jpg`.
pub struct LocalRenditions {
    root: PathBuf,
    display_size: u32,
    thumbnail_size: u32,
    quality_original: u8,
    quality_display: u8,
    quality_thumb: u8,
}

impl LocalRenditions {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            root: config.root.clone(),
            display_size: config.display_size,
            thumbnail_size: config.thumbnail_size,
            quality_original: config.jpeg_quality_original,
            quality_display: config.jpeg_quality_display,
            quality_thumb: config.jpeg_quality_thumb,
        }
    }

    fn open_oriented(source: &Path) -> Result<DynamicImage> {
        let mut decoder = ImageReader::open(source)?
            .with_guessed_format()?
            .into_decoder()
            .with_context(|| format!("Unsupported image {}", source.display()))?;
        let orientation = decoder.orientation()?;
        let mut img = DynamicImage::from_decoder(decoder)
            .with_context(|| format!("Failed to decode {}", source.display()))?;
        img.apply_orientation(orientation);

        // JPEG has no alpha channel.
        Ok(DynamicImage::ImageRgb8(img.to_rgb8()))
    }

    fn save_jpeg(&self, img: &DynamicImage, relative: &str, quality: u8) -> Result<()> {
        let path = self.resolve(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = File::create(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        let encoder = JpegEncoder::new_with_quality(&mut writer, quality);
        img.write_with_encoder(encoder)
            .with_context(|| format!("Failed to encode {}", path.display()))?;
        Ok(())
    }
}

fn fit_within(img: &DynamicImage, max: u32) -> DynamicImage {
    let (width, height) = img.dimensions();
    if width <= max && height <= max {
        img.clone()
    } else {
        img.thumbnail(max, max)
    }
}

impl RenditionService for LocalRenditions {
    fn create(&self, source: &Path, photo_id: &str, taken_at: Option<NaiveDateTime>) -> Result<Renditions> {
        let img = Self::open_oriented(source)?;
        let (width, height) = img.dimensions();

        let subdir = taken_at
            .unwrap_or_else(|| Utc::now().naive_utc())
            .format("%Y/%m")
            .to_string();
        let filename = format!("{}.jpg", photo_id);
        let original_path = format!("{}/{}/{}", ORIGINALS_DIR, subdir, filename);
        let display_path = format!("{}/{}/{}", DISPLAY_DIR, subdir, filename);
        let thumb_path = format!("{}/{}/{}", THUMBS_DIR, subdir, filename);

        self.save_jpeg(&img, &original_path, self.quality_original)?;
        self.save_jpeg(&fit_within(&img, self.display_size), &display_path, self.quality_display)?;
        self.save_jpeg(&fit_within(&img, self.thumbnail_size), &thumb_path, self.quality_thumb)?;

        let file_size = fs::metadata(self.resolve(&original_path))?.len();
        debug!(photo_id, width, height, file_size, "Renditions written");

        Ok(Renditions {
            original_path,
            display_path,
            thumb_path,
            width,
            height,
            file_size,
        })
    }

    fn remove(&self, renditions: &Renditions) -> Result<()> {
        for relative in [
            &renditions.original_path,
            &renditions.display_path,
            &renditions.thumb_path,
        ] {
            match fs::remove_file(self.resolve(relative)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn resolve(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn service(root: &Path) -> LocalRenditions {
        let config = StorageConfig {
            root: root.to_path_buf(),
            display_size: 64,
            thumbnail_size: 16,
            ..Default::default()
        };
        LocalRenditions::new(&config)
    }

    #[test]
    fn test_create_writes_three_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("upload.png");
        image::RgbaImage::new(200, 100).save(&source).unwrap();

        let storage = service(&dir.path().join("store"));
        let taken = NaiveDate::from_ymd_opt(2025, 9, 15).unwrap().and_hms_opt(8, 0, 0);
        let r = storage.create(&source, "abc", taken).unwrap();

        assert_eq!(r.original_path, "originals/2025/09/abc.jpg");
        assert_eq!(r.thumb_path, "thumbs/2025/09/abc.jpg");
        assert_eq!((r.width, r.height), (200, 100));
        assert!(r.file_size > 0);

        let display = image::open(storage.resolve(&r.display_path)).unwrap();
        assert_eq!(display.dimensions(), (64, 32));
        let thumb = image::open(storage.resolve(&r.thumb_path)).unwrap();
        assert!(thumb.width() <= 16 && thumb.height() <= 16);

        storage.remove(&r).unwrap();
        assert!(!storage.resolve(&r.original_path).exists());
        storage.remove(&r).unwrap();
    }

    #[test]
    fn test_small_images_are_not_upscaled() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("tiny.png");
        image::RgbImage::new(10, 8).save(&source).unwrap();

        let storage = service(&dir.path().join("store"));
        let r = storage.create(&source, "tiny", None).unwrap();
        let display = image::open(storage.resolve(&r.display_path)).unwrap();
        assert_eq!(display.dimensions(), (10, 8));
    }

    #[test]
    fn test_non_image_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("notes.jpg");
        fs::write(&source, b"definitely not a jpeg").unwrap();

        assert!(service(dir.path()).create(&source, "x", None).is_err());
    }
}
