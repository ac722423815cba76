use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

use super::{MetadataWriter, PhotoSummary};

/// Embeds keywords, people and event details into the stored original
/// by shelling out to `exiftool`.
pub struct ExiftoolWriter;

fn clean(value: &str) -> String {
    value.replace(['"', '\''], "")
}

/// Argument list for one exiftool invocation, without the program name.
pub fn exiftool_args(asset: &Path, summary: &PhotoSummary) -> Vec<String> {
    let mut args = vec![
        "-overwrite_original".to_string(),
        "-ignoreMinorErrors".to_string(),
    ];

    for keyword in &summary.keywords {
        let keyword = clean(keyword);
        args.push(format!("-IPTC:Keywords={}", keyword));
        args.push(format!("-XMP:Subject={}", keyword));
    }

    for person in &summary.people {
        args.push(format!("-XMP:PersonInImage={}", clean(person)));
    }

    if let Some(ref event) = summary.event_name {
        let event = clean(event);
        args.push(format!("-IPTC:Headline={}", event));
        args.push(format!("-IPTC:Caption-Abstract={}", summary.description()));
        args.push(format!("-XMP:Description={}", summary.description()));
    }

    if let Some(date) = summary.event_date {
        args.push(format!("-IPTC:DateCreated={}", date.format("%Y:%m:%d")));
    }

    if let Some(ref location) = summary.location {
        let location = clean(location);
        args.push(format!("-IPTC:Sub-location={}", location));
        args.push(format!("-XMP:Location={}", location));
    }

    if let Some(ref submitter) = summary.submitted_by {
        let submitter = clean(submitter);
        args.push(format!("-IPTC:Credit={}", submitter));
        args.push(format!("-XMP:Credit={}", submitter));
    }

    if let Some(ref email) = summary.submitter_email {
        args.push(format!("-XMP-iptcCore:CreatorContactInfoCiEmailWork={}", clean(email)));
    }

    if let Some(ref source) = summary.source {
        let source = clean(source);
        args.push(format!("-IPTC:Source={}", source));
        args.push(format!("-XMP:Source={}", source));
    }

    args.push(asset.to_string_lossy().to_string());
    args
}

impl MetadataWriter for ExiftoolWriter {
    fn write(&self, asset: &Path, summary: &PhotoSummary) -> Result<()> {
        if !asset.exists() {
            bail!("Stored original not found: {}", asset.display());
        }

        let output = Command::new("exiftool")
            .args(exiftool_args(asset, summary))
            .output()
            .context("Failed to run exiftool")?;

        if !output.status.success() {
            warn!(
                path = %asset.display(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "exiftool reported a problem"
            );
        } else {
            debug!(path = %asset.display(), "Wrote embedded metadata");
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "exiftool"
    }
}

/// Writes the summary as `<asset>.json` beside the stored original.
pub struct SidecarWriter;

impl SidecarWriter {
    pub fn sidecar_path(asset: &Path) -> PathBuf {
        let mut name = asset.as_os_str().to_os_string();
        name.push(".json");
        PathBuf::from(name)
    }
}

impl MetadataWriter for SidecarWriter {
    fn write(&self, asset: &Path, summary: &PhotoSummary) -> Result<()> {
        let path = Self::sidecar_path(asset);
        let json = serde_json::to_string_pretty(summary)?;
        fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        debug!(path = %path.display(), "Wrote metadata sidecar");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "sidecar"
    }
}

pub struct DisabledMetadataWriter;

impl MetadataWriter for DisabledMetadataWriter {
    fn write(&self, _asset: &Path, _summary: &PhotoSummary) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "disabled"
    }
}
