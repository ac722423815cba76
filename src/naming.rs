//! Export filenames: `{YYYYMMDD}_{HHMMSS}_{INITIALS}_{shortid}.{ext}`,
//! e.g. `20250915_143022_JD_a7b3.jpg`.

use chrono::{Local, NaiveDate, NaiveDateTime};
use sha2::{Digest, Sha256};
use std::path::Path;

const SHORT_ID_LEN: usize = 4;

/// Up to two uppercase initials: first and last word, or the first two
/// letters of a single name. `XX` when unknown.
pub fn initials(name: Option<&str>) -> String {
    let words: Vec<&str> = name.unwrap_or("").split_whitespace().collect();

    let raw: String = match words.as_slice() {
        [] => return "XX".to_string(),
        [single] => single.chars().take(2).collect(),
        [first, .., last] => first.chars().take(1).chain(last.chars().take(1)).collect(),
    };

    raw.to_uppercase().chars().take(2).collect()
}

fn short_id(photo_id: Option<&str>, original_name: &str) -> String {
    let from_id: String = photo_id
        .map(|id| {
            let lower = id.to_lowercase();
            let tail: Vec<char> = lower.chars().collect();
            let start = tail.len().saturating_sub(SHORT_ID_LEN);
            tail[start..]
                .iter()
                .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
                .collect()
        })
        .unwrap_or_default();

    let mut id = if from_id.is_empty() {
        let mut hasher = Sha256::new();
        hasher.update(original_name.as_bytes());
        hasher.update(Local::now().to_rfc3339().as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        digest[..SHORT_ID_LEN].to_string()
    } else {
        from_id
    };

    while id.len() < SHORT_ID_LEN {
        id.push('0');
    }
    id
}

fn extension(original_name: &str) -> String {
    match Path::new(original_name).extension() {
        Some(ext) => {
            let ext = ext.to_string_lossy().to_lowercase();
            if ext == "jpeg" {
                ".jpg".to_string()
            } else {
                format!(".{}", ext)
            }
        }
        None => String::new(),
    }
}

/// Build an export filename. Without a capture time the event date at noon
/// is used, and failing that the current time.
pub fn export_filename(
    original_name: &str,
    taken_at: Option<NaiveDateTime>,
    submitter_name: Option<&str>,
    event_date: Option<NaiveDate>,
    photo_id: Option<&str>,
) -> String {
    let date_part = match (taken_at, event_date) {
        (Some(ts), _) => ts.format("%Y%m%d_%H%M%S").to_string(),
        (None, Some(day)) => format!("{}_120000", day.format("%Y%m%d")),
        (None, None) => Local::now().format("%Y%m%d_%H%M%S").to_string(),
    };

    format!(
        "{}_{}_{}{}",
        date_part,
        initials(submitter_name),
        short_id(photo_id, original_name),
        extension(original_name)
    )
}
