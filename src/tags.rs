//! Searchable tags derived from a photo's resolved metadata.
//!
//! Tag generation is a pure function: member names are looked up by the
//! caller and passed in.

use chrono::{Datelike, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::db::Event;

const MAX_TAG_LEN: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagKind {
    Date,
    Event,
    Activity,
    Location,
    Person,
    Submitter,
    Manual,
}

impl TagKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagKind::Date => "date",
            TagKind::Event => "event",
            TagKind::Activity => "activity",
            TagKind::Location => "location",
            TagKind::Person => "person",
            TagKind::Submitter => "submitter",
            TagKind::Manual => "manual",
        }
    }
}

impl FromStr for TagKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "date" => Ok(TagKind::Date),
            "event" => Ok(TagKind::Event),
            "activity" => Ok(TagKind::Activity),
            "location" => Ok(TagKind::Location),
            "person" => Ok(TagKind::Person),
            "submitter" => Ok(TagKind::Submitter),
            "manual" => Ok(TagKind::Manual),
            other => Err(format!("unknown tag type '{}'", other)),
        }
    }
}

impl fmt::Display for TagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub kind: TagKind,
    pub auto_generated: bool,
}

impl Tag {
    pub fn auto(name: &str, kind: TagKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            auto_generated: true,
        }
    }
}

/// Everything tag generation looks at.
#[derive(Debug, Clone, Default)]
pub struct TagSources<'a> {
    pub taken_at: Option<NaiveDateTime>,
    pub event: Option<&'a Event>,
    /// Display names of the people trusted to be in the photo.
    pub people: Vec<String>,
    pub submitter_name: Option<String>,
}

/// Normalize free text into a tag: CamelCase words, ASCII letters and
/// digits only, at most 30 characters. Returns `None` if nothing is left.
///
/// `"Sunset Hike - Mt. Pisgah"` becomes `"SunsetHikeMtPisgah"`.
pub fn sanitize_tag(text: &str) -> Option<String> {
    let camel: String = text
        .split(|c: char| c.is_whitespace() || matches!(c, '-' | '_' | ',' | '.' | '/'))
        .filter(|word| !word.is_empty())
        .map(capitalize)
        .collect();

    let cleaned: String = camel
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(MAX_TAG_LEN)
        .collect();

    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(|c| c.to_lowercase()))
            .collect(),
        None => String::new(),
    }
}

/// Build the tag set for a photo, in a stable order with duplicates removed.
pub fn generate_tags(sources: &TagSources<'_>) -> Vec<Tag> {
    let mut tags = Vec::new();

    if let Some(taken_at) = sources.taken_at {
        tags.push(Tag::auto(&taken_at.year().to_string(), TagKind::Date));
        tags.push(Tag::auto(&taken_at.format("%b%Y").to_string(), TagKind::Date));
    }

    if let Some(event) = sources.event {
        if let Some(tag) = sanitize_tag(&event.name) {
            tags.push(Tag::auto(&tag, TagKind::Event));
        }
        if let Some(tag) = event.activity.as_deref().and_then(sanitize_tag) {
            tags.push(Tag::auto(&tag, TagKind::Activity));
        }
        if let Some(tag) = event.location_name.as_deref().and_then(sanitize_tag) {
            tags.push(Tag::auto(&tag, TagKind::Location));
        }
    }

    for name in &sources.people {
        if let Some(tag) = sanitize_tag(name) {
            tags.push(Tag::auto(&tag, TagKind::Person));
        }
    }

    if let Some(tag) = sources.submitter_name.as_deref().and_then(sanitize_tag) {
        tags.push(Tag::auto(&format!("SubmittedBy{}", tag), TagKind::Submitter));
    }

    let mut seen = HashSet::new();
    tags.retain(|t| seen.insert(t.name.clone()));
    tags
}
