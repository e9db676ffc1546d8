//! Canonical archive records.
//!
//! These structs are the on-disk truth: `metadata.json`, `comments.json`,
//! `playlist.json` and the rows of `captions.tsv` all serialize from here.
//! Every list-valued field is kept sorted so that serializations are
//! deterministic and diffs stay meaningful.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Parent id sentinel for top-level comments.
pub const ROOT_PARENT: &str = "root";

/// Fields whose changes never constitute a content change. The store's
/// commit filter and the pipeline's diff logic both key off this list.
pub const TIMESTAMP_FIELDS: &[&str] = &["first_fetched", "last_updated", "fetched_at"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Availability {
    Public,
    Unlisted,
    Private,
    Removed,
    MembersOnly,
}

impl Availability {
    /// Incremental modes skip anything that is not publicly fetchable.
    pub const fn is_public(self) -> bool {
        matches!(self, Self::Public | Self::Unlisted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DownloadStatus {
    TrackedUrlOnly,
    Downloaded,
    MetadataOnly,
}

/// The authoritative per-video record, persisted as `metadata.json`.
///
/// Unknown fields from older or newer writers are retained in `extra` so a
/// read-modify-write cycle never drops data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoRecord {
    pub video_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub channel_id: String,
    pub channel_name: String,
    pub published: DateTime<Utc>,
    pub duration_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub like_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    pub availability: Availability,
    #[serde(default)]
    pub captions_available: Vec<String>,
    #[serde(default)]
    pub has_auto_captions: bool,
    pub download_status: DownloadStatus,
    pub source_url: String,
    pub first_fetched: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    /// Directory of this video relative to the archive root.
    pub path: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl VideoRecord {
    /// Sorts every list-valued field. Must be called before serializing.
    pub fn normalize(&mut self) {
        self.captions_available.sort();
        self.captions_available.dedup();
        self.tags.sort();
        self.tags.dedup();
        self.categories.sort();
        self.categories.dedup();
    }

    /// Compares two records ignoring timestamp-only fields and the stored
    /// path (path drift is handled separately by the scheduler).
    pub fn content_equal(&self, other: &Self) -> bool {
        let strip = |record: &Self| {
            let mut value = serde_json::to_value(record).expect("record serializes");
            if let Some(map) = value.as_object_mut() {
                for field in TIMESTAMP_FIELDS {
                    map.remove(*field);
                }
                map.remove("path");
            }
            value
        };
        strip(self) == strip(other)
    }

    /// Minimal placeholder written when a video turns out to be unavailable:
    /// enough for the unavailable registry and the TSV indices.
    pub fn unavailable_placeholder(
        video_id: &str,
        availability: Availability,
        source_url: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            video_id: video_id.to_owned(),
            title: String::new(),
            description: String::new(),
            channel_id: String::new(),
            channel_name: String::new(),
            published: now,
            duration_seconds: 0,
            view_count: None,
            like_count: None,
            comment_count: None,
            thumbnail_url: None,
            tags: Vec::new(),
            categories: Vec::new(),
            license: None,
            availability,
            captions_available: Vec::new(),
            has_auto_captions: false,
            download_status: DownloadStatus::MetadataOnly,
            source_url: source_url.to_owned(),
            first_fetched: now,
            last_updated: now,
            path: String::new(),
            extra: BTreeMap::new(),
        }
    }
}

/// One entry of `comments.json`.
///
/// `published` is the platform's original publication instant, never the
/// fetch time. Some upstream surfaces return every comment flat with the
/// root sentinel as parent; the field is kept so a richer adapter can fill
/// real parents without a schema change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentRecord {
    pub id: String,
    pub author: String,
    pub author_id: String,
    pub text: String,
    pub published: DateTime<Utc>,
    #[serde(default)]
    pub like_count: u64,
    #[serde(default = "default_parent")]
    pub parent: String,
}

fn default_parent() -> String {
    ROOT_PARENT.to_owned()
}

/// One row of a per-video `captions.tsv` manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptionEntry {
    pub language: String,
    pub auto_generated: bool,
    pub path: String,
    pub fetched_at: DateTime<Utc>,
}

/// Persisted as `playlist.json` inside each playlist directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistRecord {
    pub playlist_id: String,
    pub title: String,
    pub channel_id: String,
    pub channel_name: String,
    /// Member ids in the platform's playlist order.
    pub video_ids: Vec<String>,
    pub video_count: u64,
    pub total_duration_seconds: u64,
    pub last_updated: DateTime<Utc>,
    /// Sanitized directory name under `playlists/`.
    pub directory: String,
}

/// Aggregated author row for `authors.tsv`. Built by the exporter from
/// video uploaders and comment authors; never stored as JSON.
#[derive(Debug, Clone)]
pub struct AuthorRecord {
    pub author_id: String,
    pub name: String,
    pub channel_url: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub video_count: u64,
    pub comment_count: u64,
}
