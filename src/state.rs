//! Derives the sync state from the archive itself.
//!
//! There is no separate state database: `videos/videos.tsv` is the index of
//! record, each video's `metadata.json` is authoritative for its fields,
//! and `comments.json` carries the comment cursor. Everything a run needs
//! to decide skip/fetch/refresh is reconstructed here, read-only, once per
//! run.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::model::{CommentRecord, VideoRecord};
use crate::tsv;

pub const VIDEOS_TSV: &str = "videos/videos.tsv";

#[derive(Debug, Default)]
pub struct ArchiveState {
    /// Full prior records keyed by video id, loaded from `metadata.json`.
    pub videos: BTreeMap<String, VideoRecord>,
    /// Newest comment instant per video, from `comments.json`.
    pub last_comment: BTreeMap<String, DateTime<Utc>>,
    /// Ids whose availability is private/removed/members-only. Incremental
    /// modes skip these; `all-force` re-probes them.
    pub unavailable: BTreeSet<String>,
}

impl ArchiveState {
    /// Reads the on-disk state. Missing indices mean an empty archive;
    /// individually corrupt per-video files are skipped with a warning so
    /// one bad record cannot brick every future run.
    pub fn derive(root: &Path) -> Result<Self> {
        let mut state = Self::default();

        let tsv_path = root.join(VIDEOS_TSV);
        if !tsv_path.exists() {
            debug!("no {VIDEOS_TSV}; starting from an empty state");
            return Ok(state);
        }

        let content = fs::read_to_string(&tsv_path)
            .with_context(|| format!("reading {}", tsv_path.display()))?;
        let table = tsv::parse(&content).context("parsing videos.tsv")?;
        let path_col = table.column("path")?;
        let id_col = table.column("video_id")?;

        for row in &table.rows {
            let video_id = &row[id_col];
            let rel_path = &row[path_col];
            let metadata_path = root.join(rel_path).join("metadata.json");

            let record: VideoRecord = match fs::read_to_string(&metadata_path)
                .map_err(anyhow::Error::from)
                .and_then(|raw| serde_json::from_str(&raw).map_err(anyhow::Error::from))
            {
                Ok(record) => record,
                Err(err) => {
                    warn!(
                        "skipping unreadable {}: {err}",
                        metadata_path.display()
                    );
                    continue;
                }
            };

            if !record.availability.is_public() {
                state.unavailable.insert(video_id.clone());
            }

            let comments_path = root.join(rel_path).join("comments.json");
            if comments_path.exists() {
                match fs::read_to_string(&comments_path)
                    .map_err(anyhow::Error::from)
                    .and_then(|raw| {
                        serde_json::from_str::<Vec<CommentRecord>>(&raw)
                            .map_err(anyhow::Error::from)
                    }) {
                    Ok(comments) => {
                        if let Some(newest) = comments.iter().map(|c| c.published).max() {
                            state.last_comment.insert(video_id.clone(), newest);
                        }
                    }
                    Err(err) => {
                        warn!("skipping unreadable {}: {err}", comments_path.display());
                    }
                }
            }

            state.videos.insert(video_id.clone(), record);
        }

        debug!(
            "derived state: {} known videos, {} unavailable",
            state.videos.len(),
            state.unavailable.len()
        );
        Ok(state)
    }

    /// The incremental cutoff for one source: the newest published instant
    /// among its videos. Full timestamp precision; the upstream listing
    /// filter is only date-granular and is complemented by this.
    pub fn latest_published_for(&self, source_url: &str) -> Option<DateTime<Utc>> {
        self.videos
            .values()
            .filter(|v| v.source_url == source_url)
            .map(|v| v.published)
            .max()
    }

    /// Prior on-disk directory for a video, for pattern-drift detection.
    pub fn path_for(&self, video_id: &str) -> Option<&str> {
        self.videos.get(video_id).map(|v| v.path.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Availability, DownloadStatus};
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn record(id: &str, source: &str, published: DateTime<Utc>, path: &str) -> VideoRecord {
        VideoRecord {
            video_id: id.to_owned(),
            title: format!("video {id}"),
            description: String::new(),
            channel_id: "UC1".into(),
            channel_name: "Chan".into(),
            published,
            duration_seconds: 10,
            view_count: Some(5),
            like_count: None,
            comment_count: None,
            thumbnail_url: None,
            tags: vec![],
            categories: vec![],
            license: None,
            availability: Availability::Public,
            captions_available: vec![],
            has_auto_captions: false,
            download_status: DownloadStatus::TrackedUrlOnly,
            source_url: source.to_owned(),
            first_fetched: published,
            last_updated: published,
            path: path.to_owned(),
            extra: BTreeMap::new(),
        }
    }

    fn write_archive(root: &Path, records: &[VideoRecord]) {
        let mut rows = Vec::new();
        for r in records {
            let dir = root.join(&r.path);
            fs::create_dir_all(&dir).unwrap();
            fs::write(
                dir.join("metadata.json"),
                serde_json::to_string_pretty(r).unwrap(),
            )
            .unwrap();
            rows.push(vec![
                r.title.clone(),
                r.channel_name.clone(),
                r.published.to_rfc3339(),
                r.duration_seconds.to_string(),
                String::new(),
                String::new(),
                String::new(),
                "0".to_owned(),
                r.path.clone(),
                r.video_id.clone(),
            ]);
        }
        let doc = tsv::render(
            &[
                "title", "channel", "published", "duration", "views", "likes", "comments",
                "captions", "path", "video_id",
            ],
            &rows,
        );
        fs::create_dir_all(root.join("videos")).unwrap();
        fs::write(root.join(VIDEOS_TSV), doc).unwrap();
    }

    #[test]
    fn empty_archive_derives_empty_state() {
        let dir = tempdir().unwrap();
        let state = ArchiveState::derive(dir.path()).unwrap();
        assert!(state.videos.is_empty());
        assert!(state.unavailable.is_empty());
    }

    #[test]
    fn cutoff_is_per_source_and_second_precise() {
        let dir = tempdir().unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 8, 30, 15).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 1, 1, 8, 30, 16).unwrap();
        let t3 = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        write_archive(
            dir.path(),
            &[
                record("V1", "src-a", t1, "videos/2024/01/v1"),
                record("V2", "src-a", t2, "videos/2024/01/v2"),
                record("V3", "src-b", t3, "videos/2024/06/v3"),
            ],
        );
        let state = ArchiveState::derive(dir.path()).unwrap();
        assert_eq!(state.latest_published_for("src-a"), Some(t2));
        assert_eq!(state.latest_published_for("src-b"), Some(t3));
        assert_eq!(state.latest_published_for("src-c"), None);
        assert_eq!(state.path_for("V1"), Some("videos/2024/01/v1"));
    }

    #[test]
    fn unavailable_and_comment_cursor_are_derived() {
        let dir = tempdir().unwrap();
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let mut gone = record("V9", "src-a", t, "videos/2024/03/v9");
        gone.availability = Availability::Removed;
        write_archive(dir.path(), &[record("V1", "src-a", t, "videos/2024/03/v1"), gone]);

        let newest = Utc.with_ymd_and_hms(2024, 3, 2, 12, 0, 0).unwrap();
        let comments = vec![
            CommentRecord {
                id: "c1".into(),
                author: "A".into(),
                author_id: "UCa".into(),
                text: "old".into(),
                published: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
                like_count: 0,
                parent: crate::model::ROOT_PARENT.to_owned(),
            },
            CommentRecord {
                id: "c2".into(),
                author: "B".into(),
                author_id: "UCb".into(),
                text: "new".into(),
                published: newest,
                like_count: 0,
                parent: crate::model::ROOT_PARENT.to_owned(),
            },
        ];
        fs::write(
            dir.path().join("videos/2024/03/v1/comments.json"),
            serde_json::to_string_pretty(&comments).unwrap(),
        )
        .unwrap();

        let state = ArchiveState::derive(dir.path()).unwrap();
        assert!(state.unavailable.contains("V9"));
        assert!(!state.unavailable.contains("V1"));
        assert_eq!(state.last_comment.get("V1"), Some(&newest));
    }
}
