//! Archive statistics (`info`) and invariant verification (`check`).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::export::collect_video_records;
use crate::model::Availability;
use crate::state::VIDEOS_TSV;
use crate::tsv;

/// Renders the `info` report from the on-disk indices.
pub fn archive_info(root: &Path) -> Result<String> {
    let records = collect_video_records(root)?;
    let mut out = String::new();

    writeln!(out, "archive: {}", root.display())?;
    writeln!(out, "videos: {}", records.len())?;

    let mut by_availability: BTreeMap<&str, usize> = BTreeMap::new();
    let mut caption_tracks = 0usize;
    let mut downloaded = 0usize;
    for record in &records {
        let key = match record.availability {
            Availability::Public => "public",
            Availability::Unlisted => "unlisted",
            Availability::Private => "private",
            Availability::Removed => "removed",
            Availability::MembersOnly => "members-only",
        };
        *by_availability.entry(key).or_default() += 1;
        caption_tracks += record.captions_available.len();
        if record.download_status == crate::model::DownloadStatus::Downloaded {
            downloaded += 1;
        }
    }
    for (key, count) in &by_availability {
        writeln!(out, "  {key}: {count}")?;
    }
    writeln!(out, "caption tracks: {caption_tracks}")?;
    writeln!(out, "downloaded binaries: {downloaded}")?;

    if let (Some(newest), Some(oldest)) = (
        records.first().map(|r| r.published),
        records.last().map(|r| r.published),
    ) {
        writeln!(out, "published range: {} .. {}", oldest.to_rfc3339(), newest.to_rfc3339())?;
    }

    let playlists_tsv = root.join("playlists/playlists.tsv");
    if playlists_tsv.exists() {
        let table = tsv::parse(&std::fs::read_to_string(&playlists_tsv)?)?;
        writeln!(out, "playlists: {}", table.rows.len())?;
    }
    let authors_tsv = root.join("authors.tsv");
    if authors_tsv.exists() {
        let table = tsv::parse(&std::fs::read_to_string(&authors_tsv)?)?;
        writeln!(out, "authors: {}", table.rows.len())?;
    }

    Ok(out)
}

/// Verifies the store invariants. Returns a list of violations; empty means
/// the archive is consistent.
pub fn check_invariants(root: &Path) -> Result<Vec<String>> {
    let mut violations = Vec::new();

    // Unique video ids across the canonical tree, sorted caption lists.
    let records = collect_video_records(root)?;
    let mut seen: BTreeMap<String, String> = BTreeMap::new();
    for record in &records {
        if let Some(previous) = seen.insert(record.video_id.clone(), record.path.clone()) {
            violations.push(format!(
                "video id {} appears twice: {} and {}",
                record.video_id, previous, record.path
            ));
        }
        let mut sorted = record.captions_available.clone();
        sorted.sort();
        if sorted != record.captions_available {
            violations.push(format!(
                "{}: captions_available is not sorted",
                record.video_id
            ));
        }
        let dir = root.join(&record.path);
        if !dir.join("metadata.json").exists() {
            violations.push(format!(
                "{}: recorded path {} has no metadata.json",
                record.video_id, record.path
            ));
        }
    }

    // videos.tsv <-> tree closure, both directions.
    let tsv_path = root.join(VIDEOS_TSV);
    let mut tsv_ids = BTreeSet::new();
    if tsv_path.exists() {
        let table = tsv::parse(&std::fs::read_to_string(&tsv_path)?)
            .context("parsing videos.tsv")?;
        let id_col = table.column("video_id")?;
        let path_col = table.column("path")?;
        for row in &table.rows {
            tsv_ids.insert(row[id_col].clone());
            if !root.join(&row[path_col]).join("metadata.json").exists() {
                violations.push(format!(
                    "videos.tsv row {} points at missing {}",
                    row[id_col], row[path_col]
                ));
            }
        }
    } else if !records.is_empty() {
        violations.push("videos exist on disk but videos/videos.tsv is missing".to_owned());
    }
    for record in &records {
        if !tsv_ids.is_empty() && !tsv_ids.contains(&record.video_id) {
            violations.push(format!(
                "{} ({}) is on disk but not in videos.tsv; re-run export",
                record.video_id, record.path
            ));
        }
    }

    // Every playlist symlink resolves into the canonical video tree.
    let playlists_root = root.join("playlists");
    if playlists_root.exists() {
        for entry in WalkDir::new(&playlists_root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.path_is_symlink())
        {
            let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
            match entry.path().parent().map(|p| {
                p.join(std::fs::read_link(entry.path()).unwrap_or_default())
            }) {
                Some(target) if target.exists() => {
                    let canonical = target.canonicalize().unwrap_or(target);
                    if !canonical.starts_with(root.join("videos").canonicalize().unwrap_or_else(|_| root.join("videos"))) {
                        violations.push(format!(
                            "{} escapes the canonical video tree",
                            rel.display()
                        ));
                    }
                }
                _ => violations.push(format!("{} is a dangling symlink", rel.display())),
            }
        }
    }

    Ok(violations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export;
    use crate::model::{DownloadStatus, VideoRecord};
    use crate::store::plain::PlainStore;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn record(id: &str, path: &str) -> VideoRecord {
        VideoRecord {
            video_id: id.to_owned(),
            title: id.to_owned(),
            description: String::new(),
            channel_id: "UC1".into(),
            channel_name: "Chan".into(),
            published: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            duration_seconds: 10,
            view_count: None,
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
            source_url: "s".into(),
            first_fetched: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            last_updated: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            path: path.to_owned(),
            extra: Default::default(),
        }
    }

    fn write(root: &Path, r: &VideoRecord) {
        let dir = root.join(&r.path);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("metadata.json"),
            serde_json::to_string_pretty(r).unwrap(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn consistent_archive_passes() {
        let dir = tempdir().unwrap();
        let store = PlainStore::new(dir.path());
        write(dir.path(), &record("V1", "videos/2024/v1"));
        export::export_all(&store).await.unwrap();

        assert!(check_invariants(dir.path()).unwrap().is_empty());
        let info = archive_info(dir.path()).unwrap();
        assert!(info.contains("videos: 1"));
        assert!(info.contains("public: 1"));
    }

    #[tokio::test]
    async fn stale_tsv_and_dangling_links_are_reported() {
        let dir = tempdir().unwrap();
        let store = PlainStore::new(dir.path());
        write(dir.path(), &record("V1", "videos/2024/v1"));
        export::export_all(&store).await.unwrap();

        // A video lands on disk without a re-export.
        write(dir.path(), &record("V2", "videos/2024/v2"));
        // And a playlist link goes stale.
        std::fs::create_dir_all(dir.path().join("playlists/p")).unwrap();
        std::os::unix::fs::symlink(
            "../../videos/2024/gone",
            dir.path().join("playlists/p/0001_gone"),
        )
        .unwrap();

        let violations = check_invariants(dir.path()).unwrap();
        assert!(violations.iter().any(|v| v.contains("V2")), "{violations:?}");
        assert!(
            violations.iter().any(|v| v.contains("dangling")),
            "{violations:?}"
        );
    }

    #[tokio::test]
    async fn unsorted_captions_are_a_violation() {
        let dir = tempdir().unwrap();
        let store = PlainStore::new(dir.path());
        let mut r = record("V1", "videos/2024/v1");
        r.captions_available = vec!["fr".into(), "en".into()];
        write(dir.path(), &r);
        export::export_all(&store).await.unwrap();

        let violations = check_invariants(dir.path()).unwrap();
        assert!(violations.iter().any(|v| v.contains("not sorted")));
    }
}
