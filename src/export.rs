//! Regenerates the TSV indices from the per-video and per-playlist JSON.
//!
//! All three tables are rewritten in full on every pass; the store's
//! commit filter keeps no-op rewrites out of history. Determinism matters
//! more than speed here: rows are fully sorted and instants rendered in a
//! fixed format, so identical trees always export identical bytes.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

use crate::model::{AuthorRecord, CommentRecord, PlaylistRecord, VideoRecord};
use crate::store::ArchiveStore;
use crate::tsv;

pub const VIDEOS_HEADER: [&str; 10] = [
    "title", "channel", "published", "duration", "views", "likes", "comments", "captions",
    "path", "video_id",
];
pub const PLAYLISTS_HEADER: [&str; 7] = [
    "title",
    "channel",
    "video_count",
    "total_duration",
    "last_updated",
    "path",
    "playlist_id",
];
pub const AUTHORS_HEADER: [&str; 7] = [
    "author_id",
    "name",
    "channel_url",
    "first_seen",
    "last_seen",
    "video_count",
    "comment_count",
];

fn instant(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Every `metadata.json` under `videos/`, sorted newest-first with id as
/// tiebreaker.
pub fn collect_video_records(root: &Path) -> Result<Vec<VideoRecord>> {
    let videos_root = root.join("videos");
    let mut records = Vec::new();
    if !videos_root.exists() {
        return Ok(records);
    }
    for entry in WalkDir::new(&videos_root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && e.file_name() == "metadata.json")
    {
        let raw = std::fs::read_to_string(entry.path())
            .with_context(|| format!("reading {}", entry.path().display()))?;
        match serde_json::from_str::<VideoRecord>(&raw) {
            Ok(record) => records.push(record),
            Err(err) => warn!("skipping unparsable {}: {err}", entry.path().display()),
        }
    }
    records.sort_by(|a, b| {
        b.published
            .cmp(&a.published)
            .then_with(|| a.video_id.cmp(&b.video_id))
    });
    Ok(records)
}

fn collect_playlist_records(root: &Path) -> Result<Vec<PlaylistRecord>> {
    let playlists_root = root.join("playlists");
    let mut records = Vec::new();
    if !playlists_root.exists() {
        return Ok(records);
    }
    for entry in WalkDir::new(&playlists_root)
        .max_depth(2)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && e.file_name() == "playlist.json")
    {
        let raw = std::fs::read_to_string(entry.path())
            .with_context(|| format!("reading {}", entry.path().display()))?;
        match serde_json::from_str::<PlaylistRecord>(&raw) {
            Ok(record) => records.push(record),
            Err(err) => warn!("skipping unparsable {}: {err}", entry.path().display()),
        }
    }
    records.sort_by(|a, b| a.playlist_id.cmp(&b.playlist_id));
    Ok(records)
}

#[instrument(skip(store))]
pub async fn export_videos(store: &dyn ArchiveStore) -> Result<usize> {
    let records = collect_video_records(store.root())?;
    let rows: Vec<Vec<String>> = records
        .iter()
        .map(|r| {
            vec![
                r.title.clone(),
                r.channel_name.clone(),
                instant(r.published),
                r.duration_seconds.to_string(),
                r.view_count.map(|v| v.to_string()).unwrap_or_default(),
                r.like_count.map(|v| v.to_string()).unwrap_or_default(),
                r.comment_count.map(|v| v.to_string()).unwrap_or_default(),
                r.captions_available.len().to_string(),
                r.path.clone(),
                r.video_id.clone(),
            ]
        })
        .collect();
    let doc = tsv::render(&VIDEOS_HEADER, &rows);
    store
        .atomic_write(Path::new("videos/videos.tsv"), doc.as_bytes())
        .await?;
    debug!("exported {} video rows", rows.len());
    Ok(rows.len())
}

#[instrument(skip(store))]
pub async fn export_playlists(store: &dyn ArchiveStore) -> Result<usize> {
    let records = collect_playlist_records(store.root())?;
    let rows: Vec<Vec<String>> = records
        .iter()
        .map(|r| {
            vec![
                r.title.clone(),
                r.channel_name.clone(),
                r.video_count.to_string(),
                r.total_duration_seconds.to_string(),
                instant(r.last_updated),
                format!("playlists/{}", r.directory),
                r.playlist_id.clone(),
            ]
        })
        .collect();
    let doc = tsv::render(&PLAYLISTS_HEADER, &rows);
    store
        .atomic_write(Path::new("playlists/playlists.tsv"), doc.as_bytes())
        .await?;
    debug!("exported {} playlist rows", rows.len());
    Ok(rows.len())
}

#[instrument(skip(store))]
pub async fn export_authors(store: &dyn ArchiveStore) -> Result<usize> {
    let root = store.root();
    let mut authors: BTreeMap<String, AuthorRecord> = BTreeMap::new();

    let mut observe = |id: &str,
                       name: &str,
                       url: String,
                       seen: DateTime<Utc>,
                       videos: u64,
                       comments: u64| {
        // Commenters occasionally arrive without a channel id; fall back to
        // the display name so they still aggregate deterministically.
        let key = if id.is_empty() { name } else { id };
        if key.is_empty() {
            return;
        }
        let entry = authors.entry(key.to_owned()).or_insert_with(|| AuthorRecord {
            author_id: id.to_owned(),
            name: name.to_owned(),
            channel_url: url,
            first_seen: seen,
            last_seen: seen,
            video_count: 0,
            comment_count: 0,
        });
        entry.first_seen = entry.first_seen.min(seen);
        entry.last_seen = entry.last_seen.max(seen);
        entry.video_count += videos;
        entry.comment_count += comments;
    };

    for record in collect_video_records(root)? {
        observe(
            &record.channel_id,
            &record.channel_name,
            format!("https://www.youtube.com/channel/{}", record.channel_id),
            record.published,
            1,
            0,
        );

        let comments_path = root.join(&record.path).join("comments.json");
        if !comments_path.exists() {
            continue;
        }
        let raw = std::fs::read_to_string(&comments_path)
            .with_context(|| format!("reading {}", comments_path.display()))?;
        let comments: Vec<CommentRecord> = match serde_json::from_str(&raw) {
            Ok(comments) => comments,
            Err(err) => {
                warn!("skipping unparsable {}: {err}", comments_path.display());
                continue;
            }
        };
        for comment in &comments {
            let url = if comment.author_id.is_empty() {
                String::new()
            } else {
                format!("https://www.youtube.com/channel/{}", comment.author_id)
            };
            observe(&comment.author_id, &comment.author, url, comment.published, 0, 1);
        }
    }

    let rows: Vec<Vec<String>> = authors
        .values()
        .map(|a| {
            vec![
                a.author_id.clone(),
                a.name.clone(),
                a.channel_url.clone(),
                instant(a.first_seen),
                instant(a.last_seen),
                a.video_count.to_string(),
                a.comment_count.to_string(),
            ]
        })
        .collect();
    let doc = tsv::render(&AUTHORS_HEADER, &rows);
    store
        .atomic_write(Path::new("authors.tsv"), doc.as_bytes())
        .await?;
    debug!("exported {} author rows", rows.len());
    Ok(rows.len())
}

/// The full checkpoint export: all three tables.
pub async fn export_all(store: &dyn ArchiveStore) -> Result<()> {
    export_videos(store).await?;
    export_playlists(store).await?;
    export_authors(store).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Availability, DownloadStatus, ROOT_PARENT};
    use crate::store::plain::PlainStore;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn record(id: &str, published: DateTime<Utc>, title: &str) -> VideoRecord {
        VideoRecord {
            video_id: id.to_owned(),
            title: title.to_owned(),
            description: String::new(),
            channel_id: "UC1".into(),
            channel_name: "Chan".into(),
            published,
            duration_seconds: 90,
            view_count: Some(100),
            like_count: Some(7),
            comment_count: None,
            thumbnail_url: None,
            tags: vec![],
            categories: vec![],
            license: None,
            availability: Availability::Public,
            captions_available: vec!["en".into(), "fr".into()],
            has_auto_captions: false,
            download_status: DownloadStatus::TrackedUrlOnly,
            source_url: "src".into(),
            first_fetched: published,
            last_updated: published,
            path: format!("videos/2024/{id}"),
            extra: Default::default(),
        }
    }

    fn write_record(root: &Path, r: &VideoRecord) {
        let dir = root.join(&r.path);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("metadata.json"),
            serde_json::to_string_pretty(r).unwrap(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn videos_tsv_sorted_newest_first_with_id_tiebreak() {
        let dir = tempdir().unwrap();
        let store = PlainStore::new(dir.path());
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        write_record(dir.path(), &record("B", t2, "newer"));
        write_record(dir.path(), &record("A", t2, "same instant"));
        write_record(dir.path(), &record("C", t1, "older, has\ttab"));

        let n = export_videos(&store).await.unwrap();
        assert_eq!(n, 3);

        let doc = std::fs::read_to_string(dir.path().join("videos/videos.tsv")).unwrap();
        let table = tsv::parse(&doc).unwrap();
        assert_eq!(table.header, VIDEOS_HEADER);
        let ids: Vec<&str> = table.rows.iter().map(|r| r[9].as_str()).collect();
        assert_eq!(ids, ["A", "B", "C"]);
        // Caption column is a count.
        assert_eq!(table.rows[0][7], "2");
        // The embedded tab survived the round trip.
        assert_eq!(table.rows[2][0], "older, has\ttab");
    }

    #[tokio::test]
    async fn empty_archive_still_writes_headers() {
        let dir = tempdir().unwrap();
        let store = PlainStore::new(dir.path());
        export_all(&store).await.unwrap();
        let doc = std::fs::read_to_string(dir.path().join("videos/videos.tsv")).unwrap();
        assert_eq!(doc, format!("{}\n", VIDEOS_HEADER.join("\t")));
        assert!(dir.path().join("playlists/playlists.tsv").exists());
        assert!(dir.path().join("authors.tsv").exists());
    }

    #[tokio::test]
    async fn export_is_idempotent_byte_for_byte() {
        let dir = tempdir().unwrap();
        let store = PlainStore::new(dir.path());
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 10, 30, 0).unwrap();
        write_record(dir.path(), &record("A", t, "one"));

        export_all(&store).await.unwrap();
        let first = std::fs::read(dir.path().join("videos/videos.tsv")).unwrap();
        export_all(&store).await.unwrap();
        let second = std::fs::read(dir.path().join("videos/videos.tsv")).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn authors_aggregate_uploaders_and_commenters() {
        let dir = tempdir().unwrap();
        let store = PlainStore::new(dir.path());
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let r = record("A", t, "one");
        write_record(dir.path(), &r);
        let comments = vec![
            CommentRecord {
                id: "c1".into(),
                author: "Someone".into(),
                author_id: "UC9".into(),
                text: "hi".into(),
                published: Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap(),
                like_count: 0,
                parent: ROOT_PARENT.to_owned(),
            },
            CommentRecord {
                id: "c2".into(),
                author: "Someone".into(),
                author_id: "UC9".into(),
                text: "again".into(),
                published: Utc.with_ymd_and_hms(2024, 3, 3, 0, 0, 0).unwrap(),
                like_count: 1,
                parent: "c1".into(),
            },
        ];
        std::fs::write(
            dir.path().join(&r.path).join("comments.json"),
            serde_json::to_string_pretty(&comments).unwrap(),
        )
        .unwrap();

        export_authors(&store).await.unwrap();
        let doc = std::fs::read_to_string(dir.path().join("authors.tsv")).unwrap();
        let table = tsv::parse(&doc).unwrap();
        assert_eq!(table.rows.len(), 2);
        // Sorted by author id: UC1 (uploader) before UC9 (commenter).
        assert_eq!(table.rows[0][0], "UC1");
        assert_eq!(table.rows[0][5], "1"); // one video
        assert_eq!(table.rows[1][0], "UC9");
        assert_eq!(table.rows[1][6], "2"); // two comments
        assert_eq!(table.rows[1][4], "2024-03-03T00:00:00Z"); // last_seen
    }
}
