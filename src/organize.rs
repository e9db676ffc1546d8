//! Materializes playlist directories as ordered symlinks into the
//! canonical video tree.
//!
//! Each playlist directory is rebuilt from scratch on every checkpoint:
//! stale links are removed, then one `NNNN<sep><video-dir-name>` link per
//! member is created in the platform's playlist order. Members not yet
//! archived are skipped for the pass and reappear once their video lands.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::{debug, instrument};

use crate::config::Organization;
use crate::model::PlaylistRecord;
use crate::store::ArchiveStore;

/// Rebuilds one playlist directory. `video_paths` maps video ids to their
/// repository-relative directories. Returns how many links were created.
#[instrument(skip(store, playlist, organization, video_paths), fields(playlist = %playlist.playlist_id))]
pub async fn materialize_playlist(
    store: &dyn ArchiveStore,
    playlist: &PlaylistRecord,
    organization: &Organization,
    video_paths: &BTreeMap<String, String>,
) -> Result<usize> {
    let width = organization.playlist_prefix_width;
    let capacity = 10usize.pow(width as u32) - 1;
    if playlist.video_ids.len() > capacity {
        bail!(
            "playlist `{}` has {} entries but a prefix width of {} only \
             numbers up to {}; raise organization.playlist_prefix_width",
            playlist.title,
            playlist.video_ids.len(),
            width,
            capacity
        );
    }

    let playlist_dir = PathBuf::from("playlists").join(&playlist.directory);
    remove_existing_links(store, &playlist_dir).await?;

    let mut created = 0usize;
    for (index, video_id) in playlist.video_ids.iter().enumerate() {
        let Some(video_path) = video_paths.get(video_id) else {
            debug!("member {video_id} not archived yet, skipping");
            continue;
        };
        let dir_name = Path::new(video_path)
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("video path `{video_path}` has no directory name"))?;
        let link_name = format!(
            "{:0width$}{}{}",
            index + 1,
            organization.playlist_prefix_separator,
            dir_name,
        );
        let target = relative_target(&playlist_dir, Path::new(video_path));
        store.symlink(&playlist_dir.join(link_name), &target).await?;
        created += 1;
    }

    debug!("created {created} links for {}", playlist.title);
    Ok(created)
}

/// Drops every symlink in the playlist directory, leaving `playlist.json`
/// and anything else regular alone.
async fn remove_existing_links(store: &dyn ArchiveStore, playlist_dir: &Path) -> Result<()> {
    let abs = store.root().join(playlist_dir);
    let Ok(entries) = std::fs::read_dir(&abs) else {
        return Ok(());
    };
    for entry in entries {
        let entry = entry?;
        let meta = std::fs::symlink_metadata(entry.path())?;
        if meta.file_type().is_symlink() {
            store.remove(&playlist_dir.join(entry.file_name())).await?;
        }
    }
    Ok(())
}

/// Relative path from inside `link_dir` to `target` (both repo-relative).
fn relative_target(link_dir: &Path, target: &Path) -> PathBuf {
    let ups = link_dir.components().filter(|c| matches!(c, Component::Normal(_))).count();
    let mut out = PathBuf::new();
    for _ in 0..ups {
        out.push("..");
    }
    out.push(target);
    out
}
