//! The archival pipeline scheduler.
//!
//! One `run` walks every enabled source: discovery expands it into targets,
//! each target's videos are enumerated, gated against the derived on-disk
//! state, prefetched through a bounded worker pool, and applied to the
//! repository strictly in order. Checkpoints (export + symlink rebuild +
//! commit) happen every `checkpoint_interval` processed videos, on
//! interrupt, and at the end of each target, so a crash loses at most the
//! in-memory counters.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{Config, Source};
use crate::discovery::{self, WorkTarget};
use crate::error::FetchError;
use crate::export;
use crate::model::{
    Availability, CaptionEntry, CommentRecord, DownloadStatus, PlaylistRecord, VideoRecord,
};
use crate::organize;
use crate::paths;
use crate::platform::{CaptionRequest, CaptionTrack, PlaylistDescriptor, VideoListEntry, VideoPlatform};
use crate::quota::{QuotaManager, WaitOutcome};
use crate::state::ArchiveState;
use crate::store::{ArchiveStore, EntryTags, FileKind};
use crate::tsv;

/// Top-level dispatch of the update state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    VideosIncremental,
    AllIncremental,
    Social,
    AllForce,
    Playlists,
}

impl UpdateMode {
    /// Whether unknown ids get fetched at all.
    const fn enumerates_new(self) -> bool {
        !matches!(self, Self::Social)
    }

    /// Whether previously-unavailable ids are probed again.
    const fn reprobes_unavailable(self) -> bool {
        matches!(self, Self::AllForce)
    }
}

/// Per-run counters surfaced at exit.
#[derive(Debug, Default)]
pub struct RunStats {
    pub videos_seen: usize,
    pub fetched: usize,
    pub skipped: usize,
    pub unchanged: usize,
    pub unavailable: usize,
    pub moved: usize,
    pub commits: usize,
    pub errors: BTreeMap<String, usize>,
    pub interrupted: bool,
    pub quota_gave_up: bool,
}

impl RunStats {
    fn count_error(&mut self, kind: &str) {
        *self.errors.entry(kind.to_owned()).or_default() += 1;
    }

    pub fn summary(&self) -> String {
        let mut out = format!(
            "{} seen, {} fetched, {} skipped, {} unchanged, {} unavailable, {} moved, {} commits",
            self.videos_seen,
            self.fetched,
            self.skipped,
            self.unchanged,
            self.unavailable,
            self.moved,
            self.commits
        );
        for (kind, count) in &self.errors {
            out.push_str(&format!("\n  {kind} errors: {count}"));
        }
        out
    }
}

/// A gated enumeration entry. Skipped known videos still get a pattern
/// drift check (a rename needs no refetch), carried by their id.
enum Work {
    Skip(Option<String>),
    Fetch(Candidate),
}

/// What the prefetch pool hands to the sequential applier.
enum FetchOutcome {
    Skipped(Option<String>),
    Fetched(Candidate, Result<Prepared, FetchError>),
}

#[derive(Debug, Clone)]
struct Candidate {
    video_id: String,
    title: String,
    published: DateTime<Utc>,
    is_new: bool,
    /// Refresh comments/captions for an existing video this pass.
    refresh_components: bool,
    /// Social / all-force: refetch captions even when the language set is
    /// unchanged.
    force: bool,
    since: Option<DateTime<Utc>>,
    old_captions: Vec<String>,
    has_thumbnail: bool,
}

/// Everything the prefetch pool produced for one candidate.
struct Prepared {
    record: VideoRecord,
    comments: Vec<CommentRecord>,
    captions: BTreeMap<String, CaptionTrack>,
    thumbnail: Option<(Vec<u8>, String)>,
}

enum Applied {
    Done,
    Interrupted,
    QuotaGaveUp,
}

pub struct Pipeline {
    platform: Arc<dyn VideoPlatform>,
    store: Arc<dyn ArchiveStore>,
    config: Config,
    quota: QuotaManager,
    ct: CancellationToken,
}

impl Pipeline {
    pub fn new(
        platform: Arc<dyn VideoPlatform>,
        store: Arc<dyn ArchiveStore>,
        config: Config,
        ct: CancellationToken,
    ) -> Self {
        let quota = QuotaManager::new(&config.api);
        Self {
            platform,
            store,
            config,
            quota,
            ct,
        }
    }

    /// Runs the pipeline over every enabled source in the given mode.
    #[instrument(skip(self), fields(mode = ?mode))]
    pub async fn run(&self, mode: UpdateMode) -> Result<RunStats> {
        for remote in &self.config.remotes {
            self.store
                .configure_remote(remote)
                .await
                .with_context(|| format!("configuring remote `{}`", remote.name))?;
        }

        let state = ArchiveState::derive(self.store.root()).context("deriving archive state")?;
        let mut stats = RunStats::default();
        // Repository-relative video directories, updated as videos land, so
        // playlist symlinks can point at work done earlier in this run.
        let mut run_paths: BTreeMap<String, String> = state
            .videos
            .iter()
            .map(|(id, r)| (id.clone(), r.path.clone()))
            .collect();
        let mut processed_ids: BTreeSet<String> = BTreeSet::new();

        let result = self
            .run_sources(mode, &state, &mut stats, &mut run_paths, &mut processed_ids)
            .await;

        if let Err(err) = result {
            // Local failures are fatal, but whatever already landed on disk
            // is worth a best-effort checkpoint before we bail.
            error!("run aborted: {err:#}");
            if self.store.uncommitted_changes().await.unwrap_or(false) {
                let _ = export::export_all(self.store.as_ref()).await;
                let _ = self.store.commit("Checkpoint: aborted run").await;
            }
            return Err(err);
        }

        info!("run complete: {}", stats.summary());
        Ok(stats)
    }

    async fn run_sources(
        &self,
        mode: UpdateMode,
        state: &ArchiveState,
        stats: &mut RunStats,
        run_paths: &mut BTreeMap<String, String>,
        processed_ids: &mut BTreeSet<String>,
    ) -> Result<()> {
        for source in self.config.sources.iter().filter(|s| s.enabled) {
            if self.ct.is_cancelled() {
                stats.interrupted = true;
                break;
            }

            let mut expanded = None;
            while expanded.is_none() {
                match discovery::expand(source, self.platform.as_ref()).await {
                    Ok(targets) => expanded = Some(targets),
                    Err(err) if is_quota_error(&err) => {
                        match self.quota.wait_for_reset(&self.ct).await {
                            WaitOutcome::Resumed => {}
                            WaitOutcome::Cancelled => {
                                stats.interrupted = true;
                                return Ok(());
                            }
                            WaitOutcome::GaveUp => {
                                stats.quota_gave_up = true;
                                return Ok(());
                            }
                        }
                    }
                    Err(err) => {
                        error!("skipping source {}: {err:#}", source.url);
                        stats.count_error("discovery");
                        expanded = Some(Vec::new());
                    }
                }
            }
            let targets = expanded.unwrap_or_default();

            for target in targets {
                if self.ct.is_cancelled() {
                    stats.interrupted = true;
                    return Ok(());
                }
                let applied = match &target {
                    WorkTarget::ChannelUploads { channel_url } => {
                        if mode == UpdateMode::Playlists {
                            continue;
                        }
                        self.run_channel_target(
                            mode, source, channel_url, state, stats, run_paths, processed_ids,
                        )
                        .await?
                    }
                    WorkTarget::Playlist { descriptor } => {
                        if mode == UpdateMode::Social {
                            continue;
                        }
                        self.run_playlist_target(
                            mode, source, descriptor, state, stats, run_paths, processed_ids,
                        )
                        .await?
                    }
                    WorkTarget::Videos { ids } => {
                        if mode == UpdateMode::Playlists {
                            continue;
                        }
                        self.run_video_list_target(
                            mode, source, ids, state, stats, run_paths, processed_ids,
                        )
                        .await?
                    }
                };
                match applied {
                    Applied::Done => {}
                    Applied::Interrupted => {
                        stats.interrupted = true;
                        return Ok(());
                    }
                    Applied::QuotaGaveUp => {
                        stats.quota_gave_up = true;
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    async fn run_channel_target(
        &self,
        mode: UpdateMode,
        source: &Source,
        channel_url: &str,
        state: &ArchiveState,
        stats: &mut RunStats,
        run_paths: &mut BTreeMap<String, String>,
        processed_ids: &mut BTreeSet<String>,
    ) -> Result<Applied> {
        let entries = if mode == UpdateMode::Social {
            // Social mode refreshes what is on disk; no remote enumeration.
            let mut entries: Vec<VideoListEntry> = state
                .videos
                .values()
                .filter(|r| r.source_url == source.url)
                .map(|r| VideoListEntry {
                    video_id: r.video_id.clone(),
                    published: r.published,
                    title: r.title.clone(),
                    duration_seconds: Some(r.duration_seconds),
                })
                .collect();
            entries.sort_by(|a, b| b.published.cmp(&a.published));
            entries
        } else {
            match self
                .listing_with_quota(|| self.platform.list_channel_videos(channel_url))
                .await
            {
                Ok(entries) => entries,
                Err(ListingAbort::Interrupted) => return Ok(Applied::Interrupted),
                Err(ListingAbort::QuotaGaveUp) => return Ok(Applied::QuotaGaveUp),
                Err(ListingAbort::Failed(err)) => {
                    error!("listing {channel_url} failed: {err}");
                    stats.count_error(error_kind(&err));
                    return Ok(Applied::Done);
                }
            }
        };

        let cutoff = match mode {
            UpdateMode::VideosIncremental => state.latest_published_for(&source.url),
            _ => None,
        };
        let work = self.gate_entries(mode, source, state, &entries, cutoff, processed_ids, stats);

        let label = format!("Backup channel: {channel_url}");
        self.apply_work(source, &label, work, state, stats, run_paths, &mut Vec::new())
            .await
    }

    async fn run_playlist_target(
        &self,
        mode: UpdateMode,
        source: &Source,
        descriptor: &PlaylistDescriptor,
        state: &ArchiveState,
        stats: &mut RunStats,
        run_paths: &mut BTreeMap<String, String>,
        processed_ids: &mut BTreeSet<String>,
    ) -> Result<Applied> {
        let items = match self
            .listing_with_quota(|| self.platform.list_playlist_items(&descriptor.playlist_id))
            .await
        {
            Ok(items) => items,
            Err(ListingAbort::Interrupted) => return Ok(Applied::Interrupted),
            Err(ListingAbort::QuotaGaveUp) => return Ok(Applied::QuotaGaveUp),
            Err(ListingAbort::Failed(err)) => {
                error!("listing playlist {} failed: {err}", descriptor.playlist_id);
                stats.count_error(error_kind(&err));
                return Ok(Applied::Done);
            }
        };

        // Members are archived newest-first like any other enumeration; the
        // playlist order only matters for the symlink layout.
        let mut entries = items.clone();
        entries.sort_by(|a, b| {
            b.published
                .cmp(&a.published)
                .then_with(|| a.video_id.cmp(&b.video_id))
        });
        let work = self.gate_entries(mode, source, state, &entries, None, processed_ids, stats);

        let record = PlaylistRecord {
            playlist_id: descriptor.playlist_id.clone(),
            title: descriptor.title.clone(),
            channel_id: descriptor.channel_id.clone(),
            channel_name: descriptor.channel_name.clone(),
            video_ids: items.iter().map(|i| i.video_id.clone()).collect(),
            video_count: items.len() as u64,
            total_duration_seconds: 0,
            last_updated: Utc::now(),
            directory: {
                let dir = paths::sanitize(&descriptor.title);
                if dir.is_empty() {
                    descriptor.playlist_id.clone()
                } else {
                    dir
                }
            },
        };
        let mut dirty = vec![record];

        let label = format!("Backup playlist: {}", descriptor.title);
        self.apply_work(source, &label, work, state, stats, run_paths, &mut dirty)
            .await
    }

    async fn run_video_list_target(
        &self,
        mode: UpdateMode,
        source: &Source,
        ids: &[String],
        state: &ArchiveState,
        stats: &mut RunStats,
        run_paths: &mut BTreeMap<String, String>,
        processed_ids: &mut BTreeSet<String>,
    ) -> Result<Applied> {
        // Explicitly listed videos bypass the incremental cutoff: the user
        // asked for exactly these.
        let mut work = Vec::new();
        for video_id in ids {
            if processed_ids.contains(video_id) {
                continue;
            }
            processed_ids.insert(video_id.clone());
            stats.videos_seen += 1;
            let known = state.videos.get(video_id);
            if !mode.reprobes_unavailable() && state.unavailable.contains(video_id) {
                stats.skipped += 1;
                work.push(Work::Skip(known.map(|r| r.video_id.clone())));
                continue;
            }
            work.push(Work::Fetch(Candidate {
                video_id: video_id.clone(),
                title: known.map(|r| r.title.clone()).unwrap_or_default(),
                published: known.map(|r| r.published).unwrap_or_else(Utc::now),
                is_new: known.is_none(),
                refresh_components: true,
                force: matches!(mode, UpdateMode::Social | UpdateMode::AllForce),
                since: state.last_comment.get(video_id).copied(),
                old_captions: known.map(|r| r.captions_available.clone()).unwrap_or_default(),
                has_thumbnail: known.is_some_and(|r| self.thumbnail_exists(&r.path)),
            }));
        }

        let label = format!("Backup videos: {}", source.url);
        self.apply_work(source, &label, work, state, stats, run_paths, &mut Vec::new())
            .await
    }

    /// Per-video action selection over a full enumeration, in descending
    /// publication order: decide skip / fetch / refresh for each entry.
    #[allow(clippy::too_many_arguments)]
    fn gate_entries(
        &self,
        mode: UpdateMode,
        source: &Source,
        state: &ArchiveState,
        entries: &[VideoListEntry],
        cutoff: Option<DateTime<Utc>>,
        processed_ids: &mut BTreeSet<String>,
        stats: &mut RunStats,
    ) -> Vec<Work> {
        let now = Utc::now();
        let social_window = ChronoDuration::days(i64::from(self.config.backup.social_window_days));
        let filters = &self.config.filters;
        let mut work = Vec::new();
        let mut admitted = 0usize;

        for entry in entries {
            if let Some(limit) = filters.limit {
                if admitted >= limit {
                    break;
                }
            }
            if processed_ids.contains(&entry.video_id) {
                continue;
            }

            let date = entry.published.date_naive();
            if filters.date_start.is_some_and(|start| date < start)
                || filters.date_end.is_some_and(|end| date > end)
            {
                continue;
            }
            if filters.exclude_shorts
                && entry.duration_seconds.is_some_and(|d| d <= SHORTS_MAX_SECONDS)
            {
                continue;
            }
            admitted += 1;
            stats.videos_seen += 1;
            processed_ids.insert(entry.video_id.clone());

            let known = state.videos.get(&entry.video_id);
            if !mode.reprobes_unavailable() && state.unavailable.contains(&entry.video_id) {
                stats.skipped += 1;
                work.push(Work::Skip(known.map(|r| r.video_id.clone())));
                continue;
            }

            // The upstream listing filter is date-granular at best; the
            // timestamped comparison here is what actually gates.
            if cutoff.is_some_and(|c| entry.published <= c) {
                stats.skipped += 1;
                work.push(Work::Skip(known.map(|r| r.video_id.clone())));
                continue;
            }

            let candidate = match (known, mode) {
                (None, m) if m.enumerates_new() => Candidate {
                    video_id: entry.video_id.clone(),
                    title: entry.title.clone(),
                    published: entry.published,
                    is_new: true,
                    refresh_components: true,
                    force: false,
                    since: None,
                    old_captions: Vec::new(),
                    has_thumbnail: false,
                },
                (None, _) => {
                    stats.skipped += 1;
                    work.push(Work::Skip(None));
                    continue;
                }
                (Some(old), mode) => {
                    let refresh = match mode {
                        UpdateMode::VideosIncremental | UpdateMode::Playlists => false,
                        UpdateMode::AllIncremental => entry.published >= now - social_window,
                        UpdateMode::Social | UpdateMode::AllForce => true,
                    };
                    if !refresh {
                        stats.skipped += 1;
                        work.push(Work::Skip(Some(entry.video_id.clone())));
                        continue;
                    }
                    if let Some(license) = &filters.license {
                        if old.license.as_deref() != Some(license.as_str()) {
                            stats.skipped += 1;
                            work.push(Work::Skip(Some(entry.video_id.clone())));
                            continue;
                        }
                    }
                    Candidate {
                        video_id: entry.video_id.clone(),
                        title: entry.title.clone(),
                        published: entry.published,
                        is_new: false,
                        refresh_components: true,
                        force: matches!(mode, UpdateMode::Social | UpdateMode::AllForce),
                        since: state.last_comment.get(&entry.video_id).copied(),
                        old_captions: old.captions_available.clone(),
                        has_thumbnail: self.thumbnail_exists(&old.path),
                    }
                }
            };
            work.push(Work::Fetch(candidate));
        }
        work
    }

    /// Prefetches candidates through the bounded pool and applies them in
    /// order, checkpointing as configured.
    #[allow(clippy::too_many_arguments)]
    async fn apply_work(
        &self,
        source: &Source,
        label: &str,
        work: Vec<Work>,
        state: &ArchiveState,
        stats: &mut RunStats,
        run_paths: &mut BTreeMap<String, String>,
        dirty_playlists: &mut Vec<PlaylistRecord>,
    ) -> Result<Applied> {
        let total = work.len();
        let workers = self.config.network.workers;
        let mut stream = futures_util::stream::iter(work.into_iter().map(|item| async move {
            match item {
                Work::Skip(known_id) => FetchOutcome::Skipped(known_id),
                Work::Fetch(candidate) => {
                    let result = self.prefetch(&candidate).await;
                    FetchOutcome::Fetched(candidate, result)
                }
            }
        }))
        .buffered(workers);

        let mut accounted = 0usize;
        let mut worked_since_checkpoint = 0usize;
        let mut outcome = Applied::Done;

        while let Some(item) = stream.next().await {
            if self.ct.is_cancelled() {
                outcome = Applied::Interrupted;
                break;
            }
            accounted += 1;
            let (candidate, result) = match item {
                FetchOutcome::Skipped(None) => continue,
                FetchOutcome::Skipped(Some(video_id)) => {
                    // No refetch, but the configured pattern may have moved
                    // this video's directory since it was recorded.
                    if self.sync_path(&video_id, state, stats, run_paths).await? {
                        worked_since_checkpoint += 1;
                    }
                    if worked_since_checkpoint >= self.config.backup.checkpoint_interval {
                        self.checkpoint(label, accounted, total, stats, run_paths, dirty_playlists)
                            .await?;
                        worked_since_checkpoint = 0;
                    }
                    continue;
                }
                FetchOutcome::Fetched(candidate, result) => (candidate, result),
            };

            let result = match result {
                Err(FetchError::QuotaExceeded) => {
                    // Commit progress before the long sleep, then redo this
                    // item serially once the quota resets.
                    self.checkpoint(label, accounted - 1, total, stats, run_paths, dirty_playlists)
                        .await?;
                    match self.refetch_after_quota(&candidate).await {
                        Ok(prepared) => Ok(prepared),
                        Err(ListingAbort::Interrupted) => {
                            outcome = Applied::Interrupted;
                            break;
                        }
                        Err(ListingAbort::QuotaGaveUp) => {
                            outcome = Applied::QuotaGaveUp;
                            break;
                        }
                        Err(ListingAbort::Failed(err)) => Err(err),
                    }
                }
                other => other,
            };

            match result {
                Ok(prepared) => {
                    let did_work = self
                        .apply_video(source, &candidate, prepared, state, stats, run_paths)
                        .await?;
                    if did_work {
                        worked_since_checkpoint += 1;
                    }
                }
                Err(FetchError::Unavailable { reason }) => {
                    info!("{} is unavailable: {reason}", candidate.video_id);
                    self.record_unavailable(source, &candidate, reason.availability(), state)
                        .await?;
                    stats.unavailable += 1;
                    worked_since_checkpoint += 1;
                }
                Err(FetchError::NotFound) => {
                    info!("{} no longer exists", candidate.video_id);
                    self.record_unavailable(source, &candidate, Availability::Removed, state)
                        .await?;
                    stats.unavailable += 1;
                    worked_since_checkpoint += 1;
                }
                Err(err) => {
                    error!("skipping {} after {err}", candidate.video_id);
                    stats.count_error(error_kind(&err));
                }
            }

            if worked_since_checkpoint >= self.config.backup.checkpoint_interval {
                self.checkpoint(label, accounted, total, stats, run_paths, dirty_playlists)
                    .await?;
                worked_since_checkpoint = 0;
            }
        }

        if matches!(outcome, Applied::Interrupted) && !self.config.backup.auto_commit_on_interrupt {
            warn!("interrupted; auto-commit on interrupt is disabled, leaving tree dirty");
            return Ok(outcome);
        }

        // Final (or interrupt/give-up) checkpoint for this target.
        self.finalize(label, accounted, total, stats, run_paths, dirty_playlists)
            .await?;
        Ok(outcome)
    }

    async fn finalize(
        &self,
        label: &str,
        accounted: usize,
        total: usize,
        stats: &mut RunStats,
        run_paths: &BTreeMap<String, String>,
        dirty_playlists: &mut Vec<PlaylistRecord>,
    ) -> Result<()> {
        // Fill playlist durations now that member metadata is on disk.
        for playlist in dirty_playlists.iter_mut() {
            let records = export::collect_video_records(self.store.root())?;
            let by_id: BTreeMap<&str, &VideoRecord> =
                records.iter().map(|r| (r.video_id.as_str(), r)).collect();
            playlist.total_duration_seconds = playlist
                .video_ids
                .iter()
                .filter_map(|id| by_id.get(id.as_str()))
                .map(|r| r.duration_seconds)
                .sum();
            let rel = PathBuf::from("playlists")
                .join(&playlist.directory)
                .join("playlist.json");
            let mut body = serde_json::to_string_pretty(playlist)?;
            body.push('\n');
            self.store.atomic_write(&rel, body.as_bytes()).await?;
        }

        export::export_all(self.store.as_ref()).await?;
        for playlist in dirty_playlists.iter() {
            organize::materialize_playlist(
                self.store.as_ref(),
                playlist,
                &self.config.organization,
                run_paths,
            )
            .await?;
        }
        let message = format!("{label} ({accounted}/{total} videos)");
        if self.store.commit(&message).await? {
            stats.commits += 1;
        }
        Ok(())
    }

    async fn checkpoint(
        &self,
        label: &str,
        accounted: usize,
        total: usize,
        stats: &mut RunStats,
        run_paths: &BTreeMap<String, String>,
        dirty_playlists: &[PlaylistRecord],
    ) -> Result<()> {
        export::export_all(self.store.as_ref()).await?;
        for playlist in dirty_playlists {
            organize::materialize_playlist(
                self.store.as_ref(),
                playlist,
                &self.config.organization,
                run_paths,
            )
            .await?;
        }
        let message = format!("Checkpoint: {label} ({accounted}/{total} videos)");
        if self.store.commit(&message).await? {
            stats.commits += 1;
        }
        Ok(())
    }

    /// The concurrent part: everything here is remote I/O, no tree writes.
    async fn prefetch(&self, candidate: &Candidate) -> Result<Prepared, FetchError> {
        let record = self
            .platform
            .fetch_video_metadata(&candidate.video_id)
            .await?;

        let components = &self.config.components;
        let comments = if components.comments_depth > 0
            && (candidate.is_new || candidate.refresh_components)
        {
            self.platform
                .fetch_comments(
                    &candidate.video_id,
                    components.comments_depth,
                    candidate.since,
                )
                .await?
        } else {
            Vec::new()
        };

        let wants_captions = components.captions
            && (candidate.is_new
                || candidate.force
                || (candidate.refresh_components
                    && record.captions_available != candidate.old_captions));
        let captions = if wants_captions {
            let request = CaptionRequest {
                languages: components.caption_languages.clone(),
                include_auto_translated: components.auto_translated_captions,
            };
            self.platform
                .fetch_captions(&candidate.video_id, &request)
                .await?
        } else {
            BTreeMap::new()
        };

        let thumbnail = if components.thumbnails && !candidate.has_thumbnail {
            match &record.thumbnail_url {
                Some(url) => Some(self.platform.fetch_thumbnail(url).await?),
                None => None,
            }
        } else {
            None
        };

        Ok(Prepared {
            record,
            comments,
            captions,
            thumbnail,
        })
    }

    /// Serial re-fetch of one candidate after a quota wait, looping through
    /// further resets if the probe hits the wall again.
    async fn refetch_after_quota(&self, candidate: &Candidate) -> Result<Prepared, ListingAbort> {
        loop {
            match self.quota.wait_for_reset(&self.ct).await {
                WaitOutcome::Resumed => {}
                WaitOutcome::Cancelled => return Err(ListingAbort::Interrupted),
                WaitOutcome::GaveUp => return Err(ListingAbort::QuotaGaveUp),
            }
            match self.prefetch(candidate).await {
                Ok(prepared) => {
                    self.quota.probe_succeeded();
                    return Ok(prepared);
                }
                Err(FetchError::QuotaExceeded) => continue,
                Err(err) => return Err(ListingAbort::Failed(err)),
            }
        }
    }

    /// Runs a listing call, suspending on quota exhaustion.
    async fn listing_with_quota<T, F, Fut>(&self, op: F) -> Result<T, ListingAbort>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, FetchError>>,
    {
        loop {
            if self.ct.is_cancelled() {
                return Err(ListingAbort::Interrupted);
            }
            match op().await {
                Ok(value) => return Ok(value),
                Err(FetchError::QuotaExceeded) => {
                    match self.quota.wait_for_reset(&self.ct).await {
                        WaitOutcome::Resumed => continue,
                        WaitOutcome::Cancelled => return Err(ListingAbort::Interrupted),
                        WaitOutcome::GaveUp => return Err(ListingAbort::QuotaGaveUp),
                    }
                }
                Err(err) => return Err(ListingAbort::Failed(err)),
            }
        }
    }

    /// The strictly-sequential apply: path resolution, drift move, all file
    /// writes, URL registration. Returns whether anything was written.
    async fn apply_video(
        &self,
        source: &Source,
        candidate: &Candidate,
        prepared: Prepared,
        state: &ArchiveState,
        stats: &mut RunStats,
        run_paths: &mut BTreeMap<String, String>,
    ) -> Result<bool> {
        let Prepared {
            mut record,
            comments,
            captions,
            thumbnail,
        } = prepared;
        stats.fetched += 1;

        let filters = &self.config.filters;
        if let Some(license) = &filters.license {
            if candidate.is_new && record.license.as_deref() != Some(license.as_str()) {
                stats.skipped += 1;
                return Ok(false);
            }
        }
        if filters.exclude_shorts && record.duration_seconds <= SHORTS_MAX_SECONDS {
            stats.skipped += 1;
            return Ok(false);
        }

        let old = state.videos.get(&candidate.video_id);
        let now = Utc::now();

        record.source_url = source.url.clone();
        record.first_fetched = old.map_or(now, |o| o.first_fetched);
        record.last_updated = now;
        record.download_status = if self.config.components.videos {
            DownloadStatus::Downloaded
        } else if old.is_some_and(|o| o.download_status == DownloadStatus::Downloaded) {
            DownloadStatus::Downloaded
        } else {
            DownloadStatus::TrackedUrlOnly
        };
        for lang in captions.keys() {
            if !record.captions_available.contains(lang) {
                record.captions_available.push(lang.clone());
            }
        }
        record.normalize();

        let resolved = paths::resolve(
            &self.config.organization.video_path_pattern,
            &paths::ResolveInput {
                video_id: &record.video_id,
                title: &record.title,
                channel_id: &record.channel_id,
                channel_name: &record.channel_name,
                published: record.published,
            },
        );
        record.path = format!("videos/{resolved}");

        // Pattern drift: the stored tree location moves before anything is
        // rewritten in place. A failed rename is fatal to the item only;
        // the old path stays intact.
        if let Some(old_record) = old {
            if old_record.path != record.path
                && self.store.root().join(&old_record.path).exists()
            {
                if let Err(err) = self
                    .store
                    .move_entry(Path::new(&old_record.path), Path::new(&record.path))
                    .await
                {
                    error!(
                        "rename {} -> {} failed, leaving item untouched: {err:#}",
                        old_record.path, record.path
                    );
                    stats.count_error("rename");
                    return Ok(false);
                }
                stats.moved += 1;
            }
        }

        // Nothing changed and every component is already in place: no
        // writes, so re-runs converge byte-for-byte.
        let components_clean =
            comments.is_empty() && captions.is_empty() && thumbnail.is_none();
        if let Some(old_record) = old {
            if old_record.content_equal(&record) && old_record.path == record.path && components_clean
            {
                stats.unchanged += 1;
                run_paths.insert(record.video_id.clone(), record.path.clone());
                return Ok(false);
            }
        }

        let dir = PathBuf::from(&record.path);

        if !comments.is_empty() {
            let merged = self.merge_comments(&dir, comments)?;
            let mut body = serde_json::to_string_pretty(&merged)?;
            body.push('\n');
            self.store
                .atomic_write(&dir.join("comments.json"), body.as_bytes())
                .await?;
        }

        if !captions.is_empty() {
            self.write_captions(&dir, &captions, now).await?;
        }

        if let Some((bytes, ext)) = thumbnail {
            let rel = dir.join(format!("thumbnail.{ext}"));
            self.store.atomic_write(&rel, &bytes).await?;
            let tags = EntryTags {
                video_id: record.video_id.clone(),
                channel: record.channel_id.clone(),
                published: record.published,
                filetype: FileKind::Thumbnail,
            };
            self.store.tag_entry(&rel, &tags).await?;
        }

        let mut body = serde_json::to_string_pretty(&record)?;
        body.push('\n');
        self.store
            .atomic_write(&dir.join("metadata.json"), body.as_bytes())
            .await?;

        let tags = EntryTags {
            video_id: record.video_id.clone(),
            channel: record.channel_id.clone(),
            published: record.published,
            filetype: FileKind::Video,
        };
        let video_file = dir.join("video.mp4");
        self.store
            .register_url(&video_file, &self.platform.watch_url(&record.video_id), &tags)
            .await?;
        if self.config.components.videos {
            self.store.materialize(&video_file).await?;
        }

        run_paths.insert(record.video_id.clone(), record.path.clone());
        debug!("archived {} at {}", record.video_id, record.path);
        Ok(true)
    }

    /// Pattern-drift handling for videos whose metadata is not refetched
    /// this pass: recompute the directory from the stored record and move
    /// when it differs.
    async fn sync_path(
        &self,
        video_id: &str,
        state: &ArchiveState,
        stats: &mut RunStats,
        run_paths: &mut BTreeMap<String, String>,
    ) -> Result<bool> {
        let Some(old) = state.videos.get(video_id) else {
            return Ok(false);
        };
        let resolved = paths::resolve(
            &self.config.organization.video_path_pattern,
            &paths::ResolveInput {
                video_id: &old.video_id,
                title: &old.title,
                channel_id: &old.channel_id,
                channel_name: &old.channel_name,
                published: old.published,
            },
        );
        let new_path = format!("videos/{resolved}");
        if old.path == new_path {
            run_paths.insert(video_id.to_owned(), new_path);
            return Ok(false);
        }
        if !self.store.root().join(&old.path).exists() {
            return Ok(false);
        }
        if let Err(err) = self
            .store
            .move_entry(Path::new(&old.path), Path::new(&new_path))
            .await
        {
            error!(
                "rename {} -> {new_path} failed, leaving item untouched: {err:#}",
                old.path
            );
            stats.count_error("rename");
            return Ok(false);
        }
        stats.moved += 1;

        let mut updated = old.clone();
        updated.path = new_path.clone();
        let mut body = serde_json::to_string_pretty(&updated)?;
        body.push('\n');
        self.store
            .atomic_write(&PathBuf::from(&new_path).join("metadata.json"), body.as_bytes())
            .await?;
        run_paths.insert(video_id.to_owned(), new_path);
        Ok(true)
    }

    /// Merges freshly fetched comments into the existing `comments.json`,
    /// deduplicating by id and sorting by publication instant. Timestamps
    /// stay the platform's originals.
    fn merge_comments(
        &self,
        dir: &Path,
        fresh: Vec<CommentRecord>,
    ) -> Result<Vec<CommentRecord>> {
        let path = self.store.root().join(dir).join("comments.json");
        let mut by_id: BTreeMap<String, CommentRecord> = BTreeMap::new();
        if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            match serde_json::from_str::<Vec<CommentRecord>>(&raw) {
                Ok(existing) => {
                    for comment in existing {
                        by_id.insert(comment.id.clone(), comment);
                    }
                }
                Err(err) => warn!("rebuilding unparsable {}: {err}", path.display()),
            }
        }
        for comment in fresh {
            by_id.insert(comment.id.clone(), comment);
        }
        let mut merged: Vec<CommentRecord> = by_id.into_values().collect();
        merged.sort_by(|a, b| a.published.cmp(&b.published).then_with(|| a.id.cmp(&b.id)));
        Ok(merged)
    }

    /// Writes the fetched VTT tracks and rebuilds `captions.tsv`,
    /// preserving the fetch instants of tracks that were not re-fetched.
    async fn write_captions(
        &self,
        dir: &Path,
        captions: &BTreeMap<String, CaptionTrack>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let manifest_path = self.store.root().join(dir).join("captions.tsv");
        let mut entries: BTreeMap<String, CaptionEntry> = BTreeMap::new();
        if manifest_path.exists() {
            let raw = std::fs::read_to_string(&manifest_path)?;
            if let Ok(table) = tsv::parse(&raw) {
                let lang = table.column("language")?;
                let auto = table.column("auto_generated")?;
                let path = table.column("path")?;
                let fetched = table.column("fetched_at")?;
                for row in &table.rows {
                    let Ok(fetched_at) = row[fetched].parse::<DateTime<Utc>>() else {
                        continue;
                    };
                    entries.insert(
                        row[lang].clone(),
                        CaptionEntry {
                            language: row[lang].clone(),
                            auto_generated: row[auto] == "true",
                            path: row[path].clone(),
                            fetched_at,
                        },
                    );
                }
            }
        }

        for (language, track) in captions {
            let file_name = format!("video.{language}.vtt");
            self.store
                .atomic_write(&dir.join(&file_name), &track.vtt)
                .await?;
            entries.insert(
                language.clone(),
                CaptionEntry {
                    language: language.clone(),
                    auto_generated: track.auto_generated,
                    path: file_name,
                    fetched_at: now,
                },
            );
        }

        let rows: Vec<Vec<String>> = entries
            .values()
            .map(|e| {
                vec![
                    e.language.clone(),
                    e.auto_generated.to_string(),
                    e.path.clone(),
                    e.fetched_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                ]
            })
            .collect();
        let doc = tsv::render(&["language", "auto_generated", "path", "fetched_at"], &rows);
        self.store
            .atomic_write(&dir.join("captions.tsv"), doc.as_bytes())
            .await?;
        Ok(())
    }

    /// Writes (or updates) the minimal placeholder for an unavailable
    /// video, idempotently.
    async fn record_unavailable(
        &self,
        source: &Source,
        candidate: &Candidate,
        availability: Availability,
        state: &ArchiveState,
    ) -> Result<()> {
        let now = Utc::now();
        let record = match state.videos.get(&candidate.video_id) {
            Some(old) if old.availability == availability => return Ok(()),
            Some(old) => {
                let mut updated = old.clone();
                updated.availability = availability;
                updated.last_updated = now;
                updated
            }
            None => {
                let mut record = VideoRecord::unavailable_placeholder(
                    &candidate.video_id,
                    availability,
                    &source.url,
                    now,
                );
                record.title = candidate.title.clone();
                record.published = candidate.published;
                let resolved = paths::resolve(
                    &self.config.organization.video_path_pattern,
                    &paths::ResolveInput {
                        video_id: &record.video_id,
                        title: &record.title,
                        channel_id: "",
                        channel_name: "",
                        published: record.published,
                    },
                );
                record.path = format!("videos/{resolved}");
                record
            }
        };

        let mut body = serde_json::to_string_pretty(&record)?;
        body.push('\n');
        self.store
            .atomic_write(&PathBuf::from(&record.path).join("metadata.json"), body.as_bytes())
            .await
    }

    fn thumbnail_exists(&self, video_path: &str) -> bool {
        let dir = self.store.root().join(video_path);
        ["jpg", "jpeg", "png", "webp"]
            .iter()
            .any(|ext| dir.join(format!("thumbnail.{ext}")).exists())
    }
}

/// Duration at or under which a video counts as a short for the
/// `exclude_shorts` filter.
const SHORTS_MAX_SECONDS: u64 = 60;

enum ListingAbort {
    Failed(FetchError),
    Interrupted,
    QuotaGaveUp,
}

fn is_quota_error(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| matches!(cause.downcast_ref::<FetchError>(), Some(FetchError::QuotaExceeded)))
}

fn error_kind(err: &FetchError) -> &'static str {
    match err {
        FetchError::Transient(_) => "transient",
        FetchError::RateLimited { .. } => "rate-limited",
        FetchError::QuotaExceeded => "quota",
        FetchError::Unavailable { .. } => "unavailable",
        FetchError::NotFound => "not-found",
        FetchError::Malformed(_) => "malformed",
    }
}
