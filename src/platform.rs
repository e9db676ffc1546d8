//! The polymorphic boundary to the video platform.
//!
//! Everything the pipeline knows about the remote side goes through
//! [`VideoPlatform`]. The production implementation speaks the YouTube Data
//! API (see [`crate::youtube`]); tests substitute a scripted fake.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;

use crate::error::FetchError;
use crate::model::{CommentRecord, VideoRecord};

/// Minimal per-video listing data: enough for incremental gating and
/// filtering without a full metadata fetch.
#[derive(Debug, Clone)]
pub struct VideoListEntry {
    pub video_id: String,
    pub published: DateTime<Utc>,
    pub title: String,
    /// Present when the listing surface exposes it; used by the shorts
    /// filter before metadata is fetched.
    pub duration_seconds: Option<u64>,
}

/// A playlist as seen on a channel's playlists (or podcasts) surface.
#[derive(Debug, Clone)]
pub struct PlaylistDescriptor {
    pub playlist_id: String,
    pub title: String,
    pub channel_id: String,
    pub channel_name: String,
    /// Whether the playlist comes from the channel's podcast surface.
    pub is_podcast: bool,
}

/// Caption selection passed to [`VideoPlatform::fetch_captions`].
#[derive(Debug, Clone, Default)]
pub struct CaptionRequest {
    /// Only languages matching this pattern are fetched. `None` = all.
    pub languages: Option<Regex>,
    /// Auto-translated variants are excluded unless this is set.
    pub include_auto_translated: bool,
}

/// A fetched caption track, keyed by language code in the result map.
#[derive(Debug, Clone)]
pub struct CaptionTrack {
    pub auto_generated: bool,
    pub vtt: Vec<u8>,
}

#[async_trait]
pub trait VideoPlatform: Send + Sync {
    /// Lists a channel's uploads, newest first.
    async fn list_channel_videos(
        &self,
        channel_url: &str,
    ) -> Result<Vec<VideoListEntry>, FetchError>;

    /// Lists playlist members in the platform's playlist order. Entries
    /// carry ids and published instants only; titles may be empty.
    async fn list_playlist_items(
        &self,
        playlist_id: &str,
    ) -> Result<Vec<VideoListEntry>, FetchError>;

    /// Lists the channel's playlists, podcast shows included; source
    /// discovery decides which of them to archive.
    async fn list_channel_playlists(
        &self,
        channel_url: &str,
    ) -> Result<Vec<PlaylistDescriptor>, FetchError>;

    /// Descriptor for one playlist, for playlist-kind sources.
    async fn fetch_playlist_info(
        &self,
        playlist_id: &str,
    ) -> Result<PlaylistDescriptor, FetchError>;

    /// Full metadata for one video. Unavailability is an error variant,
    /// not a degenerate record.
    async fn fetch_video_metadata(&self, video_id: &str) -> Result<VideoRecord, FetchError>;

    /// Up to `max_count` comments, newest first. `since` skips anything
    /// published at or before the given instant. `max_count == 0` is a
    /// contract violation; callers gate on the configured depth.
    async fn fetch_comments(
        &self,
        video_id: &str,
        max_count: u32,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<CommentRecord>, FetchError>;

    /// Caption tracks keyed by language code, filtered per `request`.
    async fn fetch_captions(
        &self,
        video_id: &str,
        request: &CaptionRequest,
    ) -> Result<BTreeMap<String, CaptionTrack>, FetchError>;

    /// Bytes of the video's thumbnail image plus its file extension.
    async fn fetch_thumbnail(&self, url: &str) -> Result<(Vec<u8>, String), FetchError>;

    /// The canonical watch URL registered with the store's URL backend so
    /// the binary can be re-fetched on demand.
    fn watch_url(&self, video_id: &str) -> String;
}
