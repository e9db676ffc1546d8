//! The Data API v3 client: the production [`VideoPlatform`] implementation.
//!
//! Every request funnels through [`YouTubeClient::api_get`], which applies
//! the leaky-bucket limiter, the optional per-request sleep, transient
//! retry with exponential backoff, and the error classification of
//! [`FetchError::from_status`].

use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use crate::config::Network;
use crate::error::{FetchError, UnavailableReason};
use crate::model::{
    Availability, CommentRecord, DownloadStatus, ROOT_PARENT, VideoRecord,
};
use crate::platform::{
    CaptionRequest, CaptionTrack, PlaylistDescriptor, VideoListEntry, VideoPlatform,
};
use crate::youtube::structs::{
    CaptionResource, ChannelResource, CommentResource, CommentThreadResource, ListResponse,
    PlaylistItemResource, PlaylistResource, VideoResource,
};
use crate::youtube::utils::{ChannelRef, parse_channel_url, parse_iso8601_duration};
use crate::youtube::{API_BASE, API_KEY_ENV, TIMEDTEXT_URL, watch_url};

const PAGE_SIZE: &str = "50";
const COMMENTS_PAGE_SIZE: &str = "100";
const MAX_ATTEMPTS: usize = 4;

pub struct YouTubeClient {
    http: reqwest::Client,
    api_key: String,
    limiter: DefaultDirectRateLimiter,
    sleep_interval: Option<Duration>,
    captions_timeout: Duration,
}

impl YouTubeClient {
    /// Builds the client from the network section of the configuration.
    /// The API key comes from the environment, never from the config file.
    pub fn from_config(network: &Network) -> Result<Self> {
        let api_key = std::env::var(API_KEY_ENV)
            .with_context(|| format!("environment variable {API_KEY_ENV} is not set"))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            "User-Agent",
            HeaderValue::from_str(&format!(
                "{}/{}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            ))
            .context("building User-Agent header")?,
        );

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(network.metadata_timeout);
        if let Some(proxy) = &network.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy).context("configuring proxy")?);
        }
        let http = builder.build().context("building HTTP client")?;

        let rate = NonZeroU32::new(network.limit_rate).unwrap_or(nonzero!(1u32));
        Ok(Self {
            http,
            api_key,
            limiter: RateLimiter::direct(Quota::per_second(rate)),
            sleep_interval: network.sleep_interval,
            captions_timeout: network.captions_timeout,
        })
    }

    /// One rate-limited API GET with classification but no retry.
    async fn api_get_once<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<T, FetchError> {
        self.limiter.until_ready().await;
        if let Some(interval) = self.sleep_interval {
            tokio::time::sleep(interval).await;
        }

        let resp = self
            .http
            .get(format!("{API_BASE}/{endpoint}"))
            .query(params)
            .query(&[("key", self.api_key.as_str())])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = resp.text().await.unwrap_or_default();
            let mut err = FetchError::from_status(status, &body);
            if let FetchError::RateLimited { retry_after: slot } = &mut err {
                *slot = retry_after;
                // Honor the server's wish before the backoff loop kicks in.
                if let Some(wait) = retry_after {
                    tokio::time::sleep(wait.min(Duration::from_secs(120))).await;
                }
            }
            return Err(err);
        }

        resp.json::<T>()
            .await
            .map_err(|e| FetchError::Malformed(e.to_string()))
    }

    /// API GET with transient retry.
    async fn api_get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<T, FetchError> {
        (|| self.api_get_once::<T>(endpoint, params))
            .retry(
                ExponentialBuilder::default()
                    .with_max_times(MAX_ATTEMPTS)
                    .with_jitter(),
            )
            .when(FetchError::is_retryable)
            .notify(|err: &FetchError, dur: Duration| {
                warn!("retrying {endpoint} in {dur:?}: {err}");
            })
            .await
    }

    /// Resolves any channel URL form into the channel resource.
    async fn resolve_channel(&self, channel_url: &str) -> Result<ChannelResource, FetchError> {
        let reference = parse_channel_url(channel_url)
            .map_err(|e| FetchError::Malformed(e.to_string()))?;
        let (param, value) = match &reference {
            ChannelRef::Id(id) => ("id", id.clone()),
            ChannelRef::Handle(handle) => ("forHandle", handle.clone()),
            ChannelRef::User(user) => ("forUsername", user.clone()),
        };
        let page: ListResponse<ChannelResource> = self
            .api_get(
                "channels",
                &[
                    ("part", "snippet,contentDetails".to_owned()),
                    (param, value),
                ],
            )
            .await?;
        page.items.into_iter().next().ok_or(FetchError::NotFound)
    }

    async fn page_playlist_items(
        &self,
        playlist_id: &str,
    ) -> Result<Vec<VideoListEntry>, FetchError> {
        let mut entries = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut params = vec![
                ("part", "snippet,contentDetails".to_owned()),
                ("playlistId", playlist_id.to_owned()),
                ("maxResults", PAGE_SIZE.to_owned()),
            ];
            if let Some(token) = &page_token {
                params.push(("pageToken", token.clone()));
            }
            let page: ListResponse<PlaylistItemResource> =
                self.api_get("playlistItems", &params).await?;
            for item in page.items {
                let Some(details) = item.content_details else {
                    continue;
                };
                let snippet = item.snippet;
                let published = details
                    .video_published_at
                    .or_else(|| snippet.as_ref().and_then(|s| s.published_at));
                // Deleted/private members have no published instant; they are
                // invisible to listing, like the web surface shows them.
                let Some(published) = published else {
                    continue;
                };
                entries.push(VideoListEntry {
                    video_id: details.video_id,
                    published,
                    title: snippet.map(|s| s.title).unwrap_or_default(),
                    duration_seconds: None,
                });
            }
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(entries)
    }

    async fn list_caption_tracks(
        &self,
        video_id: &str,
    ) -> Result<Vec<CaptionResource>, FetchError> {
        let page: ListResponse<CaptionResource> = self
            .api_get(
                "captions",
                &[
                    ("part", "snippet".to_owned()),
                    ("videoId", video_id.to_owned()),
                ],
            )
            .await?;
        Ok(page.items)
    }

    async fn download_vtt(
        &self,
        video_id: &str,
        language: &str,
        asr: bool,
        name: &str,
    ) -> Result<Option<Vec<u8>>, FetchError> {
        self.limiter.until_ready().await;
        let mut params = vec![
            ("v", video_id.to_owned()),
            ("lang", language.to_owned()),
            ("fmt", "vtt".to_owned()),
        ];
        if asr {
            params.push(("kind", "asr".to_owned()));
        }
        if !name.is_empty() {
            params.push(("name", name.to_owned()));
        }
        let resp = self
            .http
            .get(TIMEDTEXT_URL)
            .timeout(self.captions_timeout)
            .query(&params)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::from_status(status, &body));
        }
        let bytes = resp.bytes().await?.to_vec();
        // The endpoint answers 200 with an empty body for missing tracks.
        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(Some(bytes))
    }
}

#[async_trait]
impl VideoPlatform for YouTubeClient {
    #[instrument(skip(self))]
    async fn list_channel_videos(
        &self,
        channel_url: &str,
    ) -> Result<Vec<VideoListEntry>, FetchError> {
        let channel = self.resolve_channel(channel_url).await?;
        let uploads = channel
            .content_details
            .and_then(|d| d.related_playlists.uploads)
            .ok_or_else(|| {
                FetchError::Malformed(format!("channel {} has no uploads playlist", channel.id))
            })?;
        let mut entries = self.page_playlist_items(&uploads).await?;
        entries.sort_by(|a, b| {
            b.published
                .cmp(&a.published)
                .then_with(|| a.video_id.cmp(&b.video_id))
        });
        debug!("channel {} has {} uploads", channel.id, entries.len());
        Ok(entries)
    }

    #[instrument(skip(self))]
    async fn list_playlist_items(
        &self,
        playlist_id: &str,
    ) -> Result<Vec<VideoListEntry>, FetchError> {
        // Playlist order is the platform's order; no re-sorting here.
        self.page_playlist_items(playlist_id).await
    }

    #[instrument(skip(self))]
    async fn list_channel_playlists(
        &self,
        channel_url: &str,
    ) -> Result<Vec<PlaylistDescriptor>, FetchError> {
        let channel = self.resolve_channel(channel_url).await?;
        let mut descriptors = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut params = vec![
                ("part", "snippet,status".to_owned()),
                ("channelId", channel.id.clone()),
                ("maxResults", PAGE_SIZE.to_owned()),
            ];
            if let Some(token) = &page_token {
                params.push(("pageToken", token.clone()));
            }
            let page: ListResponse<PlaylistResource> = self.api_get("playlists", &params).await?;
            for playlist in page.items {
                descriptors.push(convert_playlist(playlist));
            }
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(descriptors)
    }

    #[instrument(skip(self))]
    async fn fetch_playlist_info(
        &self,
        playlist_id: &str,
    ) -> Result<PlaylistDescriptor, FetchError> {
        let page: ListResponse<PlaylistResource> = self
            .api_get(
                "playlists",
                &[
                    ("part", "snippet,status".to_owned()),
                    ("id", playlist_id.to_owned()),
                ],
            )
            .await?;
        page.items
            .into_iter()
            .next()
            .map(convert_playlist)
            .ok_or(FetchError::NotFound)
    }

    #[instrument(skip(self))]
    async fn fetch_video_metadata(&self, video_id: &str) -> Result<VideoRecord, FetchError> {
        let page: ListResponse<VideoResource> = self
            .api_get(
                "videos",
                &[
                    (
                        "part",
                        "snippet,contentDetails,statistics,status".to_owned(),
                    ),
                    ("id", video_id.to_owned()),
                ],
            )
            .await?;
        // A video that stops existing simply disappears from the response.
        let Some(video) = page.items.into_iter().next() else {
            return Err(FetchError::Unavailable {
                reason: UnavailableReason::Removed,
            });
        };

        let snippet = video
            .snippet
            .ok_or_else(|| FetchError::Malformed(format!("video {video_id} without snippet")))?;
        let availability = match video
            .status
            .as_ref()
            .and_then(|s| s.privacy_status.as_deref())
        {
            Some("private") => {
                return Err(FetchError::Unavailable {
                    reason: UnavailableReason::Private,
                });
            }
            Some("unlisted") => Availability::Unlisted,
            _ => Availability::Public,
        };

        let parse_count = |raw: &Option<String>| raw.as_deref().and_then(|v| v.parse::<u64>().ok());
        let statistics = video.statistics.unwrap_or(
            crate::youtube::structs::VideoStatistics {
                view_count: None,
                like_count: None,
                comment_count: None,
            },
        );

        let (captions_available, has_auto_captions) = match self.list_caption_tracks(video_id).await
        {
            Ok(tracks) => {
                let mut langs: Vec<String> =
                    tracks.iter().map(|t| t.snippet.language.clone()).collect();
                langs.sort();
                langs.dedup();
                let auto = tracks
                    .iter()
                    .any(|t| t.snippet.track_kind.eq_ignore_ascii_case("asr"));
                (langs, auto)
            }
            // Caption listing is best-effort; some videos refuse it.
            Err(err) => {
                debug!("caption listing failed for {video_id}: {err}");
                (Vec::new(), false)
            }
        };

        let now = Utc::now();
        let mut record = VideoRecord {
            video_id: video.id,
            title: snippet.title,
            description: snippet.description,
            channel_id: snippet.channel_id,
            channel_name: snippet.channel_title,
            published: snippet.published_at,
            duration_seconds: video
                .content_details
                .and_then(|d| d.duration)
                .as_deref()
                .and_then(parse_iso8601_duration)
                .unwrap_or(0),
            view_count: parse_count(&statistics.view_count),
            like_count: parse_count(&statistics.like_count),
            comment_count: parse_count(&statistics.comment_count),
            thumbnail_url: snippet
                .thumbnails
                .as_ref()
                .and_then(|t| t.best_url())
                .map(str::to_owned),
            tags: snippet.tags.unwrap_or_default(),
            categories: snippet.category_id.into_iter().collect(),
            license: video.status.and_then(|s| s.license),
            availability,
            captions_available,
            has_auto_captions,
            download_status: DownloadStatus::TrackedUrlOnly,
            source_url: String::new(),
            first_fetched: now,
            last_updated: now,
            path: String::new(),
            extra: BTreeMap::new(),
        };
        record.normalize();
        Ok(record)
    }

    #[instrument(skip(self))]
    async fn fetch_comments(
        &self,
        video_id: &str,
        max_count: u32,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<CommentRecord>, FetchError> {
        let mut comments: Vec<CommentRecord> = Vec::new();
        let mut page_token: Option<String> = None;
        'pages: loop {
            let mut params = vec![
                ("part", "snippet,replies".to_owned()),
                ("videoId", video_id.to_owned()),
                ("order", "time".to_owned()),
                ("textFormat", "plainText".to_owned()),
                ("maxResults", COMMENTS_PAGE_SIZE.to_owned()),
            ];
            if let Some(token) = &page_token {
                params.push(("pageToken", token.clone()));
            }
            let page: ListResponse<CommentThreadResource> =
                match self.api_get("commentThreads", &params).await {
                    Ok(page) => page,
                    // Comments disabled is an empty result, not a failure.
                    Err(FetchError::Malformed(msg)) if msg.contains("commentsDisabled") => {
                        return Ok(Vec::new());
                    }
                    Err(err) => return Err(err),
                };

            for thread in page.items {
                let top = convert_comment(&thread.snippet.top_level_comment, None);
                // `order=time` walks threads newest-first, so once we are
                // past the cursor every later thread is older too.
                if let Some(cutoff) = since {
                    if top.published <= cutoff {
                        break 'pages;
                    }
                }
                comments.push(top);
                let parent_id = thread.snippet.top_level_comment.id.clone();
                if let Some(replies) = thread.replies {
                    for reply in &replies.comments {
                        let record = convert_comment(reply, Some(parent_id.clone()));
                        if since.is_none_or(|cutoff| record.published > cutoff) {
                            comments.push(record);
                        }
                    }
                }
                if comments.len() >= max_count as usize {
                    break 'pages;
                }
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        comments.truncate(max_count as usize);
        Ok(comments)
    }

    #[instrument(skip(self, request))]
    async fn fetch_captions(
        &self,
        video_id: &str,
        request: &CaptionRequest,
    ) -> Result<BTreeMap<String, CaptionTrack>, FetchError> {
        let tracks = self.list_caption_tracks(video_id).await?;
        let mut result = BTreeMap::new();
        for track in &tracks {
            let language = &track.snippet.language;
            if let Some(pattern) = &request.languages {
                if !pattern.is_match(language) {
                    continue;
                }
            }
            let asr = track.snippet.track_kind.eq_ignore_ascii_case("asr");
            // A manual track beats the ASR track for the same language.
            if asr && result.contains_key(language) {
                continue;
            }
            match self
                .download_vtt(video_id, language, asr, &track.snippet.name)
                .await?
            {
                Some(vtt) => {
                    result.insert(
                        language.clone(),
                        CaptionTrack {
                            auto_generated: asr,
                            vtt,
                        },
                    );
                }
                None => debug!("no timedtext payload for {video_id}/{language}"),
            }
        }
        // Auto-translated variants are only materialized on demand by the
        // platform and never show up in the track listing, so excluding
        // them (the default) needs no extra work here.
        Ok(result)
    }

    #[instrument(skip(self))]
    async fn fetch_thumbnail(&self, url: &str) -> Result<(Vec<u8>, String), FetchError> {
        self.limiter.until_ready().await;
        let resp = self.http.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::from_status(status, ""));
        }
        let ext = url
            .rsplit('/')
            .next()
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext.split('?').next().unwrap_or(ext))
            .filter(|ext| matches!(*ext, "jpg" | "jpeg" | "png" | "webp"))
            .unwrap_or("jpg")
            .to_owned();
        Ok((resp.bytes().await?.to_vec(), ext))
    }

    fn watch_url(&self, video_id: &str) -> String {
        watch_url(video_id)
    }
}

fn convert_playlist(playlist: PlaylistResource) -> PlaylistDescriptor {
    let is_podcast = playlist
        .status
        .as_ref()
        .and_then(|s| s.podcast_status.as_deref())
        == Some("enabled");
    PlaylistDescriptor {
        playlist_id: playlist.id,
        title: playlist.snippet.title,
        channel_id: playlist.snippet.channel_id,
        channel_name: playlist.snippet.channel_title,
        is_podcast,
    }
}

fn convert_comment(resource: &CommentResource, parent: Option<String>) -> CommentRecord {
    let snippet = &resource.snippet;
    CommentRecord {
        id: resource.id.clone(),
        author: snippet.author_display_name.clone(),
        author_id: snippet
            .author_channel_id
            .as_ref()
            .map(|c| c.value.clone())
            .unwrap_or_default(),
        text: snippet
            .text_original
            .clone()
            .or_else(|| snippet.text_display.clone())
            .unwrap_or_default(),
        published: snippet.published_at,
        like_count: snippet.like_count,
        parent: parent
            .or_else(|| snippet.parent_id.clone())
            .unwrap_or_else(|| ROOT_PARENT.to_owned()),
    }
}
