//! Wire models for the Data API v3 responses. Only the fields the archiver
//! consumes are declared; everything else is ignored on deserialize.

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// The paged list envelope every collection endpoint shares.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse<T> {
    #[serde(default)]
    pub next_page_token: Option<String>,
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelResource {
    pub id: String,
    pub snippet: Option<ChannelSnippet>,
    pub content_details: Option<ChannelContentDetails>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSnippet {
    pub title: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelContentDetails {
    pub related_playlists: RelatedPlaylists,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedPlaylists {
    pub uploads: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistResource {
    pub id: String,
    pub snippet: PlaylistSnippet,
    pub status: Option<PlaylistStatus>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistSnippet {
    pub title: String,
    pub channel_id: String,
    #[serde(default)]
    pub channel_title: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistStatus {
    pub podcast_status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistItemResource {
    pub snippet: Option<PlaylistItemSnippet>,
    pub content_details: Option<PlaylistItemContentDetails>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistItemSnippet {
    #[serde(default)]
    pub title: String,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistItemContentDetails {
    pub video_id: String,
    pub video_published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoResource {
    pub id: String,
    pub snippet: Option<VideoSnippet>,
    pub content_details: Option<VideoContentDetails>,
    pub statistics: Option<VideoStatistics>,
    pub status: Option<VideoStatus>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoSnippet {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub channel_id: String,
    pub channel_title: String,
    pub published_at: DateTime<Utc>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    pub category_id: Option<String>,
    pub thumbnails: Option<Thumbnails>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thumbnails {
    pub maxres: Option<Thumbnail>,
    pub high: Option<Thumbnail>,
    pub medium: Option<Thumbnail>,
    pub default: Option<Thumbnail>,
}

impl Thumbnails {
    /// Largest available variant.
    pub fn best_url(&self) -> Option<&str> {
        [&self.maxres, &self.high, &self.medium, &self.default]
            .into_iter()
            .flatten()
            .map(|t| t.url.as_str())
            .next()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thumbnail {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoContentDetails {
    pub duration: Option<String>,
}

/// Counts arrive as decimal strings on the wire.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoStatistics {
    pub view_count: Option<String>,
    pub like_count: Option<String>,
    pub comment_count: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoStatus {
    pub privacy_status: Option<String>,
    pub license: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentThreadResource {
    pub snippet: CommentThreadSnippet,
    pub replies: Option<CommentReplies>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentThreadSnippet {
    pub top_level_comment: CommentResource,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentReplies {
    #[serde(default = "Vec::new")]
    pub comments: Vec<CommentResource>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentResource {
    pub id: String,
    pub snippet: CommentSnippet,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentSnippet {
    pub author_display_name: String,
    pub author_channel_id: Option<AuthorChannelId>,
    pub text_original: Option<String>,
    pub text_display: Option<String>,
    #[serde(default)]
    pub like_count: u64,
    pub published_at: DateTime<Utc>,
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorChannelId {
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptionResource {
    pub snippet: CaptionSnippet,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptionSnippet {
    pub language: String,
    /// `standard` or `asr` (auto-generated).
    #[serde(default)]
    pub track_kind: String,
    /// Track name; vendor variants such as `en-cur1` show up here.
    #[serde(default)]
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_resource_parses_statistics_strings() {
        let raw = serde_json::json!({
            "id": "dQw4w9WgXcQ",
            "snippet": {
                "title": "T",
                "channelId": "UC1",
                "channelTitle": "Chan",
                "publishedAt": "2024-03-01T10:00:00Z",
                "thumbnails": {"high": {"url": "https://i.ytimg.com/x/hq.jpg"}}
            },
            "contentDetails": {"duration": "PT2M"},
            "statistics": {"viewCount": "12345", "likeCount": "67"},
            "status": {"privacyStatus": "public", "license": "youtube"}
        });
        let video: VideoResource = serde_json::from_value(raw).unwrap();
        let snippet = video.snippet.unwrap();
        assert_eq!(snippet.channel_id, "UC1");
        assert_eq!(
            snippet.thumbnails.unwrap().best_url(),
            Some("https://i.ytimg.com/x/hq.jpg")
        );
        assert_eq!(video.statistics.unwrap().view_count.as_deref(), Some("12345"));
    }

    #[test]
    fn list_envelope_defaults_missing_items() {
        let raw = serde_json::json!({"nextPageToken": "abc"});
        let page: ListResponse<VideoResource> = serde_json::from_value(raw).unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.next_page_token.as_deref(), Some("abc"));
    }
}
