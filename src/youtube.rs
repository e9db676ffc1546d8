use std::sync::LazyLock;

use regex::Regex;

pub mod api;
pub mod structs;
pub mod utils;

pub use api::YouTubeClient;

pub const API_BASE: &str = "https://www.googleapis.com/youtube/v3";
pub const TIMEDTEXT_URL: &str = "https://www.youtube.com/api/timedtext";

/// Environment variable holding the Data API key. Secrets never come from
/// the config file.
pub const API_KEY_ENV: &str = "YOUTUBE_API_KEY";

pub static VIDEO_ID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:youtube\.com/(?:watch\?(?:.*&)?v=|shorts/|live/)|youtu\.be/)([A-Za-z0-9_-]{11})")
        .unwrap()
});

pub static PLAYLIST_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[?&]list=([A-Za-z0-9_-]+)").unwrap());

pub static CHANNEL_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"youtube\.com/channel/(UC[A-Za-z0-9_-]{22})").unwrap());

pub static HANDLE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"youtube\.com/(@[A-Za-z0-9._\-]+)").unwrap());

pub static USER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"youtube\.com/user/([A-Za-z0-9._\-]+)").unwrap());

/// Canonical watch URL registered with the store's URL backend.
pub fn watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}
