//! Declarative archive configuration.
//!
//! The file lives at `.tubevault/config.toml` inside the archive. Parsing
//! and validation happen entirely up front: a config that loads is a config
//! the pipeline can run with. Secrets never live here; the API key comes
//! from the `YOUTUBE_API_KEY` environment variable.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use indoc::indoc;
use regex::Regex;
use serde::Deserialize;

use crate::paths;

pub const CONFIG_DIR: &str = ".tubevault";
pub const CONFIG_FILE: &str = "config.toml";

/// Configuration failures abort before the pipeline starts (exit code 3).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    Channel,
    Playlist,
    VideoList,
}

/// Which of a channel's playlists to archive alongside its uploads.
#[derive(Debug, Clone)]
pub enum PlaylistInclude {
    All,
    None,
    Matching(Regex),
}

#[derive(Debug, Clone)]
pub struct Source {
    pub url: String,
    pub kind: SourceKind,
    pub enabled: bool,
    pub include_playlists: PlaylistInclude,
    pub exclude_playlists: Option<Regex>,
    pub include_podcasts: bool,
    /// Explicit video URLs/ids for `kind = "video-list"` sources.
    pub videos: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Components {
    /// Download video binaries. Default false: track URLs only.
    pub videos: bool,
    pub metadata: bool,
    /// Max comments per video; 0 disables comment fetching.
    pub comments_depth: u32,
    pub captions: bool,
    pub caption_languages: Option<Regex>,
    pub auto_translated_captions: bool,
    pub thumbnails: bool,
}

#[derive(Debug, Clone)]
pub struct Organization {
    pub video_path_pattern: String,
    pub playlist_prefix_width: usize,
    pub playlist_prefix_separator: String,
}

#[derive(Debug, Clone, Default)]
pub struct Filters {
    pub date_start: Option<NaiveDate>,
    pub date_end: Option<NaiveDate>,
    pub license: Option<String>,
    pub limit: Option<usize>,
    pub exclude_shorts: bool,
}

#[derive(Debug, Clone)]
pub struct Backup {
    pub checkpoint_interval: usize,
    pub auto_commit_on_interrupt: bool,
    /// Recent-social-window for `all-incremental` refreshes.
    pub social_window_days: u32,
}

#[derive(Debug, Clone)]
pub struct Api {
    pub quota_auto_wait: bool,
    pub quota_max_wait: Duration,
    pub quota_check_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct Network {
    pub proxy: Option<String>,
    /// Requests per second against the platform host.
    pub limit_rate: u32,
    /// Optional extra sleep between requests, composing with the bucket.
    pub sleep_interval: Option<Duration>,
    pub workers: usize,
    pub metadata_timeout: Duration,
    pub captions_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct IndirectRemote {
    pub name: String,
    pub kind: String,
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub sources: Vec<Source>,
    pub components: Components,
    pub organization: Organization,
    pub filters: Filters,
    pub backup: Backup,
    pub api: Api,
    pub network: Network,
    pub remotes: Vec<IndirectRemote>,
}

impl Config {
    /// Loads and validates `<archive>/.tubevault/config.toml`.
    pub fn load(archive_root: &Path) -> Result<Self, ConfigError> {
        let path = archive_root.join(CONFIG_DIR).join(CONFIG_FILE);
        let content = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let raw: RawConfig =
            toml::from_str(&content).map_err(|source| ConfigError::Parse { path, source })?;
        Self::validate(raw)
    }

    fn validate(raw: RawConfig) -> Result<Self, ConfigError> {
        let invalid = |msg: String| ConfigError::Invalid(msg);

        paths::validate_pattern(&raw.organization.video_path_pattern)
            .map_err(|e| invalid(format!("organization.video_path_pattern: {e}")))?;

        let width = raw.organization.playlist_prefix_width;
        if !(1..=9).contains(&width) {
            return Err(invalid(format!(
                "organization.playlist_prefix_width must be 1..=9, got {width}"
            )));
        }

        if raw.backup.checkpoint_interval == 0 {
            return Err(invalid(
                "backup.checkpoint_interval must be at least 1".into(),
            ));
        }
        if raw.network.workers == 0 {
            return Err(invalid("network.workers must be at least 1".into()));
        }
        if raw.network.limit_rate == 0 {
            return Err(invalid("network.limit_rate must be at least 1".into()));
        }

        let parse_date = |key: &str, value: &Option<String>| -> Result<Option<NaiveDate>, ConfigError> {
            value
                .as_deref()
                .map(|v| {
                    NaiveDate::parse_from_str(v, "%Y-%m-%d")
                        .map_err(|e| invalid(format!("filters.{key}: {e}")))
                })
                .transpose()
        };
        let date_start = parse_date("date_start", &raw.filters.date_start)?;
        let date_end = parse_date("date_end", &raw.filters.date_end)?;
        if let (Some(start), Some(end)) = (date_start, date_end) {
            if start > end {
                return Err(invalid("filters.date_start is after filters.date_end".into()));
            }
        }

        let compile = |key: &str, pattern: &str| -> Result<Regex, ConfigError> {
            Regex::new(pattern).map_err(|e| invalid(format!("{key}: {e}")))
        };

        let mut sources = Vec::with_capacity(raw.sources.len());
        for (i, s) in raw.sources.iter().enumerate() {
            if s.url.is_empty() && s.kind != SourceKind::VideoList {
                return Err(invalid(format!("sources[{i}].url is empty")));
            }
            if s.kind == SourceKind::VideoList && s.videos.is_empty() && s.url.is_empty() {
                return Err(invalid(format!(
                    "sources[{i}] is a video-list with neither url nor videos"
                )));
            }
            let include_playlists = match s.include_playlists.as_str() {
                "all" => PlaylistInclude::All,
                "none" => PlaylistInclude::None,
                pattern => PlaylistInclude::Matching(compile(
                    &format!("sources[{i}].include_playlists"),
                    pattern,
                )?),
            };
            let exclude_playlists = s
                .exclude_playlists
                .as_deref()
                .map(|p| compile(&format!("sources[{i}].exclude_playlists"), p))
                .transpose()?;
            sources.push(Source {
                url: s.url.clone(),
                kind: s.kind,
                enabled: s.enabled,
                include_playlists,
                exclude_playlists,
                include_podcasts: s.include_podcasts,
                videos: s.videos.clone(),
            });
        }

        let caption_languages = raw
            .components
            .caption_languages
            .as_deref()
            .map(|p| compile("components.caption_languages", p))
            .transpose()?;

        Ok(Self {
            sources,
            components: Components {
                videos: raw.components.videos,
                metadata: raw.components.metadata,
                comments_depth: raw.components.comments_depth,
                captions: raw.components.captions,
                caption_languages,
                auto_translated_captions: raw.components.auto_translated_captions,
                thumbnails: raw.components.thumbnails,
            },
            organization: Organization {
                video_path_pattern: raw.organization.video_path_pattern,
                playlist_prefix_width: width,
                playlist_prefix_separator: raw.organization.playlist_prefix_separator,
            },
            filters: Filters {
                date_start,
                date_end,
                license: raw.filters.license,
                limit: raw.filters.limit,
                exclude_shorts: raw.filters.exclude_shorts,
            },
            backup: Backup {
                checkpoint_interval: raw.backup.checkpoint_interval,
                auto_commit_on_interrupt: raw.backup.auto_commit_on_interrupt,
                social_window_days: raw.backup.social_window_days,
            },
            api: Api {
                quota_auto_wait: raw.api.quota_auto_wait,
                quota_max_wait: Duration::from_secs(u64::from(raw.api.quota_max_wait_hours) * 3600),
                quota_check_interval: Duration::from_secs(
                    u64::from(raw.api.quota_check_interval_min) * 60,
                ),
            },
            network: Network {
                proxy: raw.network.proxy,
                limit_rate: raw.network.limit_rate,
                sleep_interval: raw.network.sleep_interval.map(Duration::from_secs),
                workers: raw.network.workers,
                metadata_timeout: Duration::from_secs(raw.network.metadata_timeout_secs),
                captions_timeout: Duration::from_secs(raw.network.captions_timeout_secs),
            },
            remotes: raw
                .remotes
                .into_iter()
                .map(|r| IndirectRemote {
                    name: r.name,
                    kind: r.kind,
                    params: r.params,
                })
                .collect(),
        })
    }

    /// The commented template written by `tubevault init`.
    pub fn template() -> &'static str {
        indoc! {r#"
            # tubevault archive configuration.
            #
            # Secrets are NOT read from this file. Put the Data API key in the
            # YOUTUBE_API_KEY environment variable (or a .env file).

            [[sources]]
            url = "https://www.youtube.com/@example"
            kind = "channel"            # channel | playlist | video-list
            enabled = false
            include_playlists = "none"  # all | none | <regex over titles>
            # exclude_playlists = "(?i)members"
            include_podcasts = false

            [components]
            videos = false              # false: track URLs only, fetch on demand
            metadata = true
            comments_depth = 0          # 0 disables comments
            captions = false
            # caption_languages = "^(en|fr)"
            auto_translated_captions = false
            thumbnails = true

            [organization]
            video_path_pattern = "{year}/{month}/{date}_{sanitized_title}"
            playlist_prefix_width = 4
            playlist_prefix_separator = "_"

            [filters]
            # date_start = "2020-01-01"
            # date_end = "2024-12-31"
            # license = "creativeCommon"
            # limit = 100
            exclude_shorts = false

            [backup]
            checkpoint_interval = 50
            auto_commit_on_interrupt = true
            social_window_days = 7

            [api]
            quota_auto_wait = true
            quota_max_wait_hours = 48
            quota_check_interval_min = 30

            [network]
            # proxy = "socks5://localhost:9050"
            limit_rate = 4              # requests per second
            # sleep_interval = 1
            workers = 4
            metadata_timeout_secs = 60
            captions_timeout_secs = 180

            # [[remotes]]
            # name = "offsite"
            # kind = "rsync"
            # [remotes.params]
            # rsyncurl = "backup@host:/srv/tubevault"
        "#}
    }
}

// Raw serde mirror of the file. Validation turns this into `Config`.

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    sources: Vec<RawSource>,
    #[serde(default)]
    components: RawComponents,
    #[serde(default)]
    organization: RawOrganization,
    #[serde(default)]
    filters: RawFilters,
    #[serde(default)]
    backup: RawBackup,
    #[serde(default)]
    api: RawApi,
    #[serde(default)]
    network: RawNetwork,
    #[serde(default)]
    remotes: Vec<RawRemote>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSource {
    #[serde(default)]
    url: String,
    kind: SourceKind,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default = "default_include_playlists")]
    include_playlists: String,
    #[serde(default)]
    exclude_playlists: Option<String>,
    #[serde(default)]
    include_podcasts: bool,
    #[serde(default)]
    videos: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawComponents {
    #[serde(default)]
    videos: bool,
    #[serde(default = "default_true")]
    metadata: bool,
    #[serde(default)]
    comments_depth: u32,
    #[serde(default)]
    captions: bool,
    #[serde(default)]
    caption_languages: Option<String>,
    #[serde(default)]
    auto_translated_captions: bool,
    #[serde(default = "default_true")]
    thumbnails: bool,
}

impl Default for RawComponents {
    fn default() -> Self {
        Self {
            videos: false,
            metadata: true,
            comments_depth: 0,
            captions: false,
            caption_languages: None,
            auto_translated_captions: false,
            thumbnails: true,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawOrganization {
    #[serde(default = "default_pattern")]
    video_path_pattern: String,
    #[serde(default = "default_prefix_width")]
    playlist_prefix_width: usize,
    #[serde(default = "default_prefix_separator")]
    playlist_prefix_separator: String,
}

impl Default for RawOrganization {
    fn default() -> Self {
        Self {
            video_path_pattern: default_pattern(),
            playlist_prefix_width: default_prefix_width(),
            playlist_prefix_separator: default_prefix_separator(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFilters {
    #[serde(default)]
    date_start: Option<String>,
    #[serde(default)]
    date_end: Option<String>,
    #[serde(default)]
    license: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    exclude_shorts: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBackup {
    #[serde(default = "default_checkpoint_interval")]
    checkpoint_interval: usize,
    #[serde(default = "default_true")]
    auto_commit_on_interrupt: bool,
    #[serde(default = "default_social_window")]
    social_window_days: u32,
}

impl Default for RawBackup {
    fn default() -> Self {
        Self {
            checkpoint_interval: default_checkpoint_interval(),
            auto_commit_on_interrupt: true,
            social_window_days: default_social_window(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawApi {
    #[serde(default = "default_true")]
    quota_auto_wait: bool,
    #[serde(default = "default_quota_max_wait_hours")]
    quota_max_wait_hours: u32,
    #[serde(default = "default_quota_check_interval_min")]
    quota_check_interval_min: u32,
}

impl Default for RawApi {
    fn default() -> Self {
        Self {
            quota_auto_wait: true,
            quota_max_wait_hours: default_quota_max_wait_hours(),
            quota_check_interval_min: default_quota_check_interval_min(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawNetwork {
    #[serde(default)]
    proxy: Option<String>,
    #[serde(default = "default_limit_rate")]
    limit_rate: u32,
    #[serde(default)]
    sleep_interval: Option<u64>,
    #[serde(default = "default_workers")]
    workers: usize,
    #[serde(default = "default_metadata_timeout")]
    metadata_timeout_secs: u64,
    #[serde(default = "default_captions_timeout")]
    captions_timeout_secs: u64,
}

impl Default for RawNetwork {
    fn default() -> Self {
        Self {
            proxy: None,
            limit_rate: default_limit_rate(),
            sleep_interval: None,
            workers: default_workers(),
            metadata_timeout_secs: default_metadata_timeout(),
            captions_timeout_secs: default_captions_timeout(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRemote {
    name: String,
    kind: String,
    #[serde(default)]
    params: BTreeMap<String, String>,
}

const fn default_true() -> bool {
    true
}
fn default_include_playlists() -> String {
    "none".to_owned()
}
fn default_pattern() -> String {
    "{year}/{month}/{date}_{sanitized_title}".to_owned()
}
const fn default_prefix_width() -> usize {
    4
}
fn default_prefix_separator() -> String {
    "_".to_owned()
}
const fn default_checkpoint_interval() -> usize {
    50
}
const fn default_social_window() -> u32 {
    7
}
const fn default_quota_max_wait_hours() -> u32 {
    48
}
const fn default_quota_check_interval_min() -> u32 {
    30
}
const fn default_limit_rate() -> u32 {
    4
}
const fn default_workers() -> usize {
    4
}
const fn default_metadata_timeout() -> u64 {
    60
}
const fn default_captions_timeout() -> u64 {
    180
}
