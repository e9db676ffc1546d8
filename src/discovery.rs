//! Expands configured sources into concrete work targets.
//!
//! The scheduler never sees raw source URLs: a channel becomes its uploads
//! plus whichever playlists and podcast shows the source's filters admit, a
//! playlist becomes itself, a video-list becomes its explicit ids.

use anyhow::{Context, Result};
use tracing::{debug, instrument};

use crate::config::{PlaylistInclude, Source, SourceKind};
use crate::platform::{PlaylistDescriptor, VideoPlatform};
use crate::youtube::utils::{extract_playlist_id, extract_video_id};

/// One unit of work for the scheduler.
#[derive(Debug, Clone)]
pub enum WorkTarget {
    ChannelUploads { channel_url: String },
    Playlist { descriptor: PlaylistDescriptor },
    Videos { ids: Vec<String> },
}

/// Expands one enabled source. Disabled sources expand to nothing.
#[instrument(skip(source, platform), fields(url = %source.url))]
pub async fn expand(
    source: &Source,
    platform: &dyn VideoPlatform,
) -> Result<Vec<WorkTarget>> {
    if !source.enabled {
        return Ok(Vec::new());
    }

    let mut targets = Vec::new();
    match source.kind {
        SourceKind::Channel => {
            targets.push(WorkTarget::ChannelUploads {
                channel_url: source.url.clone(),
            });

            let wants_playlists = !matches!(source.include_playlists, PlaylistInclude::None);
            if wants_playlists || source.include_podcasts {
                let playlists = platform
                    .list_channel_playlists(&source.url)
                    .await
                    .with_context(|| format!("listing playlists of {}", source.url))?;
                for descriptor in playlists {
                    if admits(source, &descriptor) {
                        targets.push(WorkTarget::Playlist { descriptor });
                    }
                }
            }
        }
        SourceKind::Playlist => {
            let playlist_id = extract_playlist_id(&source.url)?;
            let descriptor = platform
                .fetch_playlist_info(&playlist_id)
                .await
                .with_context(|| format!("resolving playlist {playlist_id}"))?;
            targets.push(WorkTarget::Playlist { descriptor });
        }
        SourceKind::VideoList => {
            let mut ids = Vec::new();
            for entry in &source.videos {
                ids.push(extract_video_id(entry)?);
            }
            if source.videos.is_empty() {
                ids.push(extract_video_id(&source.url)?);
            }
            targets.push(WorkTarget::Videos { ids });
        }
    }

    debug!("expanded into {} targets", targets.len());
    Ok(targets)
}

/// Whether a channel's playlist passes the source's include/exclude rules.
/// Podcast shows are admitted by the podcast flag alone (the exclude
/// pattern still applies).
fn admits(source: &Source, descriptor: &PlaylistDescriptor) -> bool {
    if let Some(exclude) = &source.exclude_playlists {
        if exclude.is_match(&descriptor.title) {
            return false;
        }
    }
    if descriptor.is_podcast {
        return source.include_podcasts;
    }
    match &source.include_playlists {
        PlaylistInclude::All => true,
        PlaylistInclude::None => false,
        PlaylistInclude::Matching(pattern) => pattern.is_match(&descriptor.title),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    fn source(include: PlaylistInclude, exclude: Option<&str>, podcasts: bool) -> Source {
        Source {
            url: "https://www.youtube.com/@chan".into(),
            kind: SourceKind::Channel,
            enabled: true,
            include_playlists: include,
            exclude_playlists: exclude.map(|p| Regex::new(p).unwrap()),
            include_podcasts: podcasts,
            videos: vec![],
        }
    }

    fn descriptor(title: &str, is_podcast: bool) -> PlaylistDescriptor {
        PlaylistDescriptor {
            playlist_id: "PL1".into(),
            title: title.into(),
            channel_id: "UC1".into(),
            channel_name: "Chan".into(),
            is_podcast,
        }
    }

    #[test]
    fn include_regex_filters_titles() {
        let s = source(
            PlaylistInclude::Matching(Regex::new("(?i)^tutorials").unwrap()),
            None,
            false,
        );
        assert!(admits(&s, &descriptor("Tutorials 2024", false)));
        assert!(!admits(&s, &descriptor("Vlogs", false)));
    }

    #[test]
    fn exclude_beats_include() {
        let s = source(PlaylistInclude::All, Some("(?i)members"), false);
        assert!(admits(&s, &descriptor("Public stuff", false)));
        assert!(!admits(&s, &descriptor("Members only!", false)));
    }

    #[test]
    fn podcasts_gated_by_flag_not_include_pattern() {
        let on = source(PlaylistInclude::None, None, true);
        assert!(admits(&on, &descriptor("My Show", true)));
        assert!(!admits(&on, &descriptor("Regular playlist", false)));

        let off = source(PlaylistInclude::All, None, false);
        assert!(!admits(&off, &descriptor("My Show", true)));
    }
}
