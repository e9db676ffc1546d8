use anyhow::{Result, bail};

use crate::youtube::{
    CHANNEL_ID_REGEX, HANDLE_REGEX, PLAYLIST_ID_REGEX, USER_REGEX, VIDEO_ID_REGEX,
};

/// A channel reference extracted from a user-supplied URL, in whichever
/// form the URL used. The Data API takes each form through a different
/// query parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRef {
    Id(String),
    Handle(String),
    User(String),
}

/// Extracts a video id from a raw id or any of the usual URL shapes.
///
/// # Errors
/// Errors when the input is neither a bare 11-character id nor a
/// recognizable YouTube URL.
pub fn extract_video_id(input: &str) -> Result<String> {
    let trimmed = input.trim();
    if trimmed.len() == 11
        && trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Ok(trimmed.to_owned());
    }
    if let Some(captures) = VIDEO_ID_REGEX.captures(trimmed) {
        return Ok(captures[1].to_owned());
    }
    bail!("cannot extract a video id from `{input}`")
}

/// Extracts a playlist id from a raw id or a URL with a `list=` parameter.
pub fn extract_playlist_id(input: &str) -> Result<String> {
    let trimmed = input.trim();
    if let Some(captures) = PLAYLIST_ID_REGEX.captures(trimmed) {
        return Ok(captures[1].to_owned());
    }
    if trimmed.starts_with("PL") || trimmed.starts_with("UU") || trimmed.starts_with("OL") {
        return Ok(trimmed.to_owned());
    }
    bail!("cannot extract a playlist id from `{input}`")
}

/// Parses a channel URL into whichever reference form it carries.
pub fn parse_channel_url(input: &str) -> Result<ChannelRef> {
    let trimmed = input.trim();
    if let Some(captures) = CHANNEL_ID_REGEX.captures(trimmed) {
        return Ok(ChannelRef::Id(captures[1].to_owned()));
    }
    if let Some(captures) = USER_REGEX.captures(trimmed) {
        return Ok(ChannelRef::User(captures[1].to_owned()));
    }
    if let Some(captures) = HANDLE_REGEX.captures(trimmed) {
        return Ok(ChannelRef::Handle(captures[1].to_owned()));
    }
    if trimmed.starts_with("UC") && trimmed.len() == 24 {
        return Ok(ChannelRef::Id(trimmed.to_owned()));
    }
    if let Some(handle) = trimmed.strip_prefix('@') {
        return Ok(ChannelRef::Handle(format!("@{handle}")));
    }
    bail!("cannot parse `{input}` as a channel URL, id, or handle")
}

/// Parses an ISO-8601 duration of the shape the Data API emits
/// (`PT1H2M3S`, `P1DT2H`). Returns seconds.
pub fn parse_iso8601_duration(raw: &str) -> Option<u64> {
    let rest = raw.strip_prefix('P')?;
    let (date_part, time_part) = match rest.split_once('T') {
        Some((d, t)) => (d, t),
        None => (rest, ""),
    };

    let mut seconds: u64 = 0;
    let mut number = String::new();
    for c in date_part.chars() {
        if c.is_ascii_digit() {
            number.push(c);
        } else {
            let value: u64 = number.parse().ok()?;
            number.clear();
            seconds += match c {
                'D' => value * 86_400,
                'W' => value * 7 * 86_400,
                _ => return None,
            };
        }
    }
    if !number.is_empty() {
        return None;
    }
    for c in time_part.chars() {
        if c.is_ascii_digit() {
            number.push(c);
        } else {
            let value: u64 = number.parse().ok()?;
            number.clear();
            seconds += match c {
                'H' => value * 3600,
                'M' => value * 60,
                'S' => value,
                _ => return None,
            };
        }
    }
    if !number.is_empty() {
        return None;
    }
    Some(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_id_from_watch_and_short_urls() {
        for input in [
            "dQw4w9WgXcQ",
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://www.youtube.com/watch?feature=share&v=dQw4w9WgXcQ",
            "https://youtu.be/dQw4w9WgXcQ",
            "https://www.youtube.com/shorts/dQw4w9WgXcQ",
        ] {
            assert_eq!(extract_video_id(input).unwrap(), "dQw4w9WgXcQ", "{input}");
        }
        assert!(extract_video_id("https://example.com/").is_err());
    }

    #[test]
    fn playlist_id_from_url_or_raw() {
        assert_eq!(
            extract_playlist_id("https://www.youtube.com/playlist?list=PLabc123").unwrap(),
            "PLabc123"
        );
        assert_eq!(extract_playlist_id("PLabc123").unwrap(), "PLabc123");
        assert!(extract_playlist_id("what").is_err());
    }

    #[test]
    fn channel_forms() {
        assert_eq!(
            parse_channel_url("https://www.youtube.com/channel/UCuAXFkgsw1L7xaCfnd5JJOw").unwrap(),
            ChannelRef::Id("UCuAXFkgsw1L7xaCfnd5JJOw".to_owned())
        );
        assert_eq!(
            parse_channel_url("https://www.youtube.com/@SomeHandle").unwrap(),
            ChannelRef::Handle("@SomeHandle".to_owned())
        );
        assert_eq!(
            parse_channel_url("https://www.youtube.com/user/legacyname").unwrap(),
            ChannelRef::User("legacyname".to_owned())
        );
        assert_eq!(
            parse_channel_url("@bare").unwrap(),
            ChannelRef::Handle("@bare".to_owned())
        );
    }

    #[test]
    fn durations() {
        assert_eq!(parse_iso8601_duration("PT3M20S"), Some(200));
        assert_eq!(parse_iso8601_duration("PT1H"), Some(3600));
        assert_eq!(parse_iso8601_duration("P1DT1S"), Some(86_401));
        assert_eq!(parse_iso8601_duration("PT0S"), Some(0));
        assert_eq!(parse_iso8601_duration("nonsense"), None);
    }
}
