//! Expands the configurable video path pattern into per-video directories.
//!
//! A pattern is a `/`-separated template over a fixed placeholder set, e.g.
//! the default `{year}/{month}/{date}_{sanitized_title}`. Unknown
//! placeholders are a configuration error; resolution itself cannot fail.

use anyhow::{Result, bail};
use chrono::{DateTime, Datelike, Utc};

pub const PLACEHOLDERS: &[&str] = &[
    "year",
    "month",
    "date",
    "video_id",
    "sanitized_title",
    "channel_id",
    "channel_name",
];

/// Longest byte length of a single expanded path segment. Segments are
/// truncated UTF-8-safely, never split inside a codepoint.
const MAX_SEGMENT_BYTES: usize = 120;

/// Everything the pattern can reference about a video.
#[derive(Debug, Clone, Copy)]
pub struct ResolveInput<'a> {
    pub video_id: &'a str,
    pub title: &'a str,
    pub channel_id: &'a str,
    pub channel_name: &'a str,
    pub published: DateTime<Utc>,
}

/// Checks a pattern at configuration time: placeholders must be known and
/// braces balanced.
pub fn validate_pattern(pattern: &str) -> Result<()> {
    if pattern.is_empty() {
        bail!("pattern is empty");
    }
    let mut rest = pattern;
    while let Some(open) = rest.find('{') {
        let Some(close) = rest[open..].find('}') else {
            bail!("unclosed `{{` in pattern");
        };
        let name = &rest[open + 1..open + close];
        if !PLACEHOLDERS.contains(&name) {
            bail!(
                "unknown placeholder `{{{name}}}` (known: {})",
                PLACEHOLDERS.join(", ")
            );
        }
        rest = &rest[open + close + 1..];
    }
    if rest.contains('}') {
        bail!("unmatched `}}` in pattern");
    }
    Ok(())
}

/// Expands `pattern` for one video. The result is relative to the canonical
/// video tree (no `videos/` prefix) and every segment is sanitized and
/// length-capped.
pub fn resolve(pattern: &str, input: &ResolveInput<'_>) -> String {
    let published = input.published;
    let expanded = expand(pattern, |name| match name {
        "year" => format!("{:04}", published.year()),
        "month" => format!("{:02}", published.month()),
        "date" => published.format("%Y-%m-%d").to_string(),
        "video_id" => input.video_id.to_owned(),
        // Empty titles fall back to the video id so directories stay
        // distinct and non-empty.
        "sanitized_title" => {
            let s = sanitize(input.title);
            if s.is_empty() {
                input.video_id.to_owned()
            } else {
                s
            }
        }
        "channel_id" => input.channel_id.to_owned(),
        "channel_name" => {
            let s = sanitize(input.channel_name);
            if s.is_empty() {
                input.channel_id.to_owned()
            } else {
                s
            }
        }
        _ => unreachable!("pattern validated at load time"),
    });

    expanded
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(cap_segment)
        .collect::<Vec<_>>()
        .join("/")
}

fn expand(pattern: &str, lookup: impl Fn(&str) -> String) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut rest = pattern;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let close = rest[open..].find('}').expect("pattern validated") + open;
        out.push_str(&lookup(&rest[open + 1..close]));
        rest = &rest[close + 1..];
    }
    out.push_str(rest);
    out
}

/// Replaces every character outside `[letters, digits, '.', '_', '-']` with
/// `-`, collapses runs of `-`, and strips leading/trailing separators.
/// Unicode letters and digits are preserved.
pub fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_dash = false;
    for c in raw.chars() {
        let mapped = if c.is_alphanumeric() || matches!(c, '.' | '_' | '-') {
            c
        } else {
            '-'
        };
        if mapped == '-' {
            if last_was_dash {
                continue;
            }
            last_was_dash = true;
        } else {
            last_was_dash = false;
        }
        out.push(mapped);
    }
    out.trim_matches(|c| matches!(c, '-' | '.' | '_')).to_owned()
}

fn cap_segment(segment: &str) -> String {
    if segment.len() <= MAX_SEGMENT_BYTES {
        return segment.to_owned();
    }
    let mut end = MAX_SEGMENT_BYTES;
    while !segment.is_char_boundary(end) {
        end -= 1;
    }
    segment[..end].to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn input<'a>(title: &'a str) -> ResolveInput<'a> {
        ResolveInput {
            video_id: "dQw4w9WgXcQ",
            title,
            channel_id: "UC123",
            channel_name: "Some Channel",
            published: Utc.with_ymd_and_hms(2024, 3, 9, 18, 30, 0).unwrap(),
        }
    }

    #[test]
    fn default_pattern_resolves() {
        let got = resolve("{year}/{month}/{date}_{sanitized_title}", &input("Hello, World!"));
        assert_eq!(got, "2024/03/2024-03-09_Hello-World");
    }

    #[test]
    fn validate_rejects_unknown_placeholder() {
        assert!(validate_pattern("{year}/{bogus}").is_err());
        assert!(validate_pattern("{year").is_err());
        assert!(validate_pattern("").is_err());
        assert!(validate_pattern("{year}/{month}/{date}_{sanitized_title}").is_ok());
    }

    #[test]
    fn sanitize_replaces_and_collapses() {
        assert_eq!(sanitize("a/b\\c"), "a-b-c");
        assert_eq!(sanitize("  spaced   out  "), "spaced-out");
        assert_eq!(sanitize("__already_fine__"), "already_fine");
        assert_eq!(sanitize("***"), "");
    }

    #[test]
    fn sanitize_preserves_unicode_letters() {
        assert_eq!(sanitize("日本語 タイトル"), "日本語-タイトル");
        assert_eq!(sanitize("נסיון עברית"), "נסיון-עברית");
    }

    #[test]
    fn sanitize_strips_nul_and_separators() {
        assert_eq!(sanitize("a\0b"), "a-b");
        assert_eq!(sanitize("../../etc/passwd"), "etc-passwd");
    }

    #[test]
    fn empty_title_falls_back_to_video_id() {
        let got = resolve("{sanitized_title}", &input("???"));
        assert_eq!(got, "dQw4w9WgXcQ");
    }

    #[test]
    fn long_segments_are_capped_on_char_boundaries() {
        let long = "é".repeat(200);
        let got = resolve("{sanitized_title}", &input(&long));
        assert!(got.len() <= 120);
        assert!(got.chars().all(|c| c == 'é'));
    }

    #[test]
    fn channel_name_placeholder_is_sanitized() {
        let got = resolve("{channel_name}/{video_id}", &input("t"));
        assert_eq!(got, "Some-Channel/dQw4w9WgXcQ");
    }
}
