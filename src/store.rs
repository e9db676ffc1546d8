//! The repository store: every mutation of the working tree goes through
//! here.
//!
//! The store wraps a git repository with a large-file layer whose URL
//! backend tracks binaries by their source URL. Small text files (TSV,
//! markdown, JSON indices) live directly in git; video containers,
//! thumbnails and per-video `comments.json` become indirect references.
//! The production backend shells out to git/git-annex; tests use a plain
//! filesystem fake with the same commit semantics.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;

use crate::config::IndirectRemote;
use crate::model::TIMESTAMP_FIELDS;

pub mod annex;
#[cfg(test)]
pub mod plain;

/// What kind of content an indirect entry holds. Becomes the `filetype`
/// metadata tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileKind {
    Video,
    Thumbnail,
    Caption(String),
}

impl std::fmt::Display for FileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Video => f.write_str("video"),
            Self::Thumbnail => f.write_str("thumbnail"),
            Self::Caption(lang) => write!(f, "caption.{lang}"),
        }
    }
}

/// Metadata tags attached to every indirect entry.
#[derive(Debug, Clone)]
pub struct EntryTags {
    pub video_id: String,
    pub channel: String,
    pub published: DateTime<Utc>,
    pub filetype: FileKind,
}

impl EntryTags {
    /// `field=value` pairs in a fixed order.
    pub fn pairs(&self) -> Vec<(String, String)> {
        vec![
            ("video_id".to_owned(), self.video_id.clone()),
            ("channel".to_owned(), self.channel.clone()),
            ("published".to_owned(), self.published.to_rfc3339()),
            ("filetype".to_owned(), self.filetype.to_string()),
        ]
    }
}

/// File-tracking policy written to `.gitattributes` at init time. This is
/// the single persistent rule set; all later mutations respect it.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrackingRules {
    /// Route caption `.vtt` files to the indirect store too. Off by
    /// default: captions are small text.
    pub captions_indirect: bool,
}

impl TrackingRules {
    pub fn render(&self) -> String {
        let mut rules = String::from("* annex.largefiles=nothing\n");
        rules.push_str("video.* annex.largefiles=anything\n");
        if !self.captions_indirect {
            // Keep caption tracks as direct text despite the video.* rule.
            rules.push_str("video.*.vtt annex.largefiles=nothing\n");
        }
        rules.push_str("thumbnail.* annex.largefiles=anything\n");
        rules.push_str("comments.json annex.largefiles=anything\n");
        rules
    }
}

/// The single seam through which the working tree is mutated. Implementors
/// must keep every operation idempotent and leave the tree usable after any
/// failure.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    fn root(&self) -> &Path;

    /// Writes `bytes` to `rel` so that afterwards either the new content is
    /// fully present or the previous state is intact. Tracked indirect
    /// entries (read-only symlinks) are unlinked first and restored when
    /// the write fails.
    async fn atomic_write(&self, rel: &Path, bytes: &[u8]) -> Result<()>;

    /// Stages `rel` as an indirect reference resolvable from `url` and
    /// attaches `tags` to the entry.
    async fn register_url(&self, rel: &Path, url: &str, tags: &EntryTags) -> Result<()>;

    /// Attaches metadata tags to an already-tracked entry.
    async fn tag_entry(&self, rel: &Path, tags: &EntryTags) -> Result<()>;

    /// Fetches the actual content of a URL-backed entry into the working
    /// tree (opt-in binary download).
    async fn materialize(&self, rel: &Path) -> Result<()>;

    /// Renames an entry, preserving history.
    async fn move_entry(&self, old_rel: &Path, new_rel: &Path) -> Result<()>;

    /// Creates a symlink at `rel` pointing at `target` (a path relative to
    /// the link's directory). An existing link at `rel` is replaced.
    async fn symlink(&self, rel: &Path, target: &Path) -> Result<()>;

    /// Removes a file or symlink. Missing paths are fine.
    async fn remove(&self, rel: &Path) -> Result<()>;

    /// Stages everything and commits, unless the staged diff is
    /// timestamp-only; those rewrites are rolled back and no commit is
    /// created. Returns whether a commit was made.
    async fn commit(&self, message: &str) -> Result<bool>;

    async fn uncommitted_changes(&self) -> Result<bool>;

    /// Registers a pluggable storage backend binaries can be replicated to.
    async fn configure_remote(&self, remote: &IndirectRemote) -> Result<()>;
}

static TIMESTAMP_LINE: LazyLock<Regex> = LazyLock::new(|| {
    let fields = TIMESTAMP_FIELDS.join("|");
    // Two shapes: a JSON `"field": ...` line, or a captions.tsv row whose
    // trailing cell is its fetch instant.
    Regex::new(&format!(
        r#""({fields})"\s*:|^[^\t]+\t(?:true|false)\t[^\t]+\t\d{{4}}-\d{{2}}-\d{{2}}T[0-9:.]+(?:Z|[+-]\d{{2}}:\d{{2}})$"#
    ))
    .unwrap()
});

/// Whether a changed line touches only a timestamp field. Used by commit
/// filtering: a diff consisting solely of such lines is not a content
/// change.
pub fn is_timestamp_only_line(line: &str) -> bool {
    TIMESTAMP_LINE.is_match(line)
}

/// Filters a file's content down to the lines that count as content. Two
/// files whose filtered forms are equal differ only in timestamps.
pub fn content_signature(bytes: &[u8]) -> Vec<u8> {
    let Ok(text) = std::str::from_utf8(bytes) else {
        return bytes.to_vec();
    };
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        if !is_timestamp_only_line(line) {
            out.push_str(line);
            out.push('\n');
        }
    }
    out.into_bytes()
}

/// Relative paths of every file under `root`, sorted, ignoring the `.git`
/// directory.
pub fn tree_files(root: &Path) -> Result<Vec<std::path::PathBuf>> {
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git")
    {
        let entry = entry?;
        if entry.file_type().is_file() || entry.file_type().is_symlink() {
            files.push(entry.path().strip_prefix(root)?.to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}
