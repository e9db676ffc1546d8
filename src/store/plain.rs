//! Plain-filesystem store used by tests: no git, no annex, but the same
//! commit semantics (timestamp-only diffs roll back and produce no commit)
//! so pipeline tests exercise the real contract.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::config::IndirectRemote;
use crate::store::{ArchiveStore, EntryTags, content_signature, tree_files};

#[derive(Debug)]
pub struct PlainStore {
    root: PathBuf,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    /// Raw tree content at the last commit.
    committed: BTreeMap<PathBuf, Vec<u8>>,
    commits: Vec<String>,
    registered: BTreeMap<PathBuf, (String, Vec<(String, String)>)>,
    remotes: Vec<String>,
}

impl PlainStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn commit_messages(&self) -> Vec<String> {
        self.inner.lock().unwrap().commits.clone()
    }

    pub fn registered_urls(&self) -> BTreeMap<PathBuf, String> {
        self.inner
            .lock()
            .unwrap()
            .registered
            .iter()
            .map(|(p, (url, _))| (p.clone(), url.clone()))
            .collect()
    }

    pub fn tags_for(&self, rel: &Path) -> Option<Vec<(String, String)>> {
        self.inner
            .lock()
            .unwrap()
            .registered
            .get(rel)
            .map(|(_, tags)| tags.clone())
    }

    pub fn remote_names(&self) -> Vec<String> {
        self.inner.lock().unwrap().remotes.clone()
    }

    fn snapshot(&self) -> Result<BTreeMap<PathBuf, Vec<u8>>> {
        let mut map = BTreeMap::new();
        for rel in tree_files(&self.root)? {
            let abs = self.root.join(&rel);
            let meta = std::fs::symlink_metadata(&abs)?;
            // Symlinks are captured by target, not by pointee content.
            let content = if meta.file_type().is_symlink() {
                std::fs::read_link(&abs)?
                    .as_os_str()
                    .as_encoded_bytes()
                    .to_vec()
            } else {
                std::fs::read(&abs).with_context(|| format!("reading {}", rel.display()))?
            };
            map.insert(rel, content);
        }
        Ok(map)
    }
}

#[async_trait]
impl ArchiveStore for PlainStore {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn atomic_write(&self, rel: &Path, bytes: &[u8]) -> Result<()> {
        let abs = self.root.join(rel);
        if let Some(parent) = abs.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(abs, bytes)?;
        Ok(())
    }

    async fn register_url(&self, rel: &Path, url: &str, tags: &EntryTags) -> Result<()> {
        // Stand in for the annex pointer: a stub file holding the URL.
        self.atomic_write(rel, url.as_bytes()).await?;
        self.inner
            .lock()
            .unwrap()
            .registered
            .insert(rel.to_path_buf(), (url.to_owned(), tags.pairs()));
        Ok(())
    }

    async fn tag_entry(&self, rel: &Path, tags: &EntryTags) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .registered
            .entry(rel.to_path_buf())
            .or_insert_with(|| (String::new(), Vec::new()));
        entry.1 = tags.pairs();
        Ok(())
    }

    async fn materialize(&self, _rel: &Path) -> Result<()> {
        Ok(())
    }

    async fn move_entry(&self, old_rel: &Path, new_rel: &Path) -> Result<()> {
        let new_abs = self.root.join(new_rel);
        if let Some(parent) = new_abs.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(self.root.join(old_rel), new_abs)
            .with_context(|| format!("moving {} to {}", old_rel.display(), new_rel.display()))?;
        Ok(())
    }

    async fn symlink(&self, rel: &Path, target: &Path) -> Result<()> {
        let abs = self.root.join(rel);
        if let Some(parent) = abs.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if std::fs::symlink_metadata(&abs).is_ok() {
            std::fs::remove_file(&abs)?;
        }
        std::os::unix::fs::symlink(target, &abs)?;
        Ok(())
    }

    async fn remove(&self, rel: &Path) -> Result<()> {
        match std::fs::remove_file(self.root.join(rel)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn commit(&self, message: &str) -> Result<bool> {
        let current = self.snapshot()?;
        let mut inner = self.inner.lock().unwrap();

        // Roll back files whose only difference from the committed state is
        // a timestamp rewrite.
        let mut effective = current;
        for (rel, content) in &mut effective {
            if let Some(old) = inner.committed.get(rel) {
                if old != content && content_signature(old) == content_signature(content) {
                    std::fs::write(self.root.join(rel), old)?;
                    content.clone_from(old);
                }
            }
        }

        if effective == inner.committed {
            return Ok(false);
        }
        inner.committed = effective;
        inner.commits.push(message.to_owned());
        Ok(true)
    }

    async fn uncommitted_changes(&self) -> Result<bool> {
        let current = self.snapshot()?;
        Ok(current != self.inner.lock().unwrap().committed)
    }

    async fn configure_remote(&self, remote: &IndirectRemote) -> Result<()> {
        self.inner.lock().unwrap().remotes.push(remote.name.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileKind;
    use chrono::Utc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn commit_skips_timestamp_only_rewrites_and_restores_bytes() {
        let dir = tempdir().unwrap();
        let store = PlainStore::new(dir.path());
        let rel = Path::new("videos/a/metadata.json");

        let v1 = b"{\n  \"title\": \"x\",\n  \"last_updated\": \"2024-01-01T00:00:00Z\"\n}\n";
        store.atomic_write(rel, v1).await.unwrap();
        assert!(store.commit("first").await.unwrap());

        let v2 = b"{\n  \"title\": \"x\",\n  \"last_updated\": \"2024-06-01T00:00:00Z\"\n}\n";
        store.atomic_write(rel, v2).await.unwrap();
        assert!(!store.commit("second").await.unwrap());
        // The tree converged back to the committed bytes.
        assert_eq!(std::fs::read(dir.path().join(rel)).unwrap(), v1);
        assert!(!store.uncommitted_changes().await.unwrap());

        let v3 = b"{\n  \"title\": \"y\",\n  \"last_updated\": \"2024-06-01T00:00:00Z\"\n}\n";
        store.atomic_write(rel, v3).await.unwrap();
        assert!(store.commit("third").await.unwrap());
        assert_eq!(store.commit_messages(), ["first", "third"]);
    }

    #[tokio::test]
    async fn register_url_records_tags() {
        let dir = tempdir().unwrap();
        let store = PlainStore::new(dir.path());
        let rel = Path::new("videos/a/video.mp4");
        let tags = EntryTags {
            video_id: "V1".into(),
            channel: "Chan".into(),
            published: Utc::now(),
            filetype: FileKind::Video,
        };
        store
            .register_url(rel, "https://example.test/watch?v=V1", &tags)
            .await
            .unwrap();
        assert_eq!(
            store.registered_urls()[Path::new("videos/a/video.mp4")],
            "https://example.test/watch?v=V1"
        );
        let recorded = store.tags_for(rel).unwrap();
        assert!(recorded.contains(&("filetype".to_owned(), "video".to_owned())));
    }
}
