//! The git + git-annex backed store.
//!
//! Both tools are driven as subprocesses. Every helper funnels through
//! [`GitAnnexStore::run`], which captures stderr and turns non-zero exits
//! into errors, so a failed invocation never leaves a half-interpreted
//! result behind.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tracing::{debug, info, instrument};

use crate::config::IndirectRemote;
use crate::store::{ArchiveStore, EntryTags, TrackingRules, is_timestamp_only_line};

#[derive(Debug, Clone)]
pub struct GitAnnexStore {
    root: PathBuf,
}

impl GitAnnexStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Checks that git and git-annex are installed and in PATH.
    pub async fn ensure_tools() -> Result<()> {
        for (program, args) in [("git", ["--version"]), ("git-annex", ["version"])] {
            let status = tokio::process::Command::new(program)
                .args(args)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            match status {
                Ok(s) if s.success() => {}
                _ => bail!("`{program}` is not installed or not in PATH"),
            }
        }
        Ok(())
    }

    /// Initializes the repository, the annex layer, and the tracking rules.
    /// Idempotent: re-running on an existing archive is a no-op.
    #[instrument(skip(self, rules))]
    pub async fn init_archive(&self, rules: &TrackingRules) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating {}", self.root.display()))?;

        if !self.root.join(".git").exists() {
            self.run("git", &["init", "--quiet"]).await?;
        }
        self.run("git", &["annex", "init", "tubevault"]).await?;

        let attributes = rules.render();
        self.atomic_write(Path::new(".gitattributes"), attributes.as_bytes())
            .await?;
        info!("initialized archive at {}", self.root.display());
        Ok(())
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        debug!(?args, "running {program}");
        let out = tokio::process::Command::new(program)
            .current_dir(&self.root)
            .args(args)
            .output()
            .await
            .with_context(|| format!("spawning {program} {}", args.join(" ")))?;
        if !out.status.success() {
            bail!(
                "{program} {} failed ({}): {}",
                args.join(" "),
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        self.run("git", args).await
    }

    /// Paths staged for commit.
    async fn staged_files(&self) -> Result<Vec<String>> {
        let out = self.git(&["diff", "--cached", "--name-only"]).await?;
        Ok(out.lines().map(str::to_owned).collect())
    }

    /// Whether the staged diff of `file` only rewrites timestamp fields.
    /// New files always count as content.
    async fn staged_diff_is_timestamp_only(&self, file: &str) -> Result<bool> {
        let diff = self
            .git(&["diff", "--cached", "-U0", "--", file])
            .await?;
        let mut saw_change = false;
        for line in diff.lines() {
            if line.starts_with("+++")
                || line.starts_with("---")
                || line.starts_with("@@")
                || line.starts_with("diff ")
                || line.starts_with("index ")
                || line.starts_with("new file")
                || line.starts_with("deleted file")
                || line.starts_with("similarity")
                || line.starts_with("rename")
                || line.starts_with("Binary files")
            {
                if line.starts_with("new file") || line.starts_with("deleted file") {
                    return Ok(false);
                }
                continue;
            }
            if let Some(content) = line.strip_prefix('+').or_else(|| line.strip_prefix('-')) {
                saw_change = true;
                if !is_timestamp_only_line(content) {
                    return Ok(false);
                }
            }
        }
        Ok(saw_change)
    }
}

#[async_trait]
impl ArchiveStore for GitAnnexStore {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn atomic_write(&self, rel: &Path, bytes: &[u8]) -> Result<()> {
        let abs = self.root.join(rel);
        if let Some(parent) = abs.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        // Annexed entries appear as read-only symlinks: unlink first, and
        // put the link back if the replacement write fails.
        let old_link = match tokio::fs::symlink_metadata(&abs).await {
            Ok(meta) if meta.file_type().is_symlink() => {
                let target = tokio::fs::read_link(&abs).await?;
                tokio::fs::remove_file(&abs).await?;
                Some(target)
            }
            _ => None,
        };

        match write_via_temp(&abs, bytes).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if let Some(target) = old_link {
                    let _ = tokio::fs::symlink(&target, &abs).await;
                }
                Err(err).with_context(|| format!("writing {}", rel.display()))
            }
        }
    }

    #[instrument(skip(self, tags))]
    async fn register_url(&self, rel: &Path, url: &str, tags: &EntryTags) -> Result<()> {
        let abs = self.root.join(rel);
        if let Some(parent) = abs.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let rel_str = rel.to_str().context("non-UTF-8 path")?;
        self.git(&["annex", "addurl", "--relaxed", "--file", rel_str, url])
            .await?;
        self.tag_entry(rel, tags).await
    }

    async fn tag_entry(&self, rel: &Path, tags: &EntryTags) -> Result<()> {
        let rel_str = rel.to_str().context("non-UTF-8 path")?;
        // Metadata only attaches to annexed entries; make sure the file is
        // one before tagging (a no-op for already-annexed paths).
        self.git(&["annex", "add", "--", rel_str]).await?;
        let mut args: Vec<String> = vec!["annex".into(), "metadata".into()];
        for (field, value) in tags.pairs() {
            args.push("-s".into());
            args.push(format!("{field}={value}"));
        }
        args.push(rel_str.to_owned());
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.git(&arg_refs).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn materialize(&self, rel: &Path) -> Result<()> {
        let rel_str = rel.to_str().context("non-UTF-8 path")?;
        self.git(&["annex", "get", rel_str]).await?;
        Ok(())
    }

    async fn move_entry(&self, old_rel: &Path, new_rel: &Path) -> Result<()> {
        let new_abs = self.root.join(new_rel);
        if let Some(parent) = new_abs.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let old = old_rel.to_str().context("non-UTF-8 path")?;
        let new = new_rel.to_str().context("non-UTF-8 path")?;
        self.git(&["mv", old, new]).await?;
        Ok(())
    }

    async fn symlink(&self, rel: &Path, target: &Path) -> Result<()> {
        let abs = self.root.join(rel);
        if let Some(parent) = abs.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::symlink_metadata(&abs).await {
            Ok(_) => tokio::fs::remove_file(&abs).await?,
            Err(_) => {}
        }
        tokio::fs::symlink(target, &abs)
            .await
            .with_context(|| format!("linking {} -> {}", rel.display(), target.display()))
    }

    async fn remove(&self, rel: &Path) -> Result<()> {
        let abs = self.root.join(rel);
        match tokio::fs::remove_file(&abs).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("removing {}", rel.display())),
        }
    }

    #[instrument(skip(self))]
    async fn commit(&self, message: &str) -> Result<bool> {
        self.git(&["add", "-A"]).await?;

        let staged = self.staged_files().await?;
        if staged.is_empty() {
            debug!("nothing staged, skipping commit");
            return Ok(false);
        }

        // Roll back files whose only change is a timestamp rewrite, so
        // re-runs with unchanged upstream converge to a byte-equal tree.
        let mut reverted = BTreeSet::new();
        for file in &staged {
            if self.staged_diff_is_timestamp_only(file).await? {
                self.git(&["checkout", "HEAD", "--", file]).await?;
                reverted.insert(file.clone());
            }
        }
        if reverted.len() == staged.len() {
            debug!("all staged changes were timestamp-only, skipping commit");
            return Ok(false);
        }

        self.git(&["commit", "--quiet", "-m", message]).await?;
        info!("committed: {message}");
        Ok(true)
    }

    async fn uncommitted_changes(&self) -> Result<bool> {
        let out = self.git(&["status", "--porcelain"]).await?;
        Ok(!out.trim().is_empty())
    }

    #[instrument(skip(self, remote))]
    async fn configure_remote(&self, remote: &IndirectRemote) -> Result<()> {
        let mut args: Vec<String> = vec![
            "annex".into(),
            "initremote".into(),
            remote.name.clone(),
            format!("type={}", remote.kind),
        ];
        for (key, value) in &remote.params {
            args.push(format!("{key}={value}"));
        }
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        match self.git(&arg_refs).await {
            Ok(_) => Ok(()),
            // An existing remote of the same name is re-enabled, not an error.
            Err(err) if err.to_string().contains("already") => {
                self.git(&["annex", "enableremote", &remote.name]).await?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

async fn write_via_temp(abs: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = abs
        .file_name()
        .and_then(|n| n.to_str())
        .context("path has no file name")?;
    let tmp = abs.with_file_name(format!(".{file_name}.tmp"));

    let mut file = tokio::fs::File::create(&tmp).await?;
    tokio::io::AsyncWriteExt::write_all(&mut file, bytes).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, abs).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn atomic_write_replaces_regular_files() {
        let dir = tempdir().unwrap();
        let store = GitAnnexStore::new(dir.path());
        let rel = Path::new("videos/a/metadata.json");
        store.atomic_write(rel, b"{\"a\":1}").await.unwrap();
        store.atomic_write(rel, b"{\"a\":2}").await.unwrap();
        let content = std::fs::read(dir.path().join(rel)).unwrap();
        assert_eq!(content, b"{\"a\":2}");
        // No temp file left behind.
        let siblings: Vec<_> = std::fs::read_dir(dir.path().join("videos/a"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(siblings.len(), 1);
    }

    #[tokio::test]
    async fn atomic_write_unlinks_symlinks_first() {
        let dir = tempdir().unwrap();
        let store = GitAnnexStore::new(dir.path());
        let rel = Path::new("videos/a/thumbnail.jpg");
        std::fs::create_dir_all(dir.path().join("videos/a")).unwrap();
        std::os::unix::fs::symlink("dangling-target", dir.path().join(rel)).unwrap();

        store.atomic_write(rel, b"jpegbytes").await.unwrap();
        let meta = std::fs::symlink_metadata(dir.path().join(rel)).unwrap();
        assert!(meta.file_type().is_file());
        assert_eq!(std::fs::read(dir.path().join(rel)).unwrap(), b"jpegbytes");
    }
}
