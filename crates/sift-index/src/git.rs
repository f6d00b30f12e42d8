//! Thin async wrapper over the `git` command line.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::error::{IndexError, InputError, Result};

/// A tracked blob of a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct GitRepo {
    root: PathBuf,
}

impl GitRepo {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn run(&self, args: &[&str]) -> Result<Vec<u8>> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.root)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| IndexError::Git(format!("cannot run git: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(IndexError::Git(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or_default(),
                stderr.trim()
            )));
        }
        Ok(output.stdout)
    }

    /// Full id of the commit `rev` points to.
    ///
    /// # Errors
    ///
    /// Returns [`InputError::UnknownRevision`] if git cannot resolve `rev`.
    pub async fn resolve_commit(&self, rev: &str) -> Result<String> {
        if rev.is_empty() || rev.starts_with('-') {
            return Err(InputError::UnknownRevision(rev.to_owned()).into());
        }
        let spec = format!("{rev}^{{commit}}");
        let out = self
            .run(&["rev-parse", "--verify", "--quiet", &spec])
            .await
            .map_err(|_| InputError::UnknownRevision(rev.to_owned()))?;
        Ok(String::from_utf8_lossy(&out).trim().to_owned())
    }

    /// Blobs tracked in `commit` with their sizes, sorted by path.
    ///
    /// # Errors
    ///
    /// Returns an error if git fails.
    pub async fn tracked_files(&self, commit: &str) -> Result<Vec<TreeEntry>> {
        let out = self.run(&["ls-tree", "-r", "-z", "--long", commit]).await?;
        let mut entries: Vec<TreeEntry> = out
            .split(|b| *b == 0)
            .filter(|record| !record.is_empty())
            .filter_map(|record| parse_ls_tree_record(&String::from_utf8_lossy(record)))
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    /// Content of `path` as of `commit`, or `None` if it is not in that commit.
    ///
    /// `path` is relative to the root, which may be a subdirectory of the work tree.
    ///
    /// # Errors
    ///
    /// Returns an error if git cannot be started.
    pub async fn read_blob(&self, commit: &str, path: &str) -> Result<Option<Vec<u8>>> {
        let spec = format!("{commit}:./{path}");
        match self.run(&["cat-file", "blob", &spec]).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(IndexError::Git(msg)) if !msg.starts_with("cannot run git") => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Paths under the root that differ between `base` and the working tree, including
    /// untracked files.
    ///
    /// # Errors
    ///
    /// Returns an error if `base` does not resolve or git fails.
    pub async fn changed_files(&self, base: &str) -> Result<Vec<String>> {
        let commit = self.resolve_commit(base).await?;
        let diff = self
            .run(&["diff", "--name-only", "-z", "--no-renames", "--relative", &commit])
            .await?;
        let untracked = self
            .run(&["ls-files", "--others", "--exclude-standard", "-z"])
            .await?;
        let paths: BTreeSet<String> = diff
            .split(|b| *b == 0)
            .chain(untracked.split(|b| *b == 0))
            .filter(|p| !p.is_empty())
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .collect();
        Ok(paths.into_iter().collect())
    }
}

/// `<mode> <type> <object> <size>\t<path>`; only blobs are kept.
fn parse_ls_tree_record(record: &str) -> Option<TreeEntry> {
    let (meta, path) = record.split_once('\t')?;
    let mut fields = meta.split_whitespace();
    let _mode = fields.next()?;
    if fields.next()? != "blob" {
        return None;
    }
    let _object = fields.next()?;
    let size = fields.next()?.parse().ok()?;
    Some(TreeEntry {
        path: path.to_owned(),
        size,
    })
}
