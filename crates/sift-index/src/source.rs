//! Where a snapshot's files come from: the working tree on disk or a git commit.

use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;

use crate::error::{IndexError, InputError, Result};
use crate::git::GitRepo;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Project-specific ignore file, honoured next to `.gitignore` and `.ignore`.
pub const IGNORE_FILE: &str = ".siftignore";

/// Bytes inspected when sniffing for binary content.
const SNIFF_BYTES: usize = 8192;

const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "ico", "webp", "svgz", "pdf", "zip", "gz", "tgz", "bz2",
    "xz", "7z", "rar", "tar", "jar", "war", "class", "so", "dylib", "dll", "exe", "o", "a", "lib",
    "bin", "wasm", "pyc", "pyo", "whl", "egg", "mp3", "mp4", "wav", "ogg", "flac", "mov", "avi",
    "ttf", "otf", "woff", "woff2", "eot", "sqlite", "db", "npy", "npz", "pkl", "parquet",
];

/// A snapshot's file set.
pub trait SourceTree: Send + Sync {
    /// Relative `/`-separated paths of every indexable file, sorted.
    ///
    /// An error here is fatal for the refresh that asked.
    fn list_files(&self) -> BoxFuture<'_, Result<Vec<String>>>;

    /// File content, or `None` if the file no longer exists.
    fn read_file<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>>;
}

#[must_use]
pub fn has_binary_extension(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| BINARY_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

/// A NUL byte near the start marks content as binary.
#[must_use]
pub fn looks_binary(content: &[u8]) -> bool {
    content[..content.len().min(SNIFF_BYTES)].contains(&0)
}

/// Validate a caller-supplied path: relative, no `..`, normalized to `/` separators.
///
/// # Errors
///
/// Returns [`InputError::BadPath`] for empty, absolute or escaping paths.
pub fn normalize_relative_path(raw: &str) -> std::result::Result<String, InputError> {
    let bad = || InputError::BadPath(raw.to_owned());
    let mut parts = Vec::new();
    for component in Path::new(raw).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().ok_or_else(bad)?),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return Err(bad()),
        }
    }
    if parts.is_empty() {
        return Err(bad());
    }
    Ok(parts.join("/"))
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Option<Vec<&str>> = rel
        .components()
        .map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect();
    parts.map(|p| p.join("/"))
}

/// Files on disk under a repository root.
#[derive(Debug, Clone)]
pub struct WorkingTree {
    root: PathBuf,
    max_file_bytes: u64,
}

impl WorkingTree {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, max_file_bytes: u64) -> Self {
        Self {
            root: root.into(),
            max_file_bytes,
        }
    }

    fn walk(root: &Path, max_file_bytes: u64) -> Result<Vec<String>> {
        std::fs::read_dir(root)
            .map_err(|e| IndexError::Enumeration(format!("{}: {e}", root.display())))?;

        let mut files = Vec::new();
        let walker = ignore::WalkBuilder::new(root)
            .hidden(true)
            .git_ignore(true)
            .require_git(false)
            .add_custom_ignore_filename(IGNORE_FILE)
            .build();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                continue;
            }
            let Some(rel) = relative_path(root, entry.path()) else {
                continue;
            };
            if has_binary_extension(&rel) {
                continue;
            }
            match entry.metadata() {
                Ok(meta) if meta.len() > max_file_bytes => {
                    tracing::debug!(path = %rel, size = meta.len(), "skipping large file");
                }
                Ok(_) => files.push(rel),
                Err(e) => tracing::warn!(path = %rel, error = %e, "cannot stat file"),
            }
        }
        files.sort();
        Ok(files)
    }
}

impl SourceTree for WorkingTree {
    fn list_files(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move {
            let root = self.root.clone();
            let max = self.max_file_bytes;
            tokio::task::spawn_blocking(move || Self::walk(&root, max))
                .await
                .map_err(|e| IndexError::Enumeration(format!("walker task failed: {e}")))?
        })
    }

    fn read_file<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        Box::pin(async move {
            let full = self.root.join(path);
            match tokio::fs::symlink_metadata(&full).await {
                Ok(meta) if meta.file_type().is_file() => {}
                Ok(_) => return Ok(None),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            }
            match tokio::fs::read(&full).await {
                Ok(bytes) => Ok(Some(bytes)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }
}

/// Files as recorded in one git commit.
#[derive(Debug, Clone)]
pub struct CommitTree {
    git: GitRepo,
    commit: String,
    max_file_bytes: u64,
}

impl CommitTree {
    #[must_use]
    pub fn new(git: GitRepo, commit: impl Into<String>, max_file_bytes: u64) -> Self {
        Self {
            git,
            commit: commit.into(),
            max_file_bytes,
        }
    }
}

impl SourceTree for CommitTree {
    fn list_files(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move {
            let entries = self
                .git
                .tracked_files(&self.commit)
                .await
                .map_err(|e| IndexError::Enumeration(e.to_string()))?;
            Ok(entries
                .into_iter()
                .filter(|e| e.size <= self.max_file_bytes && !has_binary_extension(&e.path))
                .map(|e| e.path)
                .collect())
        })
    }

    fn read_file<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        Box::pin(async move { self.git.read_blob(&self.commit, path).await })
    }
}
