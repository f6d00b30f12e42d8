//! Domain model shared by the indexer, the search engine and the stores.
//!
//! Every indexed artifact lives in a partition addressed by [`PartitionKey`]. Chunk and
//! symbol identifiers are UUID v5 values derived from their partition, location and
//! content, so re-indexing identical content yields identical identifiers.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

pub const WORKING_TREE: &str = "working_tree";

/// Repository identifier: blake3 hex digest of the canonical root path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoId(String);

impl RepoId {
    #[must_use]
    pub fn from_root(root: &Path) -> Self {
        Self(
            blake3::hash(root.to_string_lossy().as_bytes())
                .to_hex()
                .to_string(),
        )
    }

    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logical repository version: the working tree or one commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Snapshot {
    WorkingTree,
    Commit(String),
}

impl Snapshot {
    /// Parse user input. Empty text and the usual spellings of "working tree" map to
    /// [`Snapshot::WorkingTree`]; anything else is taken as a commit reference.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "" | WORKING_TREE | "working-tree" | "worktree" => Self::WorkingTree,
            other => Self::Commit(other.to_owned()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::WorkingTree => WORKING_TREE,
            Self::Commit(sha) => sha,
        }
    }

    #[must_use]
    pub fn is_working_tree(&self) -> bool {
        matches!(self, Self::WorkingTree)
    }
}

impl From<String> for Snapshot {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<Snapshot> for String {
    fn from(snapshot: Snapshot) -> Self {
        snapshot.as_str().to_owned()
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of one (repository, snapshot) partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PartitionKey {
    pub repo: RepoId,
    pub snapshot: Snapshot,
}

impl PartitionKey {
    #[must_use]
    pub fn new(repo: RepoId, snapshot: Snapshot) -> Self {
        Self { repo, snapshot }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.repo, self.snapshot)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(String);

impl ChunkId {
    #[must_use]
    pub fn derive(
        key: &PartitionKey,
        path: &str,
        start_line: u32,
        end_line: u32,
        content_hash: &str,
    ) -> Self {
        let name = format!(
            "{}:{}:{path}:{start_line}:{end_line}:{content_hash}",
            key.repo, key.snapshot
        );
        Self(Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()).to_string())
    }

    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SymbolId(String);

impl SymbolId {
    #[must_use]
    pub fn derive(
        key: &PartitionKey,
        path: &str,
        qualname: &str,
        kind: SymbolKind,
        start_line: u32,
        end_line: u32,
    ) -> Self {
        let name = format!(
            "{}|{}|{path}|{qualname}|{}|{start_line}|{end_line}",
            key.repo,
            key.snapshot,
            kind.as_str()
        );
        Self(Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()).to_string())
    }

    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SymbolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    ModuleWindow,
    Function,
    Class,
    LineWindow,
}

impl ChunkKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ModuleWindow => "module_window",
            Self::Function => "function",
            Self::Class => "class",
            Self::LineWindow => "line_window",
        }
    }
}

impl FromStr for ChunkKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "module_window" => Ok(Self::ModuleWindow),
            "function" => Ok(Self::Function),
            "class" => Ok(Self::Class),
            "line_window" => Ok(Self::LineWindow),
            other => Err(StoreError::Corrupt(format!("unknown chunk kind {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    Function,
    Method,
    Class,
}

impl SymbolKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Method => "method",
            Self::Class => "class",
        }
    }
}

impl FromStr for SymbolKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "function" => Ok(Self::Function),
            "method" => Ok(Self::Method),
            "class" => Ok(Self::Class),
            other => Err(StoreError::Corrupt(format!("unknown symbol kind {other}"))),
        }
    }
}

/// Unit of retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub file_path: String,
    pub language: String,
    pub kind: ChunkKind,
    /// 1-indexed, inclusive.
    pub start_line: u32,
    pub end_line: u32,
    pub text: String,
    pub content_hash: String,
    /// Name of the definition this chunk belongs to, if any.
    pub symbol_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Symbol {
    pub id: SymbolId,
    pub name: String,
    /// Dotted path through enclosing definitions, e.g. `Session.login`.
    pub qualname: String,
    pub kind: SymbolKind,
    pub file_path: String,
    pub language: String,
    pub start_line: u32,
    pub end_line: u32,
    pub parent: Option<SymbolId>,
    pub chunk_id: ChunkId,
}

/// Target of a call edge. Static resolution is best-effort, so a name-only target is
/// a normal outcome.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Callee {
    Resolved { symbol_id: SymbolId },
    Unresolved { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallEdge {
    pub caller: SymbolId,
    /// Callee text as written at the call site, e.g. `self.auth.login`.
    pub callee_name: String,
    pub callee: Callee,
    pub chunk_id: ChunkId,
    pub file_path: String,
    pub line: u32,
}

impl CallEdge {
    /// Last dotted segment of the callee text, used as the resolution key.
    #[must_use]
    pub fn callee_base(&self) -> &str {
        callee_base(&self.callee_name)
    }
}

#[must_use]
pub fn callee_base(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

/// A read of a name anywhere in a file: a call, an argument, a base class, a decorator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NameRef {
    pub name: String,
    pub file_path: String,
    /// 1-indexed.
    pub line: u32,
    /// 0-indexed byte offset within the line.
    pub column: u32,
    /// The surrounding part of the source line.
    pub context: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Indexed,
    /// Some chunks failed to embed or upsert; retried on the next refresh.
    Partial,
}

impl FileStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Indexed => "indexed",
            Self::Partial => "partial",
        }
    }
}

impl FromStr for FileStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "indexed" => Ok(Self::Indexed),
            "partial" => Ok(Self::Partial),
            other => Err(StoreError::Corrupt(format!("unknown file status {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    pub path: String,
    pub content_hash: String,
    pub size: u64,
    pub language: String,
    pub status: FileStatus,
    pub indexed_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(snapshot: Snapshot) -> PartitionKey {
        PartitionKey::new(RepoId::from_raw("repo"), snapshot)
    }

    #[test]
    fn snapshot_parse_sentinels() {
        assert_eq!(Snapshot::parse(""), Snapshot::WorkingTree);
        assert_eq!(Snapshot::parse("working_tree"), Snapshot::WorkingTree);
        assert_eq!(Snapshot::parse(" worktree "), Snapshot::WorkingTree);
        assert_eq!(
            Snapshot::parse("abc123"),
            Snapshot::Commit("abc123".into())
        );
    }

    #[test]
    fn snapshot_serde_is_plain_string() {
        let json = serde_json::to_string(&Snapshot::WorkingTree).unwrap();
        assert_eq!(json, "\"working_tree\"");
        let back: Snapshot = serde_json::from_str("\"deadbeef\"").unwrap();
        assert_eq!(back, Snapshot::Commit("deadbeef".into()));
    }

    #[test]
    fn chunk_id_is_deterministic() {
        let k = key(Snapshot::WorkingTree);
        let a = ChunkId::derive(&k, "auth.py", 1, 2, "h");
        let b = ChunkId::derive(&k, "auth.py", 1, 2, "h");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn chunk_id_differs_across_snapshots_and_positions() {
        let wt = key(Snapshot::WorkingTree);
        let commit = key(Snapshot::Commit("abc".into()));
        let base = ChunkId::derive(&wt, "a.py", 1, 2, "h");
        assert_ne!(base, ChunkId::derive(&commit, "a.py", 1, 2, "h"));
        assert_ne!(base, ChunkId::derive(&wt, "a.py", 2, 3, "h"));
        assert_ne!(base, ChunkId::derive(&wt, "a.py", 1, 2, "other"));
        assert_ne!(base, ChunkId::derive(&wt, "b.py", 1, 2, "h"));
    }

    #[test]
    fn symbol_id_includes_kind() {
        let k = key(Snapshot::WorkingTree);
        let f = SymbolId::derive(&k, "a.py", "login", SymbolKind::Function, 1, 2);
        let m = SymbolId::derive(&k, "a.py", "login", SymbolKind::Method, 1, 2);
        assert_ne!(f, m);
    }

    #[test]
    fn repo_id_is_hex_digest() {
        let id = RepoId::from_root(Path::new("/srv/repo"));
        assert_eq!(id.as_str().len(), 64);
        assert_eq!(id, RepoId::from_root(Path::new("/srv/repo")));
        assert_ne!(id, RepoId::from_root(Path::new("/srv/other")));
    }

    #[test]
    fn kinds_round_trip_through_text() {
        for kind in [
            ChunkKind::ModuleWindow,
            ChunkKind::Function,
            ChunkKind::Class,
            ChunkKind::LineWindow,
        ] {
            assert_eq!(kind.as_str().parse::<ChunkKind>().unwrap(), kind);
        }
        assert!("lambda".parse::<SymbolKind>().is_err());
        assert_eq!("partial".parse::<FileStatus>().unwrap(), FileStatus::Partial);
    }

    #[test]
    fn callee_base_takes_last_segment() {
        assert_eq!(callee_base("self.auth.login"), "login");
        assert_eq!(callee_base("login"), "login");
    }

    #[test]
    fn callee_serializes_tagged() {
        let json = serde_json::to_value(Callee::Unresolved {
            name: "print".into(),
        })
        .unwrap();
        assert_eq!(json["kind"], "unresolved");
        assert_eq!(json["name"], "print");
    }
}
