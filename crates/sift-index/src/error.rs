//! Error types for sift-index.

use std::fmt;
use std::num::TryFromIntError;

/// Requests rejected before any work is performed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InputError {
    /// Repository root is missing or not a directory.
    #[error("repository root {0} is not a readable directory")]
    BadRepository(String),

    /// Path is absolute or escapes the repository root.
    #[error("path {0} must be relative to the repository root")]
    BadPath(String),

    /// Snapshot that was never indexed for this repository.
    #[error("snapshot {0} has not been indexed")]
    UnknownSnapshot(String),

    /// Git could not resolve the revision.
    #[error("unknown revision {0}")]
    UnknownRevision(String),

    #[error("unknown symbol {0}")]
    UnknownSymbol(String),

    #[error("invalid search mode {0}, expected lexical, semantic or hybrid")]
    InvalidMode(String),

    #[error("invalid direction {0}, expected out, in or both")]
    InvalidDirection(String),

    #[error("alpha must be within [0, 1], got {0}")]
    InvalidAlpha(f32),

    #[error("top_k must be at least 1")]
    ZeroTopK,

    #[error("query must not be empty")]
    EmptyQuery,

    #[error("line range {start}-{end} is invalid")]
    InvalidRange { start: u32, end: u32 },
}

/// External dependency that failed or timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upstream {
    Embedder,
    VectorIndex,
    MetadataStore,
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Embedder => "embedder",
            Self::VectorIndex => "vector index",
            Self::MetadataStore => "metadata store",
        })
    }
}

/// Errors that can occur during indexing and querying.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("invalid input: {0}")]
    Input(#[from] InputError),

    /// A search-time dependency without fallback is unreachable.
    #[error("{service} unavailable: {reason}")]
    Upstream { service: Upstream, reason: String },

    /// Reranking was requested but could not be performed.
    #[error("reranker unavailable: {0}")]
    RerankerUnavailable(String),

    /// The file set could not be enumerated; the refresh did nothing.
    #[error("cannot enumerate files: {0}")]
    Enumeration(String),

    /// Git invocation failed.
    #[error("git error: {0}")]
    Git(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata store error: {0}")]
    Store(#[from] sift_store::StoreError),

    #[error("vector store error: {0}")]
    VectorStore(#[from] sift_store::VectorStoreError),

    #[error("LLM error: {0}")]
    Llm(#[from] sift_llm::LlmError),

    #[error("integer conversion failed: {0}")]
    IntConversion(#[from] TryFromIntError),

    /// Generic catch-all error.
    #[error("{0}")]
    Other(String),
}

impl IndexError {
    pub(crate) fn upstream(service: Upstream, reason: impl fmt::Display) -> Self {
        Self::Upstream {
            service,
            reason: reason.to_string(),
        }
    }

    /// Whether the caller sent a bad request.
    #[must_use]
    pub fn is_input(&self) -> bool {
        matches!(self, Self::Input(_))
    }
}

/// Result type alias using `IndexError`.
pub type Result<T> = std::result::Result<T, IndexError>;
