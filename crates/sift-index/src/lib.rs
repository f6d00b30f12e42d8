//! Incremental code indexing, hybrid retrieval and call graphs.
//!
//! A [`CodeIndex`] owns the metadata store, the vector index and the model clients. For a
//! repository snapshot it chunks files (tree-sitter for Python, line windows otherwise),
//! embeds and upserts only what changed, maintains an in-memory BM25 index, and answers
//! lexical, semantic and hybrid queries plus symbol and call-graph lookups.

pub mod callgraph;
pub mod chunker;
pub(crate) mod context;
pub mod error;
pub mod git;
pub mod indexer;
pub mod languages;
pub mod lexical;
pub mod progress;
pub(crate) mod python;
pub(crate) mod retry;
pub mod search;
pub mod service;
pub mod source;

pub use callgraph::{CallGraph, Direction, GraphNode, Subgraph};
pub use chunker::{Chunked, ChunkerConfig};
pub use error::{IndexError, InputError, Result, Upstream};
pub use indexer::{IndexerConfig, RefreshReport};
pub use lexical::{DocMeta, LexicalIndex, tokenize};
pub use progress::{RefreshProgress, RefreshStage};
pub use search::{SearchConfig, SearchFilters, SearchHit, SearchMode, SearchRequest};
pub use service::{
    CodeIndex, FetchedSource, IndexConfig, IndexStatus, ReferenceQuery, Repository, SymbolQuery,
};
pub use source::{CommitTree, SourceTree, WorkingTree};
