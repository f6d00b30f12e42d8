//! Metadata and vector storage for the sift code index.

pub mod error;
pub mod in_memory_store;
pub mod qdrant_ops;
pub mod sqlite;
pub mod types;
pub mod vector_store;

pub use error::StoreError;
pub use in_memory_store::InMemoryVectorStore;
pub use qdrant_ops::QdrantOps;
pub use sqlite::SqliteStore;
pub use types::{
    CallEdge, Callee, Chunk, ChunkId, ChunkKind, FileRecord, FileStatus, NameRef, PartitionKey,
    RepoId, Snapshot, Symbol, SymbolId, SymbolKind,
};
pub use vector_store::{
    FieldCondition, FieldValue, ScoredVectorPoint, VectorFilter, VectorPoint, VectorStore,
    VectorStoreError,
};
