//! Embedding and reranking clients for the sift code index.

pub mod compatible;
pub mod error;
pub mod http;
#[cfg(feature = "mock")]
pub mod mock;
pub mod provider;
pub mod rerank;
pub(crate) mod retry;

pub use compatible::CompatibleEmbedder;
pub use error::LlmError;
pub use provider::{Embedder, Reranker};
pub use rerank::HttpReranker;
