use std::future::Future;
use std::pin::Pin;

use crate::error::LlmError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Boxed future returned by [`Embedder::embed`].
pub type EmbedFuture<'a> = BoxFuture<'a, Result<Vec<f32>, LlmError>>;

/// Turns text into a dense vector.
///
/// Vectors never take part in chunk identity, so an implementation can be swapped
/// without invalidating anything but the vector index itself.
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;

    fn embed<'a>(&'a self, text: &'a str) -> EmbedFuture<'a>;

    /// Embed several texts, preserving input order.
    ///
    /// The default issues one [`Embedder::embed`] call per text.
    fn embed_batch<'a>(
        &'a self,
        texts: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<Vec<f32>>, LlmError>> {
        Box::pin(async move {
            let mut vectors = Vec::with_capacity(texts.len());
            for text in texts {
                vectors.push(self.embed(text).await?);
            }
            Ok(vectors)
        })
    }
}

/// Scores candidate passages against a query.
///
/// The returned scores have the same length and order as `documents`.
pub trait Reranker: Send + Sync {
    fn name(&self) -> &str;

    fn rerank<'a>(
        &'a self,
        query: &'a str,
        documents: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<f32>, LlmError>>;
}
