//! Deterministic test doubles for [`Embedder`] and [`Reranker`].

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::LlmError;
use crate::provider::{BoxFuture, EmbedFuture, Embedder, Reranker};

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
}

/// Hashed bag-of-words embedder: texts sharing words land close together.
#[derive(Debug, Clone)]
pub struct MockEmbedder {
    pub dimensions: usize,
    /// Fail any text containing this substring.
    pub fail_on: Option<String>,
    /// Milliseconds to sleep before answering.
    pub delay_ms: u64,
    unavailable: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
    batch_calls: Arc<AtomicUsize>,
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self {
            dimensions: 64,
            fail_on: None,
            delay_ms: 0,
            unavailable: Arc::new(AtomicBool::new(false)),
            calls: Arc::new(AtomicUsize::new(0)),
            batch_calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl MockEmbedder {
    #[must_use]
    pub fn failing_on(marker: impl Into<String>) -> Self {
        Self {
            fail_on: Some(marker.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn unavailable() -> Self {
        let mock = Self::default();
        mock.set_unavailable(true);
        mock
    }

    #[must_use]
    pub fn with_delay(mut self, ms: u64) -> Self {
        self.delay_ms = ms;
        self
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Requests served, single or batched.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Batched requests served.
    #[must_use]
    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    async fn answer(&self, texts: &[&str]) -> Result<(), LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LlmError::Unavailable {
                provider: "mock",
                reason: "switched off".into(),
            });
        }
        if let Some(marker) = &self.fail_on
            && texts.iter().any(|text| text.contains(marker.as_str()))
        {
            return Err(LlmError::Other(format!("mock refuses text with {marker}")));
        }
        Ok(())
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let dims = self.dimensions.max(1);
        let mut vector = vec![0.0f32; dims];
        for word in words(text) {
            let mut hasher = DefaultHasher::new();
            word.hash(&mut hasher);
            vector[(hasher.finish() % dims as u64) as usize] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm == 0.0 {
            vector[0] = 1.0;
        } else {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

impl Embedder for MockEmbedder {
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "mock"
    }

    fn embed<'a>(&'a self, text: &'a str) -> EmbedFuture<'a> {
        Box::pin(async move {
            self.answer(&[text]).await?;
            Ok(self.vector_for(text))
        })
    }

    /// One request for the whole batch; a refused text fails all of it.
    fn embed_batch<'a>(
        &'a self,
        texts: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<Vec<f32>>, LlmError>> {
        Box::pin(async move {
            self.batch_calls.fetch_add(1, Ordering::SeqCst);
            let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
            self.answer(&refs).await?;
            Ok(texts.iter().map(|text| self.vector_for(text)).collect())
        })
    }
}

/// Scores a document by how many query words it contains.
#[derive(Debug, Clone, Default)]
pub struct MockReranker {
    pub unavailable: bool,
    /// Return one score fewer than asked for.
    pub truncate: bool,
}

impl MockReranker {
    #[must_use]
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            truncate: false,
        }
    }
}

impl Reranker for MockReranker {
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "mock"
    }

    #[allow(clippy::cast_precision_loss)]
    fn rerank<'a>(
        &'a self,
        query: &'a str,
        documents: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<f32>, LlmError>> {
        Box::pin(async move {
            if self.unavailable {
                return Err(LlmError::Unavailable {
                    provider: "mock",
                    reason: "switched off".into(),
                });
            }
            let terms: Vec<String> = words(query).collect();
            let mut scores: Vec<f32> = documents
                .iter()
                .map(|doc| {
                    let doc_words: Vec<String> = words(doc).collect();
                    doc_words.iter().filter(|w| terms.contains(w)).count() as f32
                })
                .collect();
            if self.truncate {
                scores.pop();
            }
            Ok(scores)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[tokio::test]
    async fn embeddings_are_deterministic() {
        let mock = MockEmbedder::default();
        let a = mock.embed("def login(): pass").await.unwrap();
        let b = mock.embed("def login(): pass").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(mock.calls(), 2);
    }

    #[tokio::test]
    async fn shared_words_score_higher() {
        let mock = MockEmbedder::default();
        let query = mock.embed("login user").await.unwrap();
        let near = mock.embed("def login(user): pass").await.unwrap();
        let far = mock.embed("class Parser: tokens").await.unwrap();
        assert!(cosine(&query, &near) > cosine(&query, &far));
    }

    #[tokio::test]
    async fn fail_on_marker() {
        let mock = MockEmbedder::failing_on("BROKEN");
        assert!(mock.embed("fine").await.is_ok());
        assert!(mock.embed("this is BROKEN").await.is_err());
    }

    #[tokio::test]
    async fn batch_is_one_request() {
        let mock = MockEmbedder::default();
        let texts = vec!["def login(): pass".to_owned(), "x = 1".to_owned()];
        let vectors = mock.embed_batch(&texts).await.unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[1], mock.vector_for("x = 1"));
        assert_eq!((mock.calls(), mock.batch_calls()), (1, 1));
    }

    #[tokio::test]
    async fn batch_fails_whole_on_marker() {
        let mock = MockEmbedder::failing_on("BROKEN");
        let texts = vec!["fine".to_owned(), "BROKEN".to_owned()];
        assert!(mock.embed_batch(&texts).await.is_err());
    }

    #[tokio::test]
    async fn toggle_unavailable() {
        let mock = MockEmbedder::unavailable();
        assert!(mock.embed("x").await.is_err());
        mock.set_unavailable(false);
        assert!(mock.embed("x").await.is_ok());
    }

    #[tokio::test]
    async fn reranker_counts_query_words() {
        let docs = vec!["login login".to_owned(), "parse".to_owned()];
        let scores = MockReranker::default().rerank("login", &docs).await.unwrap();
        assert_eq!(scores, vec![2.0, 0.0]);
    }

    #[tokio::test]
    async fn reranker_unavailable() {
        let docs = vec!["a".to_owned()];
        assert!(MockReranker::unavailable().rerank("a", &docs).await.is_err());
    }
}
