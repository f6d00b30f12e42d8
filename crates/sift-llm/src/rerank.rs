use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::provider::{BoxFuture, Reranker};
use crate::retry::send_with_retry;

const PROVIDER: &str = "reranker";

/// Cross-encoder reranker behind a `/rerank` endpoint.
///
/// Accepts the Cohere/Jina response shape (`{"results": [...]}`) and the bare array
/// returned by text-embeddings-inference.
#[derive(Clone)]
pub struct HttpReranker {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    max_retries: u32,
}

impl fmt::Debug for HttpReranker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpReranker")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

impl HttpReranker {
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: String, model: String) -> Self {
        Self {
            client,
            base_url: crate::http::trim_base_url(base_url),
            model,
            api_key: None,
            max_retries: 1,
        }
    }

    #[must_use]
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|k| !k.is_empty());
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    async fn request(&self, query: &str, documents: &[String]) -> Result<Vec<f32>, LlmError> {
        let url = format!("{}/rerank", self.base_url);
        let body = RerankRequest {
            model: &self.model,
            query,
            documents,
            top_n: documents.len(),
        };

        let response = send_with_retry(PROVIDER, self.max_retries, || {
            let mut req = self.client.post(&url).json(&body);
            if let Some(key) = &self.api_key {
                req = req.bearer_auth(key);
            }
            req.send()
        })
        .await
        .map_err(|e| match e {
            LlmError::Http(err) => LlmError::Unavailable {
                provider: PROVIDER,
                reason: err.to_string(),
            },
            other => other,
        })?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            tracing::error!(%status, body = %text, "rerank request failed");
            return Err(LlmError::Unavailable {
                provider: PROVIDER,
                reason: format!("status {status}"),
            });
        }

        let parsed: RerankResponse = serde_json::from_str(&text)?;
        scores_in_input_order(parsed.into_results(), documents.len())
    }
}

impl Reranker for HttpReranker {
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "http-reranker"
    }

    fn rerank<'a>(
        &'a self,
        query: &'a str,
        documents: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<f32>, LlmError>> {
        Box::pin(async move {
            if documents.is_empty() {
                return Ok(Vec::new());
            }
            self.request(query, documents).await
        })
    }
}

/// Map `(index, score)` results back onto the input order.
fn scores_in_input_order(results: Vec<RerankResult>, expected: usize) -> Result<Vec<f32>, LlmError> {
    let got = results.len();
    let mut scores = vec![None; expected];
    for r in results {
        match scores.get_mut(r.index) {
            Some(slot) => *slot = Some(r.relevance_score),
            None => {
                return Err(LlmError::LengthMismatch {
                    provider: PROVIDER,
                    expected,
                    got,
                });
            }
        }
    }
    scores
        .into_iter()
        .collect::<Option<Vec<f32>>>()
        .ok_or(LlmError::LengthMismatch {
            provider: PROVIDER,
            expected,
            got,
        })
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [String],
    top_n: usize,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RerankResponse {
    Wrapped { results: Vec<RerankResult> },
    Bare(Vec<RerankResult>),
}

impl RerankResponse {
    fn into_results(self) -> Vec<RerankResult> {
        match self {
            Self::Wrapped { results } | Self::Bare(results) => results,
        }
    }
}

#[derive(Deserialize)]
struct RerankResult {
    index: usize,
    #[serde(alias = "score")]
    relevance_score: f32,
}
