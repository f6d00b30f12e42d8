//! Lexical, semantic and hybrid retrieval with optional reranking.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sift_llm::{Embedder, Reranker};
use sift_store::{
    Chunk, ChunkId, ChunkKind, FieldValue, PartitionKey, SqliteStore, VectorFilter, VectorStore,
};

use crate::context::{chunk_preview, truncate_chars};
use crate::error::{IndexError, InputError, Result, Upstream};
use crate::lexical::{self, Bm25, DocFilter, SharedIndex, tokenize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Lexical,
    Semantic,
    #[default]
    Hybrid,
}

impl FromStr for SearchMode {
    type Err = InputError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lexical" => Ok(Self::Lexical),
            "semantic" => Ok(Self::Semantic),
            "hybrid" => Ok(Self::Hybrid),
            _ => Err(InputError::InvalidMode(s.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchFilters {
    pub path_prefix: Option<String>,
    pub language: Option<String>,
    pub chunk_type: Option<ChunkKind>,
    /// Exact name of the definition a chunk belongs to.
    pub symbol_name: Option<String>,
}

impl SearchFilters {
    fn admits(&self, chunk: &Chunk) -> bool {
        self.path_prefix
            .as_deref()
            .is_none_or(|p| chunk.file_path.starts_with(p))
            && self.language.as_deref().is_none_or(|l| chunk.language == l)
            && self.chunk_type.is_none_or(|k| chunk.kind == k)
            && self
                .symbol_name
                .as_deref()
                .is_none_or(|n| chunk.symbol_name.as_deref() == Some(n))
    }

    fn doc_filter(&self) -> DocFilter<'_> {
        DocFilter {
            path_prefix: self.path_prefix.as_deref(),
            language: self.language.as_deref(),
            kind: self.chunk_type,
            symbol_name: self.symbol_name.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    /// Defaults to the working tree.
    pub snapshot: Option<String>,
    pub top_k: usize,
    pub mode: SearchMode,
    /// Weight of the semantic signal in hybrid mode; `None` uses the configured default.
    pub alpha: Option<f32>,
    pub use_rerank: bool,
    pub filters: SearchFilters,
}

impl SearchRequest {
    #[must_use]
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            snapshot: None,
            top_k: 10,
            mode: SearchMode::Hybrid,
            alpha: None,
            use_rerank: false,
            filters: SearchFilters::default(),
        }
    }

    #[must_use]
    pub fn with_mode(mut self, mode: SearchMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    #[must_use]
    pub fn with_alpha(mut self, alpha: f32) -> Self {
        self.alpha = Some(alpha);
        self
    }

    #[must_use]
    pub fn with_snapshot(mut self, snapshot: impl Into<String>) -> Self {
        self.snapshot = Some(snapshot.into());
        self
    }

    #[must_use]
    pub fn with_rerank(mut self, use_rerank: bool) -> Self {
        self.use_rerank = use_rerank;
        self
    }

    #[must_use]
    pub fn with_filters(mut self, filters: SearchFilters) -> Self {
        self.filters = filters;
        self
    }

    /// Check the request and return the effective alpha.
    ///
    /// # Errors
    ///
    /// Returns an [`InputError`] for an empty query, `top_k == 0` or an alpha outside `[0, 1]`.
    pub fn validate(&self, default_alpha: f32) -> std::result::Result<f32, InputError> {
        if self.query.trim().is_empty() {
            return Err(InputError::EmptyQuery);
        }
        if self.top_k == 0 {
            return Err(InputError::ZeroTopK);
        }
        let alpha = self.alpha.unwrap_or(default_alpha);
        if !alpha.is_finite() || !(0.0..=1.0).contains(&alpha) {
            return Err(InputError::InvalidAlpha(alpha));
        }
        Ok(alpha)
    }
}

/// Retrieval configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub k1: f64,
    pub b: f64,
    /// Candidates fetched per signal, as a multiple of `top_k`.
    pub oversample: usize,
    pub default_alpha: f32,
    pub rerank_candidates: usize,
    pub embed_timeout_secs: u64,
    pub vector_timeout_secs: u64,
    pub rerank_timeout_secs: u64,
    /// Characters of each candidate sent to the reranker.
    pub max_rerank_chars: usize,
    pub max_edges_per_hop: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            k1: 1.2,
            b: 0.75,
            oversample: 3,
            default_alpha: 0.5,
            rerank_candidates: 50,
            embed_timeout_secs: 10,
            vector_timeout_secs: 10,
            rerank_timeout_secs: 30,
            max_rerank_chars: 4000,
            max_edges_per_hop: 50,
        }
    }
}

impl SearchConfig {
    fn bm25(&self) -> Bm25 {
        Bm25 {
            k1: self.k1,
            b: self.b,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub chunk_id: ChunkId,
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub kind: ChunkKind,
    pub language: String,
    pub symbol_name: Option<String>,
    /// Fused score in `[0, 1]`.
    pub score: f64,
    /// Normalized lexical score, if the chunk was a lexical candidate.
    pub lexical: Option<f64>,
    /// Normalized semantic score, if the chunk was a semantic candidate.
    pub semantic: Option<f64>,
    pub rerank: Option<f32>,
    pub preview: String,
}

impl SearchHit {
    fn new(chunk: &Chunk, candidate: &Candidate) -> Self {
        Self {
            chunk_id: chunk.id.clone(),
            file_path: chunk.file_path.clone(),
            start_line: chunk.start_line,
            end_line: chunk.end_line,
            kind: chunk.kind,
            language: chunk.language.clone(),
            symbol_name: chunk.symbol_name.clone(),
            score: candidate.score,
            lexical: candidate.lexical,
            semantic: candidate.semantic,
            rerank: None,
            preview: chunk_preview(chunk),
        }
    }
}

/// A fused candidate before hydration.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Candidate {
    pub id: ChunkId,
    pub score: f64,
    pub lexical: Option<f64>,
    pub semantic: Option<f64>,
}

/// Scale scores to `[0, 1]` over the candidate set. A set whose scores are all equal maps
/// every member to 1.0.
#[must_use]
pub fn min_max_normalize(scores: &HashMap<ChunkId, f64>) -> HashMap<ChunkId, f64> {
    let (lo, hi) = scores
        .values()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), s| {
            (lo.min(*s), hi.max(*s))
        });
    let range = hi - lo;
    scores
        .iter()
        .map(|(id, s)| {
            let norm = if range > f64::EPSILON {
                (s - lo) / range
            } else {
                1.0
            };
            (id.clone(), norm)
        })
        .collect()
}

/// The `n` best entries, ties broken on ascending id.
fn top_n(scores: HashMap<ChunkId, f64>, n: usize) -> HashMap<ChunkId, f64> {
    let mut ranked: Vec<(ChunkId, f64)> = scores.into_iter().collect();
    ranked.sort_by(|a, b| by_score_then_id((&a.0, a.1), (&b.0, b.1)));
    ranked.truncate(n);
    ranked.into_iter().collect()
}

fn by_score_then_id(a: (&ChunkId, f64), b: (&ChunkId, f64)) -> Ordering {
    b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0))
}

/// `alpha * semantic + (1 - alpha) * lexical` over normalized scores, with 0 for a signal a
/// chunk is missing. Sorted descending, ties on ascending id.
pub(crate) fn fuse(
    lexical: &HashMap<ChunkId, f64>,
    semantic: &HashMap<ChunkId, f64>,
    alpha: f64,
) -> Vec<Candidate> {
    let mut ids: Vec<&ChunkId> = lexical.keys().chain(semantic.keys()).collect();
    ids.sort();
    ids.dedup();
    let mut fused: Vec<Candidate> = ids
        .into_iter()
        .map(|id| {
            let lex = lexical.get(id).copied();
            let sem = semantic.get(id).copied();
            Candidate {
                id: id.clone(),
                score: alpha * sem.unwrap_or(0.0) + (1.0 - alpha) * lex.unwrap_or(0.0),
                lexical: lex,
                semantic: sem,
            }
        })
        .collect();
    fused.sort_by(|a, b| by_score_then_id((&a.id, a.score), (&b.id, b.score)));
    fused
}

/// Everything one search needs, borrowed from the coordinator.
pub(crate) struct Searcher<'a> {
    pub store: &'a SqliteStore,
    pub vectors: &'a dyn VectorStore,
    pub embedder: &'a dyn Embedder,
    pub reranker: Option<&'a dyn Reranker>,
    pub collection: &'a str,
    pub config: &'a SearchConfig,
}

impl Searcher<'_> {
    /// Run a validated request against one partition.
    pub(crate) async fn search(
        &self,
        key: &PartitionKey,
        lexical: &SharedIndex,
        request: &SearchRequest,
        alpha: f32,
    ) -> Result<Vec<SearchHit>> {
        let top_k = request.top_k;
        let mut n = top_k.saturating_mul(self.config.oversample).max(top_k);
        if request.use_rerank {
            n = n.max(self.config.rerank_candidates);
        }

        let lexical_scores = match request.mode {
            SearchMode::Semantic => HashMap::new(),
            SearchMode::Lexical | SearchMode::Hybrid => {
                min_max_normalize(&self.lexical_candidates(lexical, request, n))
            }
        };
        let semantic_scores = match request.mode {
            SearchMode::Lexical => HashMap::new(),
            SearchMode::Semantic | SearchMode::Hybrid => {
                min_max_normalize(&self.semantic_candidates(key, request, n).await?)
            }
        };
        let alpha = match request.mode {
            SearchMode::Lexical => 0.0,
            SearchMode::Semantic => 1.0,
            SearchMode::Hybrid => f64::from(alpha),
        };
        let fused = fuse(&lexical_scores, &semantic_scores, alpha);
        tracing::debug!(
            partition = %key,
            mode = ?request.mode,
            lexical = lexical_scores.len(),
            semantic = semantic_scores.len(),
            fused = fused.len(),
            "candidates fused"
        );

        let mut hits = self.hydrate(key, &fused, &request.filters).await?;
        if request.use_rerank {
            hits.truncate(self.config.rerank_candidates.max(top_k));
            self.rerank(&request.query, &mut hits).await?;
        }
        hits.truncate(top_k);
        Ok(hits.into_iter().map(|(hit, _)| hit).collect())
    }

    fn lexical_candidates(
        &self,
        index: &SharedIndex,
        request: &SearchRequest,
        n: usize,
    ) -> HashMap<ChunkId, f64> {
        let terms = tokenize(&request.query);
        let filter = request.filters.doc_filter();
        let scores = lexical::read(index).score(&terms, self.config.bm25(), &filter);
        top_n(scores, n)
    }

    async fn semantic_candidates(
        &self,
        key: &PartitionKey,
        request: &SearchRequest,
        n: usize,
    ) -> Result<HashMap<ChunkId, f64>> {
        let vector = tokio::time::timeout(
            Duration::from_secs(self.config.embed_timeout_secs),
            self.embedder.embed(&request.query),
        )
        .await
        .map_err(|_| IndexError::upstream(Upstream::Embedder, "query embedding timed out"))?
        .map_err(|e| IndexError::upstream(Upstream::Embedder, e))?;

        let vector_timeout = Duration::from_secs(self.config.vector_timeout_secs);
        let exists = tokio::time::timeout(
            vector_timeout,
            self.vectors.collection_exists(self.collection),
        )
        .await
        .map_err(|_| IndexError::upstream(Upstream::VectorIndex, "timed out"))?
        .map_err(|e| IndexError::upstream(Upstream::VectorIndex, e))?;
        if !exists {
            return Ok(HashMap::new());
        }

        let mut filter = VectorFilter::default()
            .must("repo_id", FieldValue::Text(key.repo.as_str().to_owned()))
            .must("snapshot", FieldValue::Text(key.snapshot.as_str().to_owned()));
        if let Some(prefix) = &request.filters.path_prefix {
            filter = filter.must("file_path", FieldValue::Prefix(prefix.clone()));
        }
        if let Some(language) = &request.filters.language {
            filter = filter.must("language", FieldValue::Text(language.clone()));
        }
        if let Some(kind) = request.filters.chunk_type {
            filter = filter.must("kind", FieldValue::Text(kind.as_str().to_owned()));
        }
        if let Some(name) = &request.filters.symbol_name {
            filter = filter.must("symbol_name", FieldValue::Text(name.clone()));
        }

        let points = tokio::time::timeout(
            vector_timeout,
            self.vectors
                .search(self.collection, vector, u64::try_from(n)?, Some(filter)),
        )
        .await
        .map_err(|_| IndexError::upstream(Upstream::VectorIndex, "timed out"))?
        .map_err(|e| IndexError::upstream(Upstream::VectorIndex, e))?;

        Ok(points
            .into_iter()
            .map(|p| (ChunkId::from_raw(p.id), f64::from(p.score)))
            .collect())
    }

    /// Load chunk records in fused order, paired with the chunk text. Ids without a record
    /// are dropped.
    async fn hydrate(
        &self,
        key: &PartitionKey,
        fused: &[Candidate],
        filters: &SearchFilters,
    ) -> Result<Vec<(SearchHit, String)>> {
        let ids: Vec<ChunkId> = fused.iter().map(|c| c.id.clone()).collect();
        let mut chunks: HashMap<ChunkId, Chunk> = self
            .store
            .chunks_by_ids(key, &ids)
            .await
            .map_err(|e| IndexError::upstream(Upstream::MetadataStore, e))?
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();

        let mut dropped = 0usize;
        let hits: Vec<(SearchHit, String)> = fused
            .iter()
            .filter_map(|candidate| {
                let Some(chunk) = chunks.remove(&candidate.id) else {
                    dropped += 1;
                    return None;
                };
                filters
                    .admits(&chunk)
                    .then(|| (SearchHit::new(&chunk, candidate), chunk.text))
            })
            .collect();
        if dropped > 0 {
            tracing::debug!(partition = %key, dropped, "candidates without chunk records");
        }
        Ok(hits)
    }

    async fn rerank(&self, query: &str, hits: &mut [(SearchHit, String)]) -> Result<()> {
        let Some(reranker) = self.reranker else {
            return Err(IndexError::RerankerUnavailable(
                "no reranker configured".into(),
            ));
        };
        if hits.is_empty() {
            return Ok(());
        }

        let documents: Vec<String> = hits
            .iter()
            .map(|(_, text)| truncate_chars(text, self.config.max_rerank_chars).to_owned())
            .collect();

        let scores = tokio::time::timeout(
            Duration::from_secs(self.config.rerank_timeout_secs),
            reranker.rerank(query, &documents),
        )
        .await
        .map_err(|_| IndexError::RerankerUnavailable("timed out".into()))?
        .map_err(|e| IndexError::RerankerUnavailable(e.to_string()))?;
        if scores.len() != hits.len() {
            return Err(IndexError::RerankerUnavailable(format!(
                "expected {} scores, got {}",
                hits.len(),
                scores.len()
            )));
        }

        for ((hit, _), score) in hits.iter_mut().zip(scores) {
            hit.rerank = Some(score);
        }
        hits.sort_by(|(a, _), (b, _)| {
            let (sa, sb) = (a.rerank.unwrap_or(f32::MIN), b.rerank.unwrap_or(f32::MIN));
            sb.total_cmp(&sa).then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        Ok(())
    }
}
