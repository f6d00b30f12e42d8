//! Incremental refresh of one partition: enumerate → diff → chunk → embed → store.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use sift_llm::Embedder;
use sift_store::sqlite::{ChunkEntry, FileGeneration};
use sift_store::{
    Chunk, ChunkId, FileRecord, FileStatus, PartitionKey, SqliteStore, VectorPoint, VectorStore,
};
use tokio::sync::{OnceCell, Semaphore};

use crate::chunker::{ChunkerConfig, chunk_file};
use crate::context::contextualize_for_embedding;
use crate::error::Result;
use crate::languages::detect_language;
use crate::lexical::{self, DocMeta, SharedIndex, term_counts};
use crate::progress::{ProgressTracker, RefreshStage};
use crate::retry::{RetryPolicy, with_retry};
use crate::source::{SourceTree, looks_binary};

/// Indexer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Files processed concurrently (default: 4).
    pub workers: usize,
    /// Embedding requests in flight across all files (default: 4).
    pub embed_concurrency: usize,
    /// Chunks sent per embedding request (default: 16).
    pub embed_batch_size: usize,
    /// Attempts per embedding or vector upsert (default: 3).
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub embed_timeout_secs: u64,
    pub upsert_timeout_secs: u64,
    /// Points per vector upsert request.
    pub upsert_batch: usize,
    /// Larger files are not indexed (default: 1 MB).
    pub max_file_bytes: u64,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            embed_concurrency: 4,
            embed_batch_size: 16,
            max_attempts: 3,
            retry_base_delay_ms: 200,
            embed_timeout_secs: 30,
            upsert_timeout_secs: 30,
            upsert_batch: 64,
            max_file_bytes: 1_000_000,
        }
    }
}

impl IndexerConfig {
    fn policy(&self, timeout_secs: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

/// Summary of one refresh.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshReport {
    pub repo_id: String,
    pub snapshot: String,
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub unchanged: usize,
    /// Files that could not be written at all; their previous generation is kept.
    pub failed: usize,
    /// Files whose structural parse failed and were chunked into line windows.
    pub degraded: Vec<String>,
    /// Files with at least one chunk missing its vector; retried on the next refresh.
    pub partial: Vec<String>,
    pub chunk_failures: usize,
    /// Call edges whose resolution changed in the post-run pass.
    pub edges_reresolved: usize,
    /// Vector deletions that failed and stay queued for the next refresh.
    pub pending_vector_deletes: usize,
    pub errors: Vec<String>,
    pub elapsed_ms: u64,
}

impl RefreshReport {
    #[must_use]
    pub fn changed(&self) -> usize {
        self.added + self.updated + self.removed
    }
}

enum Outcome {
    Unchanged,
    Written {
        added: bool,
        parse_error: Option<String>,
        chunk_failures: usize,
    },
    /// Listed but unreadable, binary or too large now.
    Vanished,
}

/// One refresh run over one partition.
pub(crate) struct Indexer<'a> {
    pub store: &'a SqliteStore,
    pub vectors: &'a dyn VectorStore,
    pub embedder: &'a dyn Embedder,
    pub lexical: SharedIndex,
    pub collection: &'a str,
    pub chunker: &'a ChunkerConfig,
    pub config: &'a IndexerConfig,
    embed_permits: Semaphore,
    collection_ready: OnceCell<()>,
    progress: Arc<ProgressTracker>,
}

impl<'a> Indexer<'a> {
    pub(crate) fn new(
        store: &'a SqliteStore,
        vectors: &'a dyn VectorStore,
        embedder: &'a dyn Embedder,
        lexical: SharedIndex,
        collection: &'a str,
        chunker: &'a ChunkerConfig,
        config: &'a IndexerConfig,
    ) -> Self {
        Self {
            store,
            vectors,
            embedder,
            lexical,
            collection,
            chunker,
            config,
            embed_permits: Semaphore::new(config.embed_concurrency.max(1)),
            collection_ready: OnceCell::new(),
            progress: Arc::default(),
        }
    }

    /// Report progress through a tracker shared with status readers.
    #[must_use]
    pub(crate) fn with_progress(mut self, progress: Arc<ProgressTracker>) -> Self {
        self.progress = progress;
        self
    }

    /// Bring the partition in line with `tree`.
    ///
    /// With `candidates`, only those paths are considered: listed candidates are indexed,
    /// candidates that no longer exist are removed, other files are left alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the file set cannot be enumerated or the metadata store fails
    /// outside a per-file write.
    pub(crate) async fn refresh(
        &self,
        key: &PartitionKey,
        tree: &dyn SourceTree,
        candidates: Option<&[String]>,
    ) -> Result<RefreshReport> {
        let started = Instant::now();
        let mut report = RefreshReport {
            repo_id: key.repo.to_string(),
            snapshot: key.snapshot.to_string(),
            ..RefreshReport::default()
        };

        self.retry_pending_deletes(key).await?;

        let listed = tree.list_files().await?;
        let records = self.store.file_records(key).await?;
        let listed_set: HashSet<&str> = listed.iter().map(String::as_str).collect();

        let (targets, mut removals): (Vec<&str>, Vec<String>) = match candidates {
            None => (
                listed.iter().map(String::as_str).collect(),
                records
                    .keys()
                    .filter(|p| !listed_set.contains(p.as_str()))
                    .cloned()
                    .collect(),
            ),
            Some(paths) => (
                paths
                    .iter()
                    .map(String::as_str)
                    .filter(|p| listed_set.contains(p))
                    .collect(),
                paths
                    .iter()
                    .filter(|p| !listed_set.contains(p.as_str()) && records.contains_key(*p))
                    .cloned()
                    .collect(),
            ),
        };
        tracing::info!(
            partition = %key,
            files = targets.len(),
            known = records.len(),
            "refresh started"
        );
        let total = targets.len();
        self.progress.start(total);

        let known = &records;
        let outcomes: Vec<(&str, Result<Outcome>)> = futures::stream::iter(targets)
            .map(|path| async move {
                let outcome = self.process_file(key, tree, path, known.get(path)).await;
                let done = self.progress.file_done();
                if self.progress.is_milestone(done) {
                    tracing::info!(
                        partition = %key,
                        progress = format_args!("{done}/{total}"),
                        "refresh progress"
                    );
                }
                (path, outcome)
            })
            .buffer_unordered(self.config.workers.max(1))
            .collect()
            .await;

        for (path, outcome) in outcomes {
            match outcome {
                Ok(Outcome::Unchanged) => report.unchanged += 1,
                Ok(Outcome::Written {
                    added,
                    parse_error,
                    chunk_failures,
                }) => {
                    if added {
                        report.added += 1;
                    } else {
                        report.updated += 1;
                    }
                    if let Some(error) = parse_error {
                        report.degraded.push(path.to_owned());
                        report.errors.push(format!("{path}: {error}"));
                    }
                    if chunk_failures > 0 {
                        report.partial.push(path.to_owned());
                        report.chunk_failures += chunk_failures;
                    }
                }
                Ok(Outcome::Vanished) => {
                    if records.contains_key(path) {
                        removals.push(path.to_owned());
                    }
                }
                Err(e) => {
                    tracing::error!(path, error = %e, "indexing failed");
                    report.failed += 1;
                    report.errors.push(format!("{path}: {e}"));
                }
            }
        }

        self.progress.set_stage(RefreshStage::Removing);
        for path in &removals {
            match self.remove_file(key, path).await {
                Ok(()) => report.removed += 1,
                Err(e) => {
                    tracing::error!(path, error = %e, "removal failed");
                    report.failed += 1;
                    report.errors.push(format!("{path}: {e}"));
                }
            }
        }

        self.progress.set_stage(RefreshStage::Linking);
        if report.changed() > 0 {
            report.edges_reresolved = self.store.resolve_call_edges(key).await?;
        }
        self.store.touch_snapshot(key).await?;
        report.pending_vector_deletes = self.store.pending_vector_deletes(key).await?.len();

        report.degraded.sort();
        report.partial.sort();
        report.errors.sort();
        report.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::info!(
            partition = %key,
            added = report.added,
            updated = report.updated,
            removed = report.removed,
            unchanged = report.unchanged,
            failed = report.failed,
            partial = report.partial.len(),
            pending_vector_deletes = report.pending_vector_deletes,
            elapsed_ms = report.elapsed_ms,
            "refresh complete"
        );
        Ok(report)
    }

    async fn process_file(
        &self,
        key: &PartitionKey,
        tree: &dyn SourceTree,
        path: &str,
        prior: Option<&FileRecord>,
    ) -> Result<Outcome> {
        let Some(bytes) = tree.read_file(path).await? else {
            return Ok(Outcome::Vanished);
        };
        if u64::try_from(bytes.len())? > self.config.max_file_bytes || looks_binary(&bytes) {
            tracing::debug!(path, "skipping binary or oversized file");
            return Ok(Outcome::Vanished);
        }

        let content_hash = blake3::hash(&bytes).to_hex().to_string();
        if let Some(prior) = prior
            && prior.content_hash == content_hash
            && prior.status == FileStatus::Indexed
        {
            return Ok(Outcome::Unchanged);
        }

        let text = String::from_utf8_lossy(&bytes);
        let lang = detect_language(Path::new(path));
        let chunked = chunk_file(key, path, &text, lang, self.chunker);
        let parse_error = chunked.parse_error().map(str::to_owned);
        if let Some(error) = &parse_error {
            tracing::warn!(path, error, "structural parse failed, using line windows");
        }
        let (chunks, symbols, edges, name_refs) = chunked.into_parts();

        let mut failures = self.embed_and_upsert(key, &chunks).await;
        let entries: Vec<ChunkEntry> = chunks
            .into_iter()
            .map(|chunk| {
                let (terms, token_count) = term_counts(&chunk.text);
                ChunkEntry {
                    embed_error: failures.remove(&chunk.id),
                    terms,
                    token_count,
                    chunk,
                }
            })
            .collect();
        let chunk_failures = entries.iter().filter(|e| e.embed_error.is_some()).count();
        let status = if chunk_failures == 0 {
            FileStatus::Indexed
        } else {
            tracing::warn!(path, chunk_failures, "file partially indexed");
            FileStatus::Partial
        };

        let previous = self.store.chunk_ids_for_file(key, path).await?;
        let generation = FileGeneration {
            record: FileRecord {
                path: path.to_owned(),
                content_hash,
                size: u64::try_from(bytes.len())?,
                language: lang.id().to_owned(),
                status,
                indexed_at: String::new(),
            },
            chunks: entries,
            symbols,
            edges,
            name_refs,
        };
        self.store.replace_file(key, &generation).await?;

        let current: HashSet<&ChunkId> = generation.chunks.iter().map(|e| &e.chunk.id).collect();
        let stale: Vec<ChunkId> = previous
            .into_iter()
            .filter(|id| !current.contains(id))
            .collect();
        self.delete_vectors(key, path, &stale).await;
        {
            let mut index = lexical::write(&self.lexical);
            for id in &stale {
                index.remove(id);
            }
            for entry in &generation.chunks {
                index.insert(
                    entry.chunk.id.clone(),
                    DocMeta::of(&entry.chunk),
                    &entry.terms,
                    entry.token_count,
                );
            }
        }

        tracing::debug!(
            path,
            chunks = generation.chunks.len(),
            symbols = generation.symbols.len(),
            edges = generation.edges.len(),
            name_refs = generation.name_refs.len(),
            "file indexed"
        );
        Ok(Outcome::Written {
            added: prior.is_none(),
            parse_error,
            chunk_failures,
        })
    }

    /// Embed every chunk and upsert the vectors. Returns the error of each chunk that
    /// ended up without a vector.
    async fn embed_and_upsert(
        &self,
        key: &PartitionKey,
        chunks: &[Chunk],
    ) -> HashMap<ChunkId, String> {
        let mut failures = HashMap::new();
        let texts: Vec<String> = chunks.iter().map(contextualize_for_embedding).collect();
        let embedded: Vec<std::result::Result<Vec<f32>, String>> = futures::future::join_all(
            texts
                .chunks(self.config.embed_batch_size.max(1))
                .map(|batch| self.embed_batch(batch)),
        )
        .await
        .into_iter()
        .flatten()
        .collect();

        let mut points = Vec::with_capacity(chunks.len());
        for (chunk, result) in chunks.iter().zip(embedded) {
            match result {
                Ok(vector) => points.push(vector_point(key, chunk, vector)),
                Err(error) => {
                    tracing::warn!(path = %chunk.file_path, chunk = %chunk.id, %error, "embedding failed");
                    failures.insert(chunk.id.clone(), error);
                }
            }
        }
        if points.is_empty() {
            return failures;
        }

        if let Err(e) = self.ensure_collection(points[0].vector.len()).await {
            for point in points {
                failures.insert(ChunkId::from_raw(point.id), e.clone());
            }
            return failures;
        }

        let policy = self.config.policy(self.config.upsert_timeout_secs);
        for batch in points.chunks(self.config.upsert_batch.max(1)) {
            let result = with_retry("upsert", policy, || {
                self.vectors.upsert(self.collection, batch.to_vec())
            })
            .await;
            if let Err(e) = result {
                tracing::warn!(points = batch.len(), error = %e, "vector upsert failed");
                for point in batch {
                    failures.insert(ChunkId::from_raw(point.id.clone()), e.to_string());
                }
            }
        }
        failures
    }

    /// Embed a batch in one request. If the request fails, each text is retried on its own
    /// so one bad chunk does not fail its neighbours.
    async fn embed_batch(&self, texts: &[String]) -> Vec<std::result::Result<Vec<f32>, String>> {
        let policy = self.config.policy(self.config.embed_timeout_secs);
        if texts.len() > 1 {
            let Ok(permit) = self.embed_permits.acquire().await else {
                return texts.iter().map(|_| Err("embedding closed".to_owned())).collect();
            };
            let result =
                with_retry("embed_batch", policy, || self.embedder.embed_batch(texts)).await;
            drop(permit);
            match result {
                Ok(vectors) if vectors.len() == texts.len() => {
                    return vectors.into_iter().map(Ok).collect();
                }
                Ok(vectors) => tracing::warn!(
                    expected = texts.len(),
                    got = vectors.len(),
                    "embedding batch returned the wrong number of vectors"
                ),
                Err(e) => tracing::warn!(
                    size = texts.len(),
                    error = %e,
                    "embedding batch failed, embedding chunks one by one"
                ),
            }
        }
        futures::future::join_all(texts.iter().map(|text| async move {
            let _permit = self
                .embed_permits
                .acquire()
                .await
                .map_err(|e| e.to_string())?;
            with_retry("embed", policy, || self.embedder.embed(text))
                .await
                .map_err(|e| e.to_string())
        }))
        .await
    }

    async fn ensure_collection(&self, dimensions: usize) -> std::result::Result<(), String> {
        let size = u64::try_from(dimensions).map_err(|e| e.to_string())?;
        self.collection_ready
            .get_or_try_init(|| async {
                self.vectors
                    .ensure_collection(self.collection, size)
                    .await
                    .map_err(|e| e.to_string())
            })
            .await?;
        Ok(())
    }

    async fn try_delete(&self, ids: &[ChunkId]) -> std::result::Result<(), String> {
        let raw: Vec<String> = ids.iter().map(ToString::to_string).collect();
        let policy = self.config.policy(self.config.upsert_timeout_secs);
        with_retry("delete", policy, || {
            self.vectors.delete_by_ids(self.collection, raw.clone())
        })
        .await
        .map_err(|e| e.to_string())
    }

    /// Delete vectors, queueing them for a later refresh if the vector index refuses.
    async fn delete_vectors(&self, key: &PartitionKey, path: &str, ids: &[ChunkId]) {
        if ids.is_empty() {
            return;
        }
        let Err(error) = self.try_delete(ids).await else {
            return;
        };
        tracing::warn!(path, count = ids.len(), %error, "stale vectors not deleted, queued");
        if let Err(e) = self.store.queue_vector_deletes(key, ids).await {
            tracing::error!(path, error = %e, "cannot queue vector deletions");
        }
    }

    /// Retry vector deletions queued by earlier runs.
    async fn retry_pending_deletes(&self, key: &PartitionKey) -> Result<()> {
        let pending = self.store.pending_vector_deletes(key).await?;
        if pending.is_empty() {
            return Ok(());
        }
        match self.try_delete(&pending).await {
            Ok(()) => {
                self.store.clear_vector_deletes(key, &pending).await?;
                tracing::info!(
                    partition = %key,
                    count = pending.len(),
                    "queued vector deletions done"
                );
            }
            Err(error) => {
                tracing::warn!(
                    partition = %key,
                    count = pending.len(),
                    %error,
                    "queued vector deletions failed again"
                );
            }
        }
        Ok(())
    }

    async fn remove_file(&self, key: &PartitionKey, path: &str) -> Result<()> {
        let removed = self.store.remove_file(key, path).await?;
        self.delete_vectors(key, path, &removed).await;
        let mut index = lexical::write(&self.lexical);
        for id in &removed {
            index.remove(id);
        }
        tracing::debug!(path, chunks = removed.len(), "file removed");
        Ok(())
    }
}

fn vector_point(key: &PartitionKey, chunk: &Chunk, vector: Vec<f32>) -> VectorPoint {
    let mut payload = HashMap::from([
        ("repo_id".to_owned(), serde_json::json!(key.repo.as_str())),
        ("snapshot".to_owned(), serde_json::json!(key.snapshot.as_str())),
        ("file_path".to_owned(), serde_json::json!(chunk.file_path)),
        ("language".to_owned(), serde_json::json!(chunk.language)),
        ("kind".to_owned(), serde_json::json!(chunk.kind.as_str())),
        ("start_line".to_owned(), serde_json::json!(chunk.start_line)),
        ("end_line".to_owned(), serde_json::json!(chunk.end_line)),
        ("content_hash".to_owned(), serde_json::json!(chunk.content_hash)),
    ]);
    if let Some(name) = &chunk.symbol_name {
        payload.insert("symbol_name".to_owned(), serde_json::json!(name));
    }
    VectorPoint {
        id: chunk.id.to_string(),
        vector,
        payload,
    }
}
