//! Process-wide coordinator exposing the indexing and query operations.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use sift_llm::{Embedder, Reranker};
use sift_store::sqlite::{SnapshotInfo, SymbolFilter};
use sift_store::{
    CallEdge, NameRef, PartitionKey, RepoId, Snapshot, SqliteStore, Symbol, SymbolId, VectorStore,
};

use crate::callgraph::{CallGraph, Direction, Subgraph};
use crate::chunker::ChunkerConfig;
use crate::error::{InputError, Result};
use crate::git::GitRepo;
use crate::indexer::{Indexer, IndexerConfig, RefreshReport};
use crate::languages::detect_language;
use crate::lexical::LexicalCache;
use crate::progress::{ProgressTracker, RefreshProgress};
use crate::search::{SearchConfig, SearchHit, SearchRequest, Searcher};
use crate::source::{CommitTree, SourceTree, WorkingTree, normalize_relative_path};

/// Most lines returned by one [`CodeIndex::codebase_fetch`].
pub const MAX_FETCH_LINES: u32 = 600;

const DEFAULT_SYMBOL_LIMIT: usize = 50;
const DEFAULT_REFERENCE_LIMIT: usize = 200;

/// Top-level configuration of a [`CodeIndex`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub chunker: ChunkerConfig,
    pub indexer: IndexerConfig,
    pub search: SearchConfig,
    /// Vector collection shared by all partitions.
    pub collection: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            chunker: ChunkerConfig::default(),
            indexer: IndexerConfig::default(),
            search: SearchConfig::default(),
            collection: "sift_code_chunks".into(),
        }
    }
}

/// A repository root on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    root: PathBuf,
    id: RepoId,
}

impl Repository {
    /// Canonicalize `path` and derive the repository id from it.
    ///
    /// # Errors
    ///
    /// Returns [`InputError::BadRepository`] if the path does not name a directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bad = || InputError::BadRepository(path.display().to_string());
        let root = std::fs::canonicalize(path).map_err(|_| bad())?;
        if !root.is_dir() {
            return Err(bad().into());
        }
        let id = RepoId::from_root(&root);
        Ok(Self { root, id })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn id(&self) -> &RepoId {
        &self.id
    }

    fn git(&self) -> GitRepo {
        GitRepo::new(&self.root)
    }
}

/// Counts for one partition.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStatus {
    pub repo_id: String,
    pub snapshot: String,
    pub files: u64,
    pub partial_files: u64,
    pub chunks: u64,
    pub chunks_without_vectors: u64,
    pub symbols: u64,
    pub call_edges: u64,
    pub resolved_edges: u64,
    pub unresolved_edges: u64,
    pub name_refs: u64,
    pub pending_vector_deletes: u64,
    pub indexed_at: Option<String>,
    /// A refresh currently holds the partition lock.
    pub refreshing: bool,
    /// Set while a refresh of this partition runs.
    pub progress: Option<RefreshProgress>,
}

/// A line range of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchedSource {
    pub path: String,
    pub snapshot: String,
    pub language: String,
    pub start_line: u32,
    pub end_line: u32,
    pub total_lines: u32,
    pub text: String,
}

/// Symbol lookup by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolQuery {
    /// Case-insensitive substring of the name.
    pub name: String,
    pub language: Option<String>,
    pub snapshot: Option<String>,
    pub path_prefix: Option<String>,
    pub limit: usize,
}

impl SymbolQuery {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            language: None,
            snapshot: None,
            path_prefix: None,
            limit: DEFAULT_SYMBOL_LIMIT,
        }
    }
}

/// Call sites or reads of a name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceQuery {
    /// Matched against the last segment of each callee, or the whole name for name reads.
    pub symbol_name: String,
    pub snapshot: Option<String>,
    /// Restricts the referencing file.
    pub path_prefix: Option<String>,
    pub limit: usize,
}

impl ReferenceQuery {
    #[must_use]
    pub fn new(symbol_name: impl Into<String>) -> Self {
        Self {
            symbol_name: symbol_name.into(),
            snapshot: None,
            path_prefix: None,
            limit: DEFAULT_REFERENCE_LIMIT,
        }
    }
}

type PartitionLock = Arc<tokio::sync::Mutex<()>>;

/// Owns the stores and model clients and serializes refreshes per partition.
pub struct CodeIndex {
    store: SqliteStore,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    reranker: Option<Arc<dyn Reranker>>,
    config: IndexConfig,
    lexical: LexicalCache,
    locks: Mutex<HashMap<PartitionKey, PartitionLock>>,
    progress: Mutex<HashMap<PartitionKey, Arc<ProgressTracker>>>,
}

impl CodeIndex {
    #[must_use]
    pub fn new(
        store: SqliteStore,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        reranker: Option<Arc<dyn Reranker>>,
        config: IndexConfig,
    ) -> Self {
        Self {
            store,
            vectors,
            embedder,
            reranker,
            config,
            lexical: LexicalCache::default(),
            locks: Mutex::new(HashMap::new()),
            progress: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    fn partition_lock(&self, key: &PartitionKey) -> PartitionLock {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    fn is_refreshing(&self, key: &PartitionKey) -> bool {
        let locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.get(key).is_some_and(|lock| lock.try_lock().is_err())
    }

    fn progress_map(&self) -> MutexGuard<'_, HashMap<PartitionKey, Arc<ProgressTracker>>> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refresh_progress(&self, key: &PartitionKey) -> Option<RefreshProgress> {
        self.progress_map().get(key).map(|tracker| tracker.snapshot())
    }

    /// Bring a snapshot of `repo` up to date.
    ///
    /// `snapshot` defaults to the working tree; anything else is resolved through git to a
    /// full commit id and indexed from the commit's own content. With `paths`, only those
    /// files are considered.
    ///
    /// # Errors
    ///
    /// Returns an [`InputError`] for bad paths or unknown revisions, and an error if the file
    /// set cannot be enumerated or the metadata store fails.
    pub async fn index_refresh(
        &self,
        repo: &Repository,
        snapshot: Option<&str>,
        paths: Option<Vec<String>>,
    ) -> Result<RefreshReport> {
        let max_file_bytes = self.config.indexer.max_file_bytes;
        match Snapshot::parse(snapshot.unwrap_or_default()) {
            Snapshot::WorkingTree => {
                let tree = WorkingTree::new(repo.root(), max_file_bytes);
                self.refresh_from_source(repo, Snapshot::WorkingTree, &tree, paths)
                    .await
            }
            Snapshot::Commit(rev) => {
                let git = repo.git();
                let commit = git.resolve_commit(&rev).await?;
                let tree = CommitTree::new(git, commit.clone(), max_file_bytes);
                self.refresh_from_source(repo, Snapshot::Commit(commit), &tree, paths)
                    .await
            }
        }
    }

    /// Refresh one partition from an arbitrary file source.
    ///
    /// # Errors
    ///
    /// See [`CodeIndex::index_refresh`].
    pub async fn refresh_from_source(
        &self,
        repo: &Repository,
        snapshot: Snapshot,
        tree: &dyn SourceTree,
        paths: Option<Vec<String>>,
    ) -> Result<RefreshReport> {
        let candidates = paths
            .map(|paths| {
                paths
                    .iter()
                    .map(|p| normalize_relative_path(p))
                    .collect::<std::result::Result<Vec<_>, _>>()
            })
            .transpose()?;

        let key = PartitionKey::new(repo.id().clone(), snapshot);
        let lock = self.partition_lock(&key);
        let _guard = lock.lock().await;

        let tracker = Arc::new(ProgressTracker::default());
        self.progress_map().insert(key.clone(), Arc::clone(&tracker));
        let report = async {
            self.store
                .register_repository(repo.id(), &repo.root().to_string_lossy())
                .await?;
            let lexical = self.lexical.get(&self.store, &key).await?;
            Indexer::new(
                &self.store,
                self.vectors.as_ref(),
                self.embedder.as_ref(),
                lexical,
                &self.config.collection,
                &self.config.chunker,
                &self.config.indexer,
            )
            .with_progress(tracker)
            .refresh(&key, tree, candidates.as_deref())
            .await
        }
        .await;
        self.progress_map().remove(&key);
        report
    }

    /// Resolve a query snapshot to an indexed partition.
    async fn indexed_partition(
        &self,
        repo: &Repository,
        snapshot: Option<&str>,
    ) -> Result<PartitionKey> {
        let raw = snapshot.unwrap_or_default();
        let parsed = Snapshot::parse(raw);
        let key = PartitionKey::new(repo.id().clone(), parsed.clone());
        if self.store.snapshot_exists(&key).await? {
            return Ok(key);
        }
        if let Snapshot::Commit(rev) = parsed
            && let Ok(commit) = repo.git().resolve_commit(&rev).await
        {
            let key = PartitionKey::new(repo.id().clone(), Snapshot::Commit(commit));
            if self.store.snapshot_exists(&key).await? {
                return Ok(key);
            }
        }
        Err(InputError::UnknownSnapshot(key.snapshot.to_string()).into())
    }

    /// A partition whose first refresh is still running.
    async fn refreshing_partition(
        &self,
        repo: &Repository,
        snapshot: Option<&str>,
    ) -> Option<PartitionKey> {
        let key = match Snapshot::parse(snapshot.unwrap_or_default()) {
            Snapshot::WorkingTree => PartitionKey::new(repo.id().clone(), Snapshot::WorkingTree),
            Snapshot::Commit(rev) => {
                let commit = repo.git().resolve_commit(&rev).await.ok()?;
                PartitionKey::new(repo.id().clone(), Snapshot::Commit(commit))
            }
        };
        self.progress_map().contains_key(&key).then_some(key)
    }

    /// Counts for one indexed snapshot, plus live progress while a refresh runs.
    ///
    /// # Errors
    ///
    /// Returns [`InputError::UnknownSnapshot`] if the snapshot was never indexed and is not
    /// being indexed right now.
    pub async fn index_status(
        &self,
        repo: &Repository,
        snapshot: Option<&str>,
    ) -> Result<IndexStatus> {
        let key = match self.indexed_partition(repo, snapshot).await {
            Ok(key) => key,
            Err(e) => match self.refreshing_partition(repo, snapshot).await {
                Some(key) => key,
                None => return Err(e),
            },
        };
        let stats = self.store.partition_stats(&key).await?;
        Ok(IndexStatus {
            repo_id: key.repo.to_string(),
            snapshot: key.snapshot.to_string(),
            files: stats.files,
            partial_files: stats.partial_files,
            chunks: stats.chunks,
            chunks_without_vectors: stats.chunks_without_vectors,
            symbols: stats.symbols,
            call_edges: stats.call_edges,
            resolved_edges: stats.resolved_edges,
            unresolved_edges: stats.call_edges.saturating_sub(stats.resolved_edges),
            name_refs: stats.name_refs,
            pending_vector_deletes: stats.pending_vector_deletes,
            indexed_at: stats.indexed_at,
            refreshing: self.is_refreshing(&key),
            progress: self.refresh_progress(&key),
        })
    }

    /// Ranked chunks for a query.
    ///
    /// # Errors
    ///
    /// Returns an [`InputError`] for invalid requests or unknown snapshots, an upstream error
    /// if the embedder or vector index fails in semantic or hybrid mode, and
    /// [`crate::IndexError::RerankerUnavailable`] if reranking was requested but failed.
    pub async fn codebase_search(
        &self,
        repo: &Repository,
        request: &SearchRequest,
    ) -> Result<Vec<SearchHit>> {
        let alpha = request.validate(self.config.search.default_alpha)?;
        if let Some(prefix) = &request.filters.path_prefix {
            check_prefix(prefix)?;
        }
        let key = self.indexed_partition(repo, request.snapshot.as_deref()).await?;
        let lexical = self.lexical.get(&self.store, &key).await?;
        let searcher = Searcher {
            store: &self.store,
            vectors: self.vectors.as_ref(),
            embedder: self.embedder.as_ref(),
            reranker: self.reranker.as_deref(),
            collection: &self.config.collection,
            config: &self.config.search,
        };
        let hits = searcher.search(&key, &lexical, request, alpha).await?;
        tracing::info!(
            partition = %key,
            mode = ?request.mode,
            hits = hits.len(),
            "search complete"
        );
        Ok(hits)
    }

    /// Symbols whose name contains `query.name`, exact matches first.
    ///
    /// # Errors
    ///
    /// Returns an [`InputError`] for an empty name or unknown snapshot.
    pub async fn symbol_find(
        &self,
        repo: &Repository,
        query: &SymbolQuery,
    ) -> Result<Vec<Symbol>> {
        if query.name.trim().is_empty() {
            return Err(InputError::EmptyQuery.into());
        }
        if let Some(prefix) = &query.path_prefix {
            check_prefix(prefix)?;
        }
        let key = self.indexed_partition(repo, query.snapshot.as_deref()).await?;
        let filter = SymbolFilter {
            name: query.name.trim(),
            language: query.language.as_deref(),
            path_prefix: query.path_prefix.as_deref(),
            limit: query.limit,
        };
        Ok(self.store.find_symbols(&key, &filter).await?)
    }

    /// Call edges whose callee's last segment equals `query.symbol_name`.
    ///
    /// # Errors
    ///
    /// Returns an [`InputError`] for an empty name or unknown snapshot.
    pub async fn symbol_references(
        &self,
        repo: &Repository,
        query: &ReferenceQuery,
    ) -> Result<Vec<CallEdge>> {
        let name = query.symbol_name.trim();
        let name = name.rsplit('.').next().unwrap_or(name);
        if name.is_empty() {
            return Err(InputError::EmptyQuery.into());
        }
        if let Some(prefix) = &query.path_prefix {
            check_prefix(prefix)?;
        }
        let key = self.indexed_partition(repo, query.snapshot.as_deref()).await?;
        Ok(self
            .store
            .references(&key, name, query.path_prefix.as_deref(), query.limit)
            .await?)
    }

    /// Every read of `query.symbol_name`, including uses that are not calls, each with the
    /// surrounding part of its line.
    ///
    /// # Errors
    ///
    /// Returns an [`InputError`] for an empty name or unknown snapshot.
    pub async fn name_references(
        &self,
        repo: &Repository,
        query: &ReferenceQuery,
    ) -> Result<Vec<NameRef>> {
        let name = query.symbol_name.trim();
        let name = name.rsplit('.').next().unwrap_or(name);
        if name.is_empty() {
            return Err(InputError::EmptyQuery.into());
        }
        if let Some(prefix) = &query.path_prefix {
            check_prefix(prefix)?;
        }
        let key = self.indexed_partition(repo, query.snapshot.as_deref()).await?;
        Ok(self
            .store
            .name_references(&key, name, query.path_prefix.as_deref(), query.limit)
            .await?)
    }

    /// Subgraph of callers and/or callees around a symbol.
    ///
    /// Without `snapshot` the seed symbol's own snapshot is used.
    ///
    /// # Errors
    ///
    /// Returns [`InputError::UnknownSymbol`] if the symbol does not exist in the requested
    /// snapshot of `repo`.
    pub async fn callgraph(
        &self,
        repo: &Repository,
        symbol_id: &str,
        depth: u32,
        direction: Direction,
        snapshot: Option<&str>,
    ) -> Result<Subgraph> {
        let unknown = || InputError::UnknownSymbol(symbol_id.to_owned());
        let seed = SymbolId::from_raw(symbol_id);
        let located = self.store.symbol(&seed).await?.ok_or_else(unknown)?;
        if &located.key.repo != repo.id() {
            return Err(unknown().into());
        }
        let key = match snapshot {
            Some(_) => self.indexed_partition(repo, snapshot).await?,
            None => located.key,
        };
        let symbols = self.store.symbols_in_partition(&key).await?;
        if !symbols.iter().any(|s| s.id == seed) {
            return Err(unknown().into());
        }
        let edges = self.store.call_edges_in_partition(&key).await?;
        let graph = CallGraph::new(symbols, edges);
        let subgraph = graph.traverse(
            &seed,
            depth,
            direction,
            self.config.search.max_edges_per_hop,
        );
        tracing::debug!(
            partition = %key,
            nodes = subgraph.nodes.len(),
            edges = subgraph.edges.len(),
            "callgraph traversed"
        );
        Ok(subgraph)
    }

    /// Indexed snapshots of `repo`, most recent first.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata store fails.
    pub async fn git_list_snapshots(&self, repo: &Repository) -> Result<Vec<SnapshotInfo>> {
        Ok(self.store.list_snapshots(repo.id()).await?)
    }

    /// Lines `start..=end` of a file as stored in a snapshot, at most [`MAX_FETCH_LINES`].
    ///
    /// # Errors
    ///
    /// Returns an [`InputError`] for a bad path, an invalid range, an unknown snapshot or a
    /// file that does not exist in the snapshot.
    pub async fn codebase_fetch(
        &self,
        repo: &Repository,
        path: &str,
        start: Option<u32>,
        end: Option<u32>,
        snapshot: Option<&str>,
    ) -> Result<FetchedSource> {
        let path = normalize_relative_path(path)?;
        let start = start.unwrap_or(1);
        let end = end.unwrap_or_else(|| start.saturating_add(MAX_FETCH_LINES - 1));
        if start == 0 || end < start {
            return Err(InputError::InvalidRange { start, end }.into());
        }

        let key = self.indexed_partition(repo, snapshot).await?;
        let max_file_bytes = self.config.indexer.max_file_bytes;
        let content = match &key.snapshot {
            Snapshot::WorkingTree => {
                WorkingTree::new(repo.root(), max_file_bytes)
                    .read_file(&path)
                    .await?
            }
            Snapshot::Commit(commit) => {
                CommitTree::new(repo.git(), commit.clone(), max_file_bytes)
                    .read_file(&path)
                    .await?
            }
        };
        let Some(bytes) = content else {
            return Err(InputError::BadPath(path).into());
        };

        let text = String::from_utf8_lossy(&bytes);
        let lines: Vec<&str> = text.lines().collect();
        let total_lines = u32::try_from(lines.len())?;
        if start > total_lines.max(1) {
            return Err(InputError::InvalidRange { start, end }.into());
        }
        let end = end
            .min(start.saturating_add(MAX_FETCH_LINES - 1))
            .min(total_lines);
        let lo = usize::try_from(start - 1)?;
        let hi = usize::try_from(end)?;
        let body = lines.get(lo..hi).unwrap_or_default().join("\n");

        Ok(FetchedSource {
            language: detect_language(Path::new(&path)).id().to_owned(),
            path,
            snapshot: key.snapshot.to_string(),
            start_line: start,
            end_line: end,
            total_lines,
            text: body,
        })
    }
}

/// Prefixes may be partial names (`src/au`) but must stay inside the repository.
fn check_prefix(prefix: &str) -> std::result::Result<(), InputError> {
    if prefix.is_empty() {
        return Ok(());
    }
    normalize_relative_path(prefix).map(|_| ())
}
