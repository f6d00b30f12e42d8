mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use sift_index::git::GitRepo;
use sift_index::{
    CodeIndex, Direction, ReferenceQuery, Repository, SearchFilters, SearchMode, SearchRequest,
    SymbolQuery,
};
use sift_llm::http::build_client;
use sift_llm::{CompatibleEmbedder, Embedder, HttpReranker, Reranker};
use sift_store::{ChunkKind, InMemoryVectorStore, QdrantOps, SqliteStore, VectorStore};

use crate::config::{Config, VectorBackend, resolve_config_path};

#[derive(Debug, Parser)]
#[command(name = "sift", version, about = "Incremental code index with hybrid search")]
struct Cli {
    /// Configuration file (default: $SIFT_CONFIG, then config/sift.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Index new and changed files of a snapshot.
    Refresh {
        repo: PathBuf,
        /// Commit-ish to index instead of the working tree.
        #[arg(long)]
        snapshot: Option<String>,
        /// Only consider these repository-relative paths.
        #[arg(long = "path")]
        paths: Vec<String>,
        /// Only consider paths changed since this git ref.
        #[arg(long, conflicts_with = "paths")]
        since: Option<String>,
    },
    /// Counts for an indexed snapshot.
    Status {
        repo: PathBuf,
        #[arg(long)]
        snapshot: Option<String>,
    },
    /// Search indexed chunks.
    Search {
        repo: PathBuf,
        query: String,
        #[arg(long)]
        snapshot: Option<String>,
        #[arg(long, default_value_t = 10)]
        top_k: usize,
        /// lexical, semantic or hybrid.
        #[arg(long, default_value = "hybrid")]
        mode: String,
        /// Semantic weight in hybrid mode.
        #[arg(long)]
        alpha: Option<f32>,
        #[arg(long)]
        rerank: bool,
        #[arg(long)]
        path_prefix: Option<String>,
        #[arg(long)]
        language: Option<String>,
        /// function, class, module_window or line_window.
        #[arg(long)]
        chunk_type: Option<String>,
        /// Only chunks of the definition with this exact name.
        #[arg(long)]
        symbol_name: Option<String>,
    },
    /// Find symbol definitions by name.
    Symbols {
        repo: PathBuf,
        name: String,
        #[arg(long)]
        language: Option<String>,
        #[arg(long)]
        snapshot: Option<String>,
        #[arg(long)]
        path_prefix: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// List call sites of a name.
    Refs {
        repo: PathBuf,
        name: String,
        #[arg(long)]
        snapshot: Option<String>,
        #[arg(long)]
        path_prefix: Option<String>,
        #[arg(long, default_value_t = 200)]
        limit: usize,
        /// Every read of the name with its line context, not only calls.
        #[arg(long)]
        names: bool,
    },
    /// Callers and callees around a symbol.
    Callgraph {
        repo: PathBuf,
        symbol_id: String,
        #[arg(long, default_value_t = 1)]
        depth: u32,
        /// out, in or both.
        #[arg(long, default_value = "both")]
        direction: String,
        #[arg(long)]
        snapshot: Option<String>,
    },
    /// Indexed snapshots of a repository.
    Snapshots { repo: PathBuf },
    /// Print a line range of a file as indexed.
    Fetch {
        repo: PathBuf,
        path: String,
        #[arg(long)]
        start: Option<u32>,
        #[arg(long)]
        end: Option<u32>,
        #[arg(long)]
        snapshot: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_subscriber();
    let cli = Cli::parse();

    let config_path = resolve_config_path(cli.config.as_deref());
    let config = Config::load(&config_path)?;
    config.validate()?;
    tracing::debug!(path = %config_path.display(), "configuration loaded");

    let index = build_index(&config).await?;
    run(&index, cli.command).await
}

fn init_subscriber() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

async fn build_index(config: &Config) -> anyhow::Result<CodeIndex> {
    let sqlite_path = &config.storage.sqlite_path;
    if sqlite_path != ":memory:"
        && let Some(parent) = Path::new(sqlite_path).parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let store = SqliteStore::new(sqlite_path)
        .await
        .with_context(|| format!("failed to open metadata store {sqlite_path}"))?;

    let vectors: Arc<dyn VectorStore> = match config.storage.vector_backend {
        VectorBackend::Qdrant => Arc::new(
            QdrantOps::new(&config.storage.qdrant_url)
                .with_context(|| format!("failed to connect to {}", config.storage.qdrant_url))?,
        ),
        VectorBackend::Memory => {
            tracing::warn!("in-memory vector backend: semantic search only sees this run");
            Arc::new(InMemoryVectorStore::new())
        }
    };

    let embedding = &config.embedding;
    let client = build_client(Duration::from_secs(embedding.timeout_secs))
        .context("failed to build HTTP client")?;
    let embedder: Arc<dyn Embedder> = Arc::new(
        CompatibleEmbedder::new(client, embedding.base_url.clone(), embedding.model.clone())
            .with_api_key(embedding.api_key.clone())
            .with_max_retries(embedding.max_retries),
    );

    let rerank = &config.rerank;
    let reranker: Option<Arc<dyn Reranker>> = if rerank.enabled {
        let client = build_client(Duration::from_secs(rerank.timeout_secs))
            .context("failed to build HTTP client")?;
        Some(Arc::new(
            HttpReranker::new(client, rerank.base_url.clone(), rerank.model.clone())
                .with_api_key(rerank.api_key.clone())
                .with_max_retries(rerank.max_retries),
        ))
    } else {
        None
    };

    tracing::info!(
        embedder = embedder.name(),
        reranker = reranker.as_ref().map(|r| r.name()),
        backend = ?config.storage.vector_backend,
        "index ready"
    );
    Ok(CodeIndex::new(
        store,
        vectors,
        embedder,
        reranker,
        config.index_config(),
    ))
}

#[allow(clippy::too_many_lines)]
async fn run(index: &CodeIndex, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Refresh {
            repo,
            snapshot,
            paths,
            since,
        } => {
            let repo = Repository::open(&repo)?;
            let candidates = match since {
                Some(base) => Some(GitRepo::new(repo.root()).changed_files(&base).await?),
                None if paths.is_empty() => None,
                None => Some(paths),
            };
            let report = index
                .index_refresh(&repo, snapshot.as_deref(), candidates)
                .await?;
            print_json(&report)
        }
        Command::Status { repo, snapshot } => {
            let repo = Repository::open(&repo)?;
            print_json(&index.index_status(&repo, snapshot.as_deref()).await?)
        }
        Command::Search {
            repo,
            query,
            snapshot,
            top_k,
            mode,
            alpha,
            rerank,
            path_prefix,
            language,
            chunk_type,
            symbol_name,
        } => {
            let repo = Repository::open(&repo)?;
            let chunk_type = chunk_type
                .map(|kind| kind.parse::<ChunkKind>())
                .transpose()?;
            let mut request = SearchRequest::new(query)
                .with_mode(mode.parse::<SearchMode>()?)
                .with_top_k(top_k)
                .with_rerank(rerank)
                .with_filters(SearchFilters {
                    path_prefix,
                    language,
                    chunk_type,
                    symbol_name,
                });
            request.snapshot = snapshot;
            request.alpha = alpha;
            print_json(&index.codebase_search(&repo, &request).await?)
        }
        Command::Symbols {
            repo,
            name,
            language,
            snapshot,
            path_prefix,
            limit,
        } => {
            let repo = Repository::open(&repo)?;
            let query = SymbolQuery {
                name,
                language,
                snapshot,
                path_prefix,
                limit,
            };
            print_json(&index.symbol_find(&repo, &query).await?)
        }
        Command::Refs {
            repo,
            name,
            snapshot,
            path_prefix,
            limit,
            names,
        } => {
            let repo = Repository::open(&repo)?;
            let query = ReferenceQuery {
                symbol_name: name,
                snapshot,
                path_prefix,
                limit,
            };
            if names {
                print_json(&index.name_references(&repo, &query).await?)
            } else {
                print_json(&index.symbol_references(&repo, &query).await?)
            }
        }
        Command::Callgraph {
            repo,
            symbol_id,
            depth,
            direction,
            snapshot,
        } => {
            let repo = Repository::open(&repo)?;
            let direction = direction.parse::<Direction>()?;
            let graph = index
                .callgraph(&repo, &symbol_id, depth, direction, snapshot.as_deref())
                .await?;
            print_json(&graph)
        }
        Command::Snapshots { repo } => {
            let repo = Repository::open(&repo)?;
            print_json(&index.git_list_snapshots(&repo).await?)
        }
        Command::Fetch {
            repo,
            path,
            start,
            end,
            snapshot,
        } => {
            let repo = Repository::open(&repo)?;
            let fetched = index
                .codebase_fetch(&repo, &path, start, end, snapshot.as_deref())
                .await?;
            print_json(&fetched)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let out = serde_json::to_string_pretty(value).context("failed to serialize result")?;
    println!("{out}");
    Ok(())
}
