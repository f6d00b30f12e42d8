use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sift_index::{ChunkerConfig, IndexConfig, IndexerConfig, SearchConfig};

const DEFAULT_CONFIG_PATH: &str = "config/sift.toml";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub rerank: RerankConfig,
    pub chunker: ChunkerConfig,
    pub indexer: IndexerConfig,
    pub search: SearchConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackend {
    #[default]
    Qdrant,
    /// Process-local; vectors are lost on exit.
    Memory,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub sqlite_path: String,
    pub vector_backend: VectorBackend,
    pub qdrant_url: String,
    pub collection: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "./data/sift.db".into(),
            vector_backend: VectorBackend::Qdrant,
            qdrant_url: "http://localhost:6334".into(),
            collection: "sift_code_chunks".into(),
        }
    }
}

/// OpenAI-compatible `/embeddings` endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    /// Retries on HTTP 429.
    pub max_retries: u32,
    /// Chunks sent per `/embeddings` request while indexing.
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".into(),
            model: "nomic-embed-text".into(),
            api_key: None,
            timeout_secs: 60,
            max_retries: 3,
            batch_size: 16,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RerankConfig {
    pub enabled: bool,
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "http://localhost:8787".into(),
            model: "BAAI/bge-reranker-base".into(),
            api_key: None,
            timeout_secs: 30,
            max_retries: 3,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then apply `SIFT_*` environment overrides.
    ///
    /// A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            toml::from_str::<Self>(&content)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SIFT_SQLITE_PATH") {
            self.storage.sqlite_path = v;
        }
        if let Ok(v) = std::env::var("SIFT_VECTOR_BACKEND") {
            match v.to_ascii_lowercase().as_str() {
                "qdrant" => self.storage.vector_backend = VectorBackend::Qdrant,
                "memory" => self.storage.vector_backend = VectorBackend::Memory,
                _ => tracing::warn!("ignoring invalid SIFT_VECTOR_BACKEND value: {v}"),
            }
        }
        if let Ok(v) = std::env::var("SIFT_QDRANT_URL") {
            self.storage.qdrant_url = v;
        }
        if let Ok(v) = std::env::var("SIFT_COLLECTION") {
            self.storage.collection = v;
        }
        if let Ok(v) = std::env::var("SIFT_EMBEDDING_BASE_URL") {
            self.embedding.base_url = v;
        }
        if let Ok(v) = std::env::var("SIFT_EMBEDDING_MODEL") {
            self.embedding.model = v;
        }
        if let Ok(v) = std::env::var("SIFT_EMBEDDING_API_KEY") {
            self.embedding.api_key = Some(v);
        }
        if let Ok(v) = std::env::var("SIFT_EMBEDDING_BATCH_SIZE")
            && let Ok(n) = v.parse::<usize>()
        {
            self.embedding.batch_size = n;
        }
        if let Ok(v) = std::env::var("SIFT_RERANK_ENABLED")
            && let Ok(enabled) = v.parse::<bool>()
        {
            self.rerank.enabled = enabled;
        }
        if let Ok(v) = std::env::var("SIFT_RERANK_BASE_URL") {
            self.rerank.base_url = v;
        }
        if let Ok(v) = std::env::var("SIFT_RERANK_MODEL") {
            self.rerank.model = v;
        }
        if let Ok(v) = std::env::var("SIFT_RERANK_API_KEY") {
            self.rerank.api_key = Some(v);
        }
        if let Ok(v) = std::env::var("SIFT_INDEXER_WORKERS")
            && let Ok(n) = v.parse::<usize>()
        {
            self.indexer.workers = n;
        }
        if let Ok(v) = std::env::var("SIFT_EMBED_CONCURRENCY")
            && let Ok(n) = v.parse::<usize>()
        {
            self.indexer.embed_concurrency = n;
        }
        if let Ok(v) = std::env::var("SIFT_MAX_FILE_BYTES")
            && let Ok(n) = v.parse::<u64>()
        {
            self.indexer.max_file_bytes = n;
        }
        if let Ok(v) = std::env::var("SIFT_SEARCH_ALPHA")
            && let Ok(alpha) = v.parse::<f32>()
        {
            self.search.default_alpha = alpha;
        }
    }

    /// Reject values the index cannot work with.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid value.
    pub fn validate(&self) -> anyhow::Result<()> {
        let alpha = self.search.default_alpha;
        if !alpha.is_finite() || !(0.0..=1.0).contains(&alpha) {
            anyhow::bail!("search.default_alpha must be within [0, 1], got {alpha}");
        }
        if self.indexer.workers == 0 || self.indexer.embed_concurrency == 0 {
            anyhow::bail!("indexer.workers and indexer.embed_concurrency must be at least 1");
        }
        if self.embedding.batch_size == 0 {
            anyhow::bail!("embedding.batch_size must be at least 1");
        }
        if self.chunker.window_lines == 0 || self.chunker.max_chunk_chars == 0 {
            anyhow::bail!("chunker.window_lines and chunker.max_chunk_chars must be at least 1");
        }
        if self.search.oversample == 0 {
            anyhow::bail!("search.oversample must be at least 1");
        }
        Ok(())
    }

    #[must_use]
    pub fn index_config(&self) -> IndexConfig {
        IndexConfig {
            chunker: self.chunker.clone(),
            indexer: IndexerConfig {
                embed_batch_size: self.embedding.batch_size,
                ..self.indexer.clone()
            },
            search: self.search.clone(),
            collection: self.storage.collection.clone(),
        }
    }
}

/// `--config` flag, then `SIFT_CONFIG`, then `config/sift.toml`.
#[must_use]
pub fn resolve_config_path(flag: Option<&Path>) -> PathBuf {
    if let Some(path) = flag {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var("SIFT_CONFIG") {
        return PathBuf::from(path);
    }
    PathBuf::from(DEFAULT_CONFIG_PATH)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serial_test::serial;

    use super::*;

    const ENV_KEYS: [&str; 17] = [
        "SIFT_CONFIG",
        "SIFT_SQLITE_PATH",
        "SIFT_VECTOR_BACKEND",
        "SIFT_QDRANT_URL",
        "SIFT_COLLECTION",
        "SIFT_EMBEDDING_BASE_URL",
        "SIFT_EMBEDDING_MODEL",
        "SIFT_EMBEDDING_API_KEY",
        "SIFT_EMBEDDING_BATCH_SIZE",
        "SIFT_RERANK_ENABLED",
        "SIFT_RERANK_BASE_URL",
        "SIFT_RERANK_MODEL",
        "SIFT_RERANK_API_KEY",
        "SIFT_INDEXER_WORKERS",
        "SIFT_EMBED_CONCURRENCY",
        "SIFT_MAX_FILE_BYTES",
        "SIFT_SEARCH_ALPHA",
    ];

    fn clear_env() {
        for key in ENV_KEYS {
            unsafe { std::env::remove_var(key) };
        }
    }

    #[test]
    #[serial]
    fn defaults_when_file_missing() {
        clear_env();
        let config = Config::load(Path::new("/nonexistent/sift.toml")).unwrap();
        assert_eq!(config.storage.vector_backend, VectorBackend::Qdrant);
        assert_eq!(config.storage.collection, "sift_code_chunks");
        assert!(!config.rerank.enabled);
        assert_eq!(config.chunker.max_chunk_chars, 8000);
        assert_eq!(config.indexer.workers, 4);
        assert!((config.search.k1 - 1.2).abs() < f64::EPSILON);
        assert_eq!(config.search.oversample, 3);
        config.validate().unwrap();
    }

    #[test]
    #[serial]
    fn parse_partial_toml() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sift.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        write!(
            f,
            r#"
[storage]
vector_backend = "memory"

[embedding]
model = "bge-small"
batch_size = 8

[indexer]
workers = 8

[search]
default_alpha = 0.7
rerank_candidates = 20
"#
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.storage.vector_backend, VectorBackend::Memory);
        assert_eq!(config.storage.sqlite_path, "./data/sift.db");
        assert_eq!(config.embedding.model, "bge-small");
        assert_eq!(config.indexer.workers, 8);
        assert_eq!(config.indexer.embed_concurrency, 4);
        assert_eq!(config.search.rerank_candidates, 20);

        let index = config.index_config();
        assert_eq!(index.indexer.workers, 8);
        assert_eq!(index.indexer.embed_batch_size, 8);
        assert!((index.search.default_alpha - 0.7).abs() < f32::EPSILON);
    }

    #[test]
    #[serial]
    fn shipped_config_matches_defaults() {
        clear_env();
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join(DEFAULT_CONFIG_PATH);
        let config = Config::load(&path).unwrap();
        config.validate().unwrap();
        let defaults = Config::default();
        assert_eq!(config.storage.collection, defaults.storage.collection);
        assert_eq!(config.embedding.model, defaults.embedding.model);
        assert_eq!(config.embedding.batch_size, defaults.embedding.batch_size);
        assert_eq!(config.chunker.window_lines, defaults.chunker.window_lines);
        assert_eq!(config.indexer.upsert_batch, defaults.indexer.upsert_batch);
        assert_eq!(config.search.max_edges_per_hop, defaults.search.max_edges_per_hop);
    }

    #[test]
    #[serial]
    fn invalid_toml_is_an_error() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sift.toml");
        std::fs::write(&path, "[storage\nsqlite_path = 1").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    #[serial]
    fn env_overrides() {
        clear_env();
        let mut config = Config::default();
        unsafe {
            std::env::set_var("SIFT_SQLITE_PATH", "/tmp/other.db");
            std::env::set_var("SIFT_VECTOR_BACKEND", "Memory");
            std::env::set_var("SIFT_RERANK_ENABLED", "true");
            std::env::set_var("SIFT_INDEXER_WORKERS", "2");
            std::env::set_var("SIFT_SEARCH_ALPHA", "0.25");
            std::env::set_var("SIFT_EMBEDDING_BATCH_SIZE", "32");
        }
        config.apply_env_overrides();
        clear_env();

        assert_eq!(config.storage.sqlite_path, "/tmp/other.db");
        assert_eq!(config.storage.vector_backend, VectorBackend::Memory);
        assert!(config.rerank.enabled);
        assert_eq!(config.indexer.workers, 2);
        assert!((config.search.default_alpha - 0.25).abs() < f32::EPSILON);
        assert_eq!(config.embedding.batch_size, 32);
    }

    #[test]
    #[serial]
    fn invalid_env_values_are_ignored() {
        clear_env();
        let mut config = Config::default();
        unsafe {
            std::env::set_var("SIFT_VECTOR_BACKEND", "faiss");
            std::env::set_var("SIFT_INDEXER_WORKERS", "many");
        }
        config.apply_env_overrides();
        clear_env();
        assert_eq!(config.storage.vector_backend, VectorBackend::Qdrant);
        assert_eq!(config.indexer.workers, 4);
    }

    #[test]
    fn validate_rejects_out_of_range_alpha() {
        let mut config = Config::default();
        config.search.default_alpha = 1.5;
        assert!(config.validate().is_err());
        config.search.default_alpha = 0.5;
        config.indexer.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn config_path_resolution() {
        clear_env();
        assert_eq!(
            resolve_config_path(Some(Path::new("custom.toml"))),
            PathBuf::from("custom.toml")
        );
        assert_eq!(resolve_config_path(None), PathBuf::from(DEFAULT_CONFIG_PATH));
        unsafe { std::env::set_var("SIFT_CONFIG", "/etc/sift.toml") };
        assert_eq!(resolve_config_path(None), PathBuf::from("/etc/sift.toml"));
        clear_env();
    }
}
