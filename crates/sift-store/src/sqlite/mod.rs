mod chunks;
mod files;
mod pending;
mod postings;
mod repos;
mod stats;
mod symbols;

use std::str::FromStr;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use crate::error::StoreError;

pub use files::{ChunkEntry, FileGeneration};
pub use postings::LexicalDoc;
pub use repos::SnapshotInfo;
pub use stats::PartitionStats;
pub use symbols::{LocatedSymbol, SymbolFilter};

/// Metadata store for file records, chunk generations, lexical postings, symbols and
/// call edges. Cheap to clone: clones share one pool.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the `SQLite` database and run migrations.
    ///
    /// `":memory:"` opens a private in-memory database held by a single long-lived
    /// connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrations fail.
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        let in_memory = path == ":memory:";
        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let mut opts = SqliteConnectOptions::from_str(&url)?
            .create_if_missing(true)
            .foreign_keys(true);
        if !in_memory {
            opts = opts
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
        }

        let pool = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(opts)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(opts)
                .await?
        };

        Self::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    /// Expose the underlying pool for shared access.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run all migrations on the given pool.
    ///
    /// # Errors
    ///
    /// Returns an error if any migration fails.
    pub async fn run_migrations(pool: &SqlitePool) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(pool).await?;
        Ok(())
    }
}

pub(crate) fn line_from_db(value: i64) -> Result<u32, StoreError> {
    Ok(u32::try_from(value)?)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::{
        CallEdge, Callee, Chunk, ChunkId, ChunkKind, FileRecord, FileStatus, NameRef, PartitionKey,
        RepoId, Snapshot, Symbol, SymbolId, SymbolKind,
    };
    use tempfile::NamedTempFile;

    pub(crate) fn key(snapshot: Snapshot) -> PartitionKey {
        PartitionKey::new(RepoId::from_raw("repo"), snapshot)
    }

    pub(crate) async fn memory_store() -> SqliteStore {
        let store = SqliteStore::new(":memory:").await.unwrap();
        store
            .register_repository(&RepoId::from_raw("repo"), "/srv/repo")
            .await
            .unwrap();
        store
    }

    pub(crate) fn chunk(key: &PartitionKey, path: &str, start: u32, end: u32, text: &str) -> Chunk {
        let hash = blake3::hash(text.as_bytes()).to_hex().to_string();
        Chunk {
            id: ChunkId::derive(key, path, start, end, &hash),
            file_path: path.into(),
            language: "python".into(),
            kind: ChunkKind::Function,
            start_line: start,
            end_line: end,
            text: text.into(),
            content_hash: hash,
            symbol_name: None,
        }
    }

    pub(crate) fn symbol(key: &PartitionKey, path: &str, name: &str, line: u32, chunk: &Chunk) -> Symbol {
        Symbol {
            id: SymbolId::derive(key, path, name, SymbolKind::Function, line, line),
            name: name.into(),
            qualname: name.into(),
            kind: SymbolKind::Function,
            file_path: path.into(),
            language: "python".into(),
            start_line: line,
            end_line: line,
            parent: None,
            chunk_id: chunk.id.clone(),
        }
    }

    pub(crate) fn edge(caller: &Symbol, callee: &str, line: u32) -> CallEdge {
        CallEdge {
            caller: caller.id.clone(),
            callee_name: callee.into(),
            callee: Callee::Unresolved {
                name: callee.into(),
            },
            chunk_id: caller.chunk_id.clone(),
            file_path: caller.file_path.clone(),
            line,
        }
    }

    /// One-function file: `def <name>(): <body>`.
    pub(crate) fn generation(
        key: &PartitionKey,
        path: &str,
        name: &str,
        calls: &[&str],
    ) -> FileGeneration {
        let text = format!("def {name}(): {}", calls.join("; "));
        let mut c = chunk(key, path, 1, 1, &text);
        c.symbol_name = Some(name.to_owned());
        let s = symbol(key, path, name, 1, &c);
        let edges = calls.iter().map(|callee| edge(&s, callee, 1)).collect();
        let name_refs = calls
            .iter()
            .map(|callee| NameRef {
                name: callee.rsplit('.').next().unwrap_or(callee).to_owned(),
                file_path: path.into(),
                line: 1,
                column: 0,
                context: text.clone(),
            })
            .collect();
        FileGeneration {
            record: FileRecord {
                path: path.into(),
                content_hash: blake3::hash(text.as_bytes()).to_hex().to_string(),
                size: text.len() as u64,
                language: "python".into(),
                status: FileStatus::Indexed,
                indexed_at: String::new(),
            },
            chunks: vec![ChunkEntry {
                terms: vec![("def".into(), 1), (name.to_owned(), 1)],
                token_count: 2,
                embed_error: None,
                chunk: c,
            }],
            symbols: vec![s],
            edges,
            name_refs,
        }
    }

    #[tokio::test]
    async fn wal_journal_mode_enabled_on_file_db() {
        let file = NamedTempFile::new().expect("tempfile");
        let path = file.path().to_str().expect("valid path");

        let store = SqliteStore::new(path).await.expect("SqliteStore::new");

        let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(store.pool())
            .await
            .expect("PRAGMA query");

        assert_eq!(mode, "wal", "expected WAL journal mode, got: {mode}");
    }

    #[tokio::test]
    async fn in_memory_store_survives_multiple_queries() {
        let store = memory_store().await;
        for _ in 0..3 {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM repositories")
                .fetch_one(store.pool())
                .await
                .unwrap();
            assert_eq!(count, 1);
        }
    }
}
