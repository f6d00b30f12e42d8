use std::collections::HashMap;

use sqlx::SqliteConnection;

use super::SqliteStore;
use crate::error::StoreError;
use crate::types::{CallEdge, Callee, Chunk, ChunkId, FileRecord, NameRef, PartitionKey, Symbol};

/// One chunk of a new file generation together with its lexical postings.
#[derive(Debug, Clone)]
pub struct ChunkEntry {
    pub chunk: Chunk,
    /// `(term, term frequency)` pairs.
    pub terms: Vec<(String, u32)>,
    pub token_count: u32,
    /// Set when the chunk could not be embedded or upserted.
    pub embed_error: Option<String>,
}

/// Everything derived from one version of one file.
#[derive(Debug, Clone)]
pub struct FileGeneration {
    pub record: FileRecord,
    pub chunks: Vec<ChunkEntry>,
    pub symbols: Vec<Symbol>,
    pub edges: Vec<CallEdge>,
    pub name_refs: Vec<NameRef>,
}

type FileRow = (String, String, i64, String, String, String);

impl SqliteStore {
    /// All file records of a partition keyed by relative path.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is malformed.
    pub async fn file_records(
        &self,
        key: &PartitionKey,
    ) -> Result<HashMap<String, FileRecord>, StoreError> {
        let rows: Vec<FileRow> = sqlx::query_as(
            "SELECT file_path, content_hash, size, language, status, indexed_at \
             FROM files WHERE repo_id = ? AND snapshot = ?",
        )
        .bind(key.repo.as_str())
        .bind(key.snapshot.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(path, content_hash, size, language, status, indexed_at)| {
                Ok((
                    path.clone(),
                    FileRecord {
                        path,
                        content_hash,
                        size: u64::try_from(size)?,
                        language,
                        status: status.parse()?,
                        indexed_at,
                    },
                ))
            })
            .collect()
    }

    /// Identifiers of the chunk generation currently stored for a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn chunk_ids_for_file(
        &self,
        key: &PartitionKey,
        path: &str,
    ) -> Result<Vec<ChunkId>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT chunk_id FROM chunks \
             WHERE repo_id = ? AND snapshot = ? AND file_path = ? ORDER BY start_line",
        )
        .bind(key.repo.as_str())
        .bind(key.snapshot.as_str())
        .bind(path)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| ChunkId::from_raw(id)).collect())
    }

    /// Replace a file's chunk generation, postings, symbols, call edges, name references and
    /// record in one transaction. Readers see either the old generation or the new one.
    ///
    /// # Errors
    ///
    /// Returns an error if any statement fails; the transaction is rolled back.
    pub async fn replace_file(
        &self,
        key: &PartitionKey,
        generation: &FileGeneration,
    ) -> Result<(), StoreError> {
        let path = generation.record.path.as_str();
        let mut tx = self.pool.begin().await?;

        delete_file_rows(&mut *tx, key, path).await?;

        for entry in &generation.chunks {
            insert_chunk(&mut *tx, key, entry).await?;
        }
        for symbol in &generation.symbols {
            insert_symbol(&mut *tx, key, symbol).await?;
        }
        for edge in &generation.edges {
            insert_edge(&mut *tx, key, edge).await?;
        }
        for name_ref in &generation.name_refs {
            insert_name_ref(&mut *tx, key, name_ref).await?;
        }

        let record = &generation.record;
        sqlx::query(
            "INSERT INTO files (repo_id, snapshot, file_path, content_hash, size, language, status) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(repo_id, snapshot, file_path) DO UPDATE SET \
               content_hash = excluded.content_hash, size = excluded.size, \
               language = excluded.language, status = excluded.status, \
               indexed_at = datetime('now')",
        )
        .bind(key.repo.as_str())
        .bind(key.snapshot.as_str())
        .bind(path)
        .bind(&record.content_hash)
        .bind(i64::try_from(record.size)?)
        .bind(&record.language)
        .bind(record.status.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Delete everything stored for a file and return the chunk ids that were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if any statement fails; the transaction is rolled back.
    pub async fn remove_file(
        &self,
        key: &PartitionKey,
        path: &str,
    ) -> Result<Vec<ChunkId>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT chunk_id FROM chunks WHERE repo_id = ? AND snapshot = ? AND file_path = ?",
        )
        .bind(key.repo.as_str())
        .bind(key.snapshot.as_str())
        .bind(path)
        .fetch_all(&mut *tx)
        .await?;

        delete_file_rows(&mut *tx, key, path).await?;
        sqlx::query("DELETE FROM files WHERE repo_id = ? AND snapshot = ? AND file_path = ?")
            .bind(key.repo.as_str())
            .bind(key.snapshot.as_str())
            .bind(path)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(rows.into_iter().map(|(id,)| ChunkId::from_raw(id)).collect())
    }
}

async fn delete_file_rows(
    conn: &mut SqliteConnection,
    key: &PartitionKey,
    path: &str,
) -> Result<(), StoreError> {
    sqlx::query(
        "DELETE FROM lexical_postings WHERE chunk_id IN \
         (SELECT chunk_id FROM chunks WHERE repo_id = ? AND snapshot = ? AND file_path = ?)",
    )
    .bind(key.repo.as_str())
    .bind(key.snapshot.as_str())
    .bind(path)
    .execute(&mut *conn)
    .await?;

    for table in ["chunks", "symbols", "call_edges", "name_refs"] {
        sqlx::query(&format!(
            "DELETE FROM {table} WHERE repo_id = ? AND snapshot = ? AND file_path = ?"
        ))
        .bind(key.repo.as_str())
        .bind(key.snapshot.as_str())
        .bind(path)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn insert_chunk(
    conn: &mut SqliteConnection,
    key: &PartitionKey,
    entry: &ChunkEntry,
) -> Result<(), StoreError> {
    let chunk = &entry.chunk;
    sqlx::query(
        "INSERT INTO chunks (chunk_id, repo_id, snapshot, file_path, language, kind, symbol_name, \
                             start_line, end_line, content_hash, text, token_count, embed_error) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(chunk.id.as_str())
    .bind(key.repo.as_str())
    .bind(key.snapshot.as_str())
    .bind(&chunk.file_path)
    .bind(&chunk.language)
    .bind(chunk.kind.as_str())
    .bind(chunk.symbol_name.as_deref())
    .bind(i64::from(chunk.start_line))
    .bind(i64::from(chunk.end_line))
    .bind(&chunk.content_hash)
    .bind(&chunk.text)
    .bind(i64::from(entry.token_count))
    .bind(entry.embed_error.as_deref())
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        "DELETE FROM pending_vector_deletes WHERE repo_id = ? AND snapshot = ? AND chunk_id = ?",
    )
    .bind(key.repo.as_str())
    .bind(key.snapshot.as_str())
    .bind(chunk.id.as_str())
    .execute(&mut *conn)
    .await?;

    for (term, tf) in &entry.terms {
        sqlx::query("INSERT INTO lexical_postings (chunk_id, term, tf) VALUES (?, ?, ?)")
            .bind(chunk.id.as_str())
            .bind(term)
            .bind(i64::from(*tf))
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn insert_symbol(
    conn: &mut SqliteConnection,
    key: &PartitionKey,
    symbol: &Symbol,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO symbols (symbol_id, repo_id, snapshot, file_path, name, qualname, kind, \
                              language, start_line, end_line, parent_id, chunk_id) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(symbol.id.as_str())
    .bind(key.repo.as_str())
    .bind(key.snapshot.as_str())
    .bind(&symbol.file_path)
    .bind(&symbol.name)
    .bind(&symbol.qualname)
    .bind(symbol.kind.as_str())
    .bind(&symbol.language)
    .bind(i64::from(symbol.start_line))
    .bind(i64::from(symbol.end_line))
    .bind(symbol.parent.as_ref().map(|p| p.as_str().to_owned()))
    .bind(symbol.chunk_id.as_str())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_edge(
    conn: &mut SqliteConnection,
    key: &PartitionKey,
    edge: &CallEdge,
) -> Result<(), StoreError> {
    let callee_id = match &edge.callee {
        Callee::Resolved { symbol_id } => Some(symbol_id.as_str().to_owned()),
        Callee::Unresolved { .. } => None,
    };
    sqlx::query(
        "INSERT INTO call_edges (repo_id, snapshot, file_path, caller_id, callee_name, \
                                 callee_base, callee_id, chunk_id, line) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(key.repo.as_str())
    .bind(key.snapshot.as_str())
    .bind(&edge.file_path)
    .bind(edge.caller.as_str())
    .bind(&edge.callee_name)
    .bind(edge.callee_base())
    .bind(callee_id)
    .bind(edge.chunk_id.as_str())
    .bind(i64::from(edge.line))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_name_ref(
    conn: &mut SqliteConnection,
    key: &PartitionKey,
    name_ref: &NameRef,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO name_refs (repo_id, snapshot, file_path, name, line, col, context) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(key.repo.as_str())
    .bind(key.snapshot.as_str())
    .bind(&name_ref.file_path)
    .bind(&name_ref.name)
    .bind(i64::from(name_ref.line))
    .bind(i64::from(name_ref.column))
    .bind(&name_ref.context)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::tests::{generation, key, memory_store};
    use crate::types::{FileStatus, Snapshot};

    #[tokio::test]
    async fn replace_then_read_back() {
        let store = memory_store().await;
        let k = key(Snapshot::WorkingTree);
        let g = generation(&k, "auth.py", "login", &[]);

        store.replace_file(&k, &g).await.unwrap();

        let records = store.file_records(&k).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records["auth.py"].content_hash, g.record.content_hash);
        assert_eq!(records["auth.py"].status, FileStatus::Indexed);
        assert!(!records["auth.py"].indexed_at.is_empty());

        let ids = store.chunk_ids_for_file(&k, "auth.py").await.unwrap();
        assert_eq!(ids, vec![g.chunks[0].chunk.id.clone()]);
    }

    #[tokio::test]
    async fn replace_supersedes_previous_generation() {
        let store = memory_store().await;
        let k = key(Snapshot::WorkingTree);
        let old = generation(&k, "auth.py", "login", &["check"]);
        let new = generation(&k, "auth.py", "logout", &[]);

        store.replace_file(&k, &old).await.unwrap();
        store.replace_file(&k, &new).await.unwrap();

        let ids = store.chunk_ids_for_file(&k, "auth.py").await.unwrap();
        assert_eq!(ids, vec![new.chunks[0].chunk.id.clone()]);

        let postings: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM lexical_postings")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(postings, 2);
        let edges: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM call_edges")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(edges, 0);
        let refs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM name_refs")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(refs, 0);
    }

    #[tokio::test]
    async fn remove_file_returns_old_chunk_ids() {
        let store = memory_store().await;
        let k = key(Snapshot::WorkingTree);
        let g = generation(&k, "auth.py", "login", &[]);
        store.replace_file(&k, &g).await.unwrap();

        let removed = store.remove_file(&k, "auth.py").await.unwrap();
        assert_eq!(removed, vec![g.chunks[0].chunk.id.clone()]);
        assert!(store.file_records(&k).await.unwrap().is_empty());
        assert!(store.chunk_ids_for_file(&k, "auth.py").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn partitions_do_not_share_files() {
        let store = memory_store().await;
        let wt = key(Snapshot::WorkingTree);
        let commit = key(Snapshot::Commit("abc".into()));
        store
            .replace_file(&wt, &generation(&wt, "auth.py", "login", &[]))
            .await
            .unwrap();

        assert!(store.file_records(&commit).await.unwrap().is_empty());
        assert!(store.remove_file(&commit, "auth.py").await.unwrap().is_empty());
        assert_eq!(store.file_records(&wt).await.unwrap().len(), 1);
    }
}
