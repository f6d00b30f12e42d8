use std::collections::HashMap;

use super::{SqliteStore, line_from_db};
use crate::error::StoreError;
use crate::types::{ChunkId, ChunkKind, PartitionKey};

/// Persisted lexical entry of one chunk, used to rebuild the in-memory index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexicalDoc {
    pub chunk_id: ChunkId,
    pub file_path: String,
    pub language: String,
    pub kind: ChunkKind,
    pub symbol_name: Option<String>,
    pub token_count: u32,
    pub terms: Vec<(String, u32)>,
}

impl SqliteStore {
    /// Every chunk of a partition with its postings, ordered by chunk id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is malformed.
    pub async fn lexical_docs(&self, key: &PartitionKey) -> Result<Vec<LexicalDoc>, StoreError> {
        let chunks: Vec<(String, String, String, String, Option<String>, i64)> = sqlx::query_as(
            "SELECT chunk_id, file_path, language, kind, symbol_name, token_count FROM chunks \
             WHERE repo_id = ? AND snapshot = ? ORDER BY chunk_id",
        )
        .bind(key.repo.as_str())
        .bind(key.snapshot.as_str())
        .fetch_all(&self.pool)
        .await?;

        let postings: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT p.chunk_id, p.term, p.tf FROM lexical_postings p \
             JOIN chunks c ON c.chunk_id = p.chunk_id \
             WHERE c.repo_id = ? AND c.snapshot = ? ORDER BY p.chunk_id, p.term",
        )
        .bind(key.repo.as_str())
        .bind(key.snapshot.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut terms: HashMap<String, Vec<(String, u32)>> = HashMap::new();
        for (chunk_id, term, tf) in postings {
            terms
                .entry(chunk_id)
                .or_default()
                .push((term, line_from_db(tf)?));
        }

        chunks
            .into_iter()
            .map(|(chunk_id, file_path, language, kind, symbol_name, token_count)| {
                Ok(LexicalDoc {
                    terms: terms.remove(&chunk_id).unwrap_or_default(),
                    chunk_id: ChunkId::from_raw(chunk_id),
                    file_path,
                    language,
                    kind: kind.parse()?,
                    symbol_name,
                    token_count: line_from_db(token_count)?,
                })
            })
            .collect()
    }
}
