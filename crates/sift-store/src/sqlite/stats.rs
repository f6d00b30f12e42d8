use serde::Serialize;

use super::SqliteStore;
use crate::error::StoreError;
use crate::types::PartitionKey;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PartitionStats {
    pub files: u64,
    pub partial_files: u64,
    pub chunks: u64,
    pub chunks_without_vectors: u64,
    pub symbols: u64,
    pub call_edges: u64,
    pub resolved_edges: u64,
    pub name_refs: u64,
    /// Vector deletions still queued after failing.
    pub pending_vector_deletes: u64,
    pub indexed_at: Option<String>,
}

impl SqliteStore {
    /// Row counts for one partition.
    ///
    /// # Errors
    ///
    /// Returns an error if any count query fails.
    pub async fn partition_stats(&self, key: &PartitionKey) -> Result<PartitionStats, StoreError> {
        let files = self
            .count(key, "SELECT COUNT(*) FROM files WHERE repo_id = ? AND snapshot = ?")
            .await?;
        let partial_files = self
            .count(
                key,
                "SELECT COUNT(*) FROM files \
                 WHERE repo_id = ? AND snapshot = ? AND status = 'partial'",
            )
            .await?;
        let chunks = self
            .count(key, "SELECT COUNT(*) FROM chunks WHERE repo_id = ? AND snapshot = ?")
            .await?;
        let chunks_without_vectors = self
            .count(
                key,
                "SELECT COUNT(*) FROM chunks \
                 WHERE repo_id = ? AND snapshot = ? AND embed_error IS NOT NULL",
            )
            .await?;
        let symbols = self
            .count(key, "SELECT COUNT(*) FROM symbols WHERE repo_id = ? AND snapshot = ?")
            .await?;
        let call_edges = self
            .count(key, "SELECT COUNT(*) FROM call_edges WHERE repo_id = ? AND snapshot = ?")
            .await?;
        let resolved_edges = self
            .count(
                key,
                "SELECT COUNT(*) FROM call_edges \
                 WHERE repo_id = ? AND snapshot = ? AND callee_id IS NOT NULL",
            )
            .await?;
        let name_refs = self
            .count(key, "SELECT COUNT(*) FROM name_refs WHERE repo_id = ? AND snapshot = ?")
            .await?;
        let pending_vector_deletes = self
            .count(
                key,
                "SELECT COUNT(*) FROM pending_vector_deletes WHERE repo_id = ? AND snapshot = ?",
            )
            .await?;

        let indexed_at: Option<String> = sqlx::query_scalar(
            "SELECT indexed_at FROM snapshots WHERE repo_id = ? AND snapshot = ?",
        )
        .bind(key.repo.as_str())
        .bind(key.snapshot.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(PartitionStats {
            files,
            partial_files,
            chunks,
            chunks_without_vectors,
            symbols,
            call_edges,
            resolved_edges,
            name_refs,
            pending_vector_deletes,
            indexed_at,
        })
    }

    async fn count(&self, key: &PartitionKey, sql: &str) -> Result<u64, StoreError> {
        let n: i64 = sqlx::query_scalar(sql)
            .bind(key.repo.as_str())
            .bind(key.snapshot.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(n)?)
    }
}
