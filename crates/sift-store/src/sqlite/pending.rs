use super::SqliteStore;
use crate::error::StoreError;
use crate::types::{ChunkId, PartitionKey};

impl SqliteStore {
    /// Remember vectors whose deletion failed so a later refresh can retry it.
    ///
    /// # Errors
    ///
    /// Returns an error if any insert fails; the transaction is rolled back.
    pub async fn queue_vector_deletes(
        &self,
        key: &PartitionKey,
        ids: &[ChunkId],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query(
                "INSERT OR IGNORE INTO pending_vector_deletes (repo_id, snapshot, chunk_id) \
                 VALUES (?, ?, ?)",
            )
            .bind(key.repo.as_str())
            .bind(key.snapshot.as_str())
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Queued vector deletions of a partition, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn pending_vector_deletes(
        &self,
        key: &PartitionKey,
    ) -> Result<Vec<ChunkId>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT chunk_id FROM pending_vector_deletes \
             WHERE repo_id = ? AND snapshot = ? ORDER BY queued_at, chunk_id",
        )
        .bind(key.repo.as_str())
        .bind(key.snapshot.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| ChunkId::from_raw(id)).collect())
    }

    /// Drop queued deletions that have gone through.
    ///
    /// # Errors
    ///
    /// Returns an error if any delete fails; the transaction is rolled back.
    pub async fn clear_vector_deletes(
        &self,
        key: &PartitionKey,
        ids: &[ChunkId],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query(
                "DELETE FROM pending_vector_deletes \
                 WHERE repo_id = ? AND snapshot = ? AND chunk_id = ?",
            )
            .bind(key.repo.as_str())
            .bind(key.snapshot.as_str())
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
