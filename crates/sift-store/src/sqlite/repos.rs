use serde::Serialize;

use super::SqliteStore;
use crate::error::StoreError;
use crate::types::{PartitionKey, RepoId, Snapshot};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotInfo {
    pub snapshot: Snapshot,
    pub created_at: String,
    pub indexed_at: String,
    pub files: u64,
}

impl SqliteStore {
    /// Record a repository root. No-op if already known.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn register_repository(&self, repo: &RepoId, root: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT OR IGNORE INTO repositories (repo_id, root) VALUES (?, ?)")
            .bind(repo.as_str())
            .bind(root)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Create the snapshot row on first use and bump its `indexed_at` afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the upsert fails.
    pub async fn touch_snapshot(&self, key: &PartitionKey) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO snapshots (repo_id, snapshot) VALUES (?, ?) \
             ON CONFLICT(repo_id, snapshot) DO UPDATE SET indexed_at = datetime('now')",
        )
        .bind(key.repo.as_str())
        .bind(key.snapshot.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn snapshot_exists(&self, key: &PartitionKey) -> Result<bool, StoreError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM snapshots WHERE repo_id = ? AND snapshot = ?")
                .bind(key.repo.as_str())
                .bind(key.snapshot.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    /// Indexed snapshots of a repository, most recently indexed first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn list_snapshots(&self, repo: &RepoId) -> Result<Vec<SnapshotInfo>, StoreError> {
        let rows: Vec<(String, String, String, i64)> = sqlx::query_as(
            "SELECT s.snapshot, s.created_at, s.indexed_at, \
                    (SELECT COUNT(*) FROM files f \
                      WHERE f.repo_id = s.repo_id AND f.snapshot = s.snapshot) \
             FROM snapshots s WHERE s.repo_id = ? \
             ORDER BY s.indexed_at DESC, s.snapshot",
        )
        .bind(repo.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(snapshot, created_at, indexed_at, files)| {
                Ok(SnapshotInfo {
                    snapshot: Snapshot::parse(&snapshot),
                    created_at,
                    indexed_at,
                    files: u64::try_from(files)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{key, memory_store};
    use super::*;

    #[tokio::test]
    async fn touch_snapshot_creates_once() {
        let store = memory_store().await;
        let k = key(Snapshot::WorkingTree);
        assert!(!store.snapshot_exists(&k).await.unwrap());

        store.touch_snapshot(&k).await.unwrap();
        store.touch_snapshot(&k).await.unwrap();

        assert!(store.snapshot_exists(&k).await.unwrap());
        let listed = store.list_snapshots(&k.repo).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].snapshot, Snapshot::WorkingTree);
        assert_eq!(listed[0].files, 0);
    }

    #[tokio::test]
    async fn snapshots_are_per_repository() {
        let store = memory_store().await;
        store
            .register_repository(&RepoId::from_raw("other"), "/srv/other")
            .await
            .unwrap();
        store.touch_snapshot(&key(Snapshot::WorkingTree)).await.unwrap();
        store
            .touch_snapshot(&key(Snapshot::Commit("abc".into())))
            .await
            .unwrap();

        assert_eq!(
            store.list_snapshots(&RepoId::from_raw("repo")).await.unwrap().len(),
            2
        );
        assert!(
            store
                .list_snapshots(&RepoId::from_raw("other"))
                .await
                .unwrap()
                .is_empty()
        );
    }
}
