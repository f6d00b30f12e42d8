use super::{SqliteStore, line_from_db};
use crate::error::StoreError;
use crate::types::{Chunk, ChunkId, PartitionKey};

type ChunkRow = (
    String,
    String,
    String,
    String,
    Option<String>,
    i64,
    i64,
    String,
    String,
);

const CHUNK_COLUMNS: &str = "chunk_id, file_path, language, kind, symbol_name, start_line, \
                             end_line, content_hash, text";

/// `SQLite` caps bound parameters per statement; stay well below it.
const ID_BATCH: usize = 400;

fn chunk_from_row(row: ChunkRow) -> Result<Chunk, StoreError> {
    let (id, file_path, language, kind, symbol_name, start, end, content_hash, text) = row;
    Ok(Chunk {
        id: ChunkId::from_raw(id),
        file_path,
        language,
        kind: kind.parse()?,
        start_line: line_from_db(start)?,
        end_line: line_from_db(end)?,
        text,
        content_hash,
        symbol_name,
    })
}

impl SqliteStore {
    /// Load the chunks with the given ids from one partition. Unknown ids are skipped;
    /// the result order is unspecified.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is malformed.
    pub async fn chunks_by_ids(
        &self,
        key: &PartitionKey,
        ids: &[ChunkId],
    ) -> Result<Vec<Chunk>, StoreError> {
        let mut chunks = Vec::with_capacity(ids.len());
        for batch in ids.chunks(ID_BATCH) {
            let placeholders = vec!["?"; batch.len()].join(", ");
            let sql = format!(
                "SELECT {CHUNK_COLUMNS} FROM chunks \
                 WHERE repo_id = ? AND snapshot = ? AND chunk_id IN ({placeholders})"
            );
            let mut query = sqlx::query_as::<_, ChunkRow>(&sql)
                .bind(key.repo.as_str())
                .bind(key.snapshot.as_str());
            for id in batch {
                query = query.bind(id.as_str());
            }
            for row in query.fetch_all(&self.pool).await? {
                chunks.push(chunk_from_row(row)?);
            }
        }
        Ok(chunks)
    }

    /// Chunks of one file ordered by start line.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is malformed.
    pub async fn chunks_for_file(
        &self,
        key: &PartitionKey,
        path: &str,
    ) -> Result<Vec<Chunk>, StoreError> {
        let sql = format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks \
             WHERE repo_id = ? AND snapshot = ? AND file_path = ? ORDER BY start_line, end_line"
        );
        let rows: Vec<ChunkRow> = sqlx::query_as(&sql)
            .bind(key.repo.as_str())
            .bind(key.snapshot.as_str())
            .bind(path)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(chunk_from_row).collect()
    }

    /// Ids of chunks whose embedding or upsert failed in the last refresh.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn failed_chunks(
        &self,
        key: &PartitionKey,
    ) -> Result<Vec<(ChunkId, String)>, StoreError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT chunk_id, embed_error FROM chunks \
             WHERE repo_id = ? AND snapshot = ? AND embed_error IS NOT NULL ORDER BY chunk_id",
        )
        .bind(key.repo.as_str())
        .bind(key.snapshot.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, err)| (ChunkId::from_raw(id), err))
            .collect())
    }
}
