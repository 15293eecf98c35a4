//! Vector index persistence and similarity search.
//!
//! The vector branch ends here: chunks and their embedding vectors are
//! written in one transaction that first clears any previous index for the
//! file, so a retried file never mixes old and new chunks. Search is a
//! brute-force cosine scan over the stored BLOBs, which is adequate at the
//! per-tenant contract volumes this index holds.

use async_trait::async_trait;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::PipelineError;
use crate::models::Chunk;

/// One scored chunk returned by similarity search.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub file_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub score: f32,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Replace the file's chunk index with the given chunks and vectors.
    /// `chunks` and `vectors` are parallel slices.
    async fn upsert(
        &self,
        file_id: &str,
        chunks: &[Chunk],
        vectors: &[Vec<f32>],
        model: &str,
        dims: usize,
    ) -> Result<(), PipelineError>;

    /// Drop all chunks and vectors for a file.
    async fn delete(&self, file_id: &str) -> Result<(), PipelineError>;

    /// Score every stored chunk against the query vector and return the
    /// `top_k` best matches, optionally restricted to the given file ids.
    async fn search(
        &self,
        query: &[f32],
        file_ids: Option<&[String]>,
        top_k: usize,
    ) -> Result<Vec<SearchHit>, PipelineError>;
}

pub struct SqliteVectorStore {
    pool: SqlitePool,
}

impl SqliteVectorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn upsert(
        &self,
        file_id: &str,
        chunks: &[Chunk],
        vectors: &[Vec<f32>],
        model: &str,
        dims: usize,
    ) -> Result<(), PipelineError> {
        if chunks.len() != vectors.len() {
            return Err(PipelineError::Embedding(format!(
                "chunk/vector count mismatch: {} vs {}",
                chunks.len(),
                vectors.len()
            )));
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunk_vectors WHERE file_id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE file_id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;

        for (chunk, vector) in chunks.iter().zip(vectors.iter()) {
            sqlx::query(
                "INSERT INTO chunks (file_id, chunk_index, text, hash) VALUES (?, ?, ?, ?)",
            )
            .bind(&chunk.file_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(&chunk.hash)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO chunk_vectors (file_id, chunk_index, model, dims, vector) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&chunk.file_id)
            .bind(chunk.chunk_index)
            .bind(model)
            .bind(dims as i64)
            .bind(vec_to_blob(vector))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, file_id: &str) -> Result<(), PipelineError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunk_vectors WHERE file_id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE file_id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        file_ids: Option<&[String]>,
        top_k: usize,
    ) -> Result<Vec<SearchHit>, PipelineError> {
        let mut sql = String::from(
            "SELECT v.file_id, v.chunk_index, v.vector, c.text \
             FROM chunk_vectors v \
             JOIN chunks c ON c.file_id = v.file_id AND c.chunk_index = v.chunk_index",
        );
        if let Some(ids) = file_ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let placeholders = vec!["?"; ids.len()].join(", ");
            sql.push_str(&format!(" WHERE v.file_id IN ({})", placeholders));
        }

        let mut query_builder = sqlx::query(&sql);
        if let Some(ids) = file_ids {
            for id in ids {
                query_builder = query_builder.bind(id);
            }
        }
        let rows = query_builder.fetch_all(&self.pool).await?;

        let mut hits: Vec<SearchHit> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("vector");
                SearchHit {
                    file_id: row.get("file_id"),
                    chunk_index: row.get("chunk_index"),
                    text: row.get("text"),
                    score: cosine_similarity(query, &blob_to_vec(&blob)),
                }
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::chunk_text;
    use crate::db::connect_path;
    use crate::migrate::run_migrations;

    async fn test_pool(dir: &tempfile::TempDir) -> SqlitePool {
        let pool = connect_path(&dir.path().join("test.db")).await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    async fn insert_file(pool: &SqlitePool, id: &str) {
        sqlx::query(
            "INSERT INTO files (id, filename, storage_url, storage_id, file_size, upload_timestamp) \
             VALUES (?, 'a.pdf', 'file:///a', 'sid', 10, 0)",
        )
        .bind(id)
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_upsert_replaces_previous_index() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        insert_file(&pool, "f1").await;
        let store = SqliteVectorStore::new(pool.clone());

        let old = chunk_text("f1", &"old text ".repeat(50), 64, 8);
        let old_vecs: Vec<Vec<f32>> = old.iter().map(|_| vec![0.0f32, 0.0]).collect();
        store.upsert("f1", &old, &old_vecs, "m", 2).await.unwrap();

        let new = chunk_text("f1", "fresh text", 64, 8);
        let new_vecs = vec![vec![1.5f32, -2.0]];
        store.upsert("f1", &new, &new_vecs, "m", 2).await.unwrap();

        let rows = sqlx::query("SELECT chunk_index, vector FROM chunk_vectors WHERE file_id = 'f1'")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        let blob: Vec<u8> = rows[0].get("vector");
        assert_eq!(blob_to_vec(&blob), vec![1.5f32, -2.0]);
    }

    #[tokio::test]
    async fn test_upsert_rejects_mismatched_lengths() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        insert_file(&pool, "f1").await;
        let store = SqliteVectorStore::new(pool);

        let chunks = chunk_text("f1", "some text", 64, 8);
        let err = store.upsert("f1", &chunks, &[], "m", 2).await.unwrap_err();
        assert!(matches!(err, PipelineError::Embedding(_)));
    }

    #[tokio::test]
    async fn test_search_ranks_by_similarity_and_respects_top_k() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        insert_file(&pool, "f1").await;
        let store = SqliteVectorStore::new(pool);

        let chunks = vec![
            Chunk {
                file_id: "f1".to_string(),
                chunk_index: 0,
                text: "termination clause".to_string(),
                hash: "h0".to_string(),
            },
            Chunk {
                file_id: "f1".to_string(),
                chunk_index: 1,
                text: "payment schedule".to_string(),
                hash: "h1".to_string(),
            },
        ];
        let vectors = vec![vec![1.0f32, 0.0], vec![0.0f32, 1.0]];
        store.upsert("f1", &chunks, &vectors, "m", 2).await.unwrap();

        let hits = store.search(&[0.9, 0.1], None, 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].text, "termination clause");
        assert!(hits[0].score > hits[1].score);

        let hits = store.search(&[0.9, 0.1], None, 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_index, 0);
    }

    #[tokio::test]
    async fn test_search_filters_by_file_ids() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        insert_file(&pool, "f1").await;
        insert_file(&pool, "f2").await;
        let store = SqliteVectorStore::new(pool);

        for id in ["f1", "f2"] {
            let chunks = chunk_text(id, "indemnification terms", 64, 8);
            store
                .upsert(id, &chunks, &[vec![1.0f32, 0.0]], "m", 2)
                .await
                .unwrap();
        }

        let only_f2 = vec!["f2".to_string()];
        let hits = store.search(&[1.0, 0.0], Some(&only_f2), 10).await.unwrap();
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|h| h.file_id == "f2"));

        let hits = store.search(&[1.0, 0.0], Some(&[]), 10).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_delete_clears_both_tables() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        insert_file(&pool, "f1").await;
        let store = SqliteVectorStore::new(pool.clone());

        let chunks = chunk_text("f1", "clause text here", 64, 8);
        let vecs = vec![vec![1.0f32]];
        store.upsert("f1", &chunks, &vecs, "m", 1).await.unwrap();
        store.delete("f1").await.unwrap();

        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE file_id = 'f1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(n, 0);
    }
}
