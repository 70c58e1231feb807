//! Vector index backends.
//!
//! Both backends key chunks by `(namespace, source_id, chunk_index)`, so
//! re-indexing a document overwrites its previous vectors instead of
//! duplicating them.

use super::{ProviderError, ProviderResult, VectorIndex, VectorMatch, VectorRecord};
use async_trait::async_trait;
use dashmap::DashMap;
use pgvector::Vector;
use sqlx::PgPool;
use tracing::{debug, instrument};
use uuid::Uuid;

type ChunkKey = (Uuid, Uuid, u32);

/// Process-local index with brute-force cosine similarity
#[derive(Debug, Default)]
pub struct InMemoryVectorIndex {
    chunks: DashMap<ChunkKey, VectorRecord>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total chunks across all namespaces
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Cosine similarity; 0.0 for mismatched or zero-length vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(&self, records: Vec<VectorRecord>) -> ProviderResult<()> {
        for record in records {
            let key = (record.namespace, record.source_id, record.chunk_index);
            self.chunks.insert(key, record);
        }
        Ok(())
    }

    async fn query(
        &self,
        namespace: Uuid,
        embedding: &[f32],
        top_k: usize,
        source_id: Option<Uuid>,
    ) -> ProviderResult<Vec<VectorMatch>> {
        let mut matches: Vec<VectorMatch> = self
            .chunks
            .iter()
            .filter(|entry| {
                let (ns, source, _) = *entry.key();
                ns == namespace && source_id.map_or(true, |wanted| wanted == source)
            })
            .map(|entry| {
                let record = entry.value();
                VectorMatch {
                    source_id: record.source_id,
                    chunk_index: record.chunk_index,
                    text: record.text.clone(),
                    score: cosine_similarity(&record.embedding, embedding),
                }
            })
            .collect();

        matches.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.chunk_index.cmp(&b.chunk_index))
        });
        matches.truncate(top_k);
        Ok(matches)
    }

    async fn prune(&self, namespace: Uuid, source_id: Uuid, keep_below: u32) -> ProviderResult<u64> {
        let before = self.chunks.len();
        self.chunks.retain(|(ns, source, index), _| {
            !(*ns == namespace && *source == source_id && *index >= keep_below)
        });
        Ok((before - self.chunks.len()) as u64)
    }

    async fn count(&self, namespace: Uuid, source_id: Uuid) -> ProviderResult<u64> {
        Ok(self
            .chunks
            .iter()
            .filter(|entry| {
                let (ns, source, _) = *entry.key();
                ns == namespace && source == source_id
            })
            .count() as u64)
    }
}

/// pgvector-backed index over the `chunk_embeddings` table
#[derive(Debug, Clone)]
pub struct PgVectorIndex {
    pool: PgPool,
}

impl PgVectorIndex {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Convert to a pgvector value; pgvector refuses NaN and infinite components
fn pg_vector(embedding: &[f32]) -> ProviderResult<Vector> {
    if let Some(index) = embedding.iter().position(|v| !v.is_finite()) {
        return Err(ProviderError::Parse(format!(
            "embedding component {index} is not finite"
        )));
    }
    Ok(Vector::from(embedding.to_vec()))
}

#[derive(sqlx::FromRow)]
struct VectorMatchRow {
    source_id: Uuid,
    chunk_index: i32,
    content: String,
    score: f64,
}

#[async_trait]
impl VectorIndex for PgVectorIndex {
    #[instrument(skip(self, records), fields(count = records.len()))]
    async fn upsert(&self, records: Vec<VectorRecord>) -> ProviderResult<()> {
        let vectors = records
            .iter()
            .map(|record| pg_vector(&record.embedding))
            .collect::<ProviderResult<Vec<Vector>>>()?;

        let mut tx = self.pool.begin().await?;
        for (record, vector) in records.iter().zip(vectors) {
            sqlx::query(
                r#"
                INSERT INTO chunk_embeddings
                    (owner_id, source_id, chunk_index, content, metadata, embedding, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, NOW())
                ON CONFLICT (owner_id, source_id, chunk_index) DO UPDATE SET
                    content = EXCLUDED.content,
                    metadata = EXCLUDED.metadata,
                    embedding = EXCLUDED.embedding,
                    updated_at = NOW()
                "#,
            )
            .bind(record.namespace)
            .bind(record.source_id)
            .bind(record.chunk_index as i32)
            .bind(&record.text)
            .bind(record.metadata())
            .bind(vector)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(count = records.len(), "Upserted chunk embeddings");
        Ok(())
    }

    async fn query(
        &self,
        namespace: Uuid,
        embedding: &[f32],
        top_k: usize,
        source_id: Option<Uuid>,
    ) -> ProviderResult<Vec<VectorMatch>> {
        let query_vector = pg_vector(embedding)?;
        let rows = sqlx::query_as::<_, VectorMatchRow>(
            r#"
            SELECT source_id, chunk_index, content,
                   (1 - (embedding <=> $2))::float8 AS score
            FROM chunk_embeddings
            WHERE owner_id = $1
              AND ($4::uuid IS NULL OR source_id = $4)
            ORDER BY embedding <=> $2, chunk_index
            LIMIT $3
            "#,
        )
        .bind(namespace)
        .bind(query_vector)
        .bind(top_k as i64)
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let chunk_index = u32::try_from(row.chunk_index).map_err(|_| {
                    ProviderError::Storage(format!("negative chunk index {}", row.chunk_index))
                })?;
                Ok(VectorMatch {
                    source_id: row.source_id,
                    chunk_index,
                    text: row.content,
                    score: row.score as f32,
                })
            })
            .collect()
    }

    async fn prune(&self, namespace: Uuid, source_id: Uuid, keep_below: u32) -> ProviderResult<u64> {
        let result = sqlx::query(
            "DELETE FROM chunk_embeddings WHERE owner_id = $1 AND source_id = $2 AND chunk_index >= $3",
        )
        .bind(namespace)
        .bind(source_id)
        .bind(keep_below as i32)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn count(&self, namespace: Uuid, source_id: Uuid) -> ProviderResult<u64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM chunk_embeddings WHERE owner_id = $1 AND source_id = $2",
        )
        .bind(namespace)
        .bind(source_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }
}
