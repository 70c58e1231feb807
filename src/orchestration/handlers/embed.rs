//! Embedding of resume versions and job descriptions.
//!
//! The document is chunked, every chunk embedded, and the vectors upserted
//! under `(owner_id, source_id, chunk_index)`. Re-embedding the same source
//! overwrites in place; chunk indices left over from an earlier, longer
//! version are pruned afterwards.

use super::{check_finite, owned_document, wrong_payload, HandlerDependencies, HandlerResult, TaskHandler};
use crate::models::{ClaimedTask, TaskFailure, TaskOutput, TaskPayload, TaskType};
use crate::orchestration::chunker::TextChunker;
use crate::providers::{ProviderError, VectorRecord};
use async_trait::async_trait;
use tracing::{debug, instrument};
use uuid::Uuid;

pub struct EmbedHandler {
    task_type: TaskType,
    deps: HandlerDependencies,
    chunker: TextChunker,
}

impl EmbedHandler {
    /// Handler for resume versions (`embed_resume`)
    pub fn resume(deps: HandlerDependencies, chunker: TextChunker) -> Self {
        Self {
            task_type: TaskType::EmbedResume,
            deps,
            chunker,
        }
    }

    /// Handler for job descriptions (`embed_job`)
    pub fn job(deps: HandlerDependencies, chunker: TextChunker) -> Self {
        Self {
            task_type: TaskType::EmbedJob,
            deps,
            chunker,
        }
    }

    async fn embed_document(&self, owner_id: Uuid, source_id: Uuid, text: &str) -> HandlerResult {
        let chunks = self.chunker.split(text);
        if chunks.is_empty() {
            return Err(TaskFailure::permanent(format!("source {source_id} has no text")));
        }

        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
        let vectors = self
            .deps
            .embeddings
            .embed(&texts)
            .await
            .map_err(|e| self.deps.classifier.failure_for("embedding chunks", &e))?;

        if vectors.len() != chunks.len() {
            return Err(TaskFailure::validation(format!(
                "embedding provider returned {} vectors for {} chunks",
                vectors.len(),
                chunks.len()
            )));
        }
        let dimensions = self.deps.embeddings.dimensions();
        if let Some(bad) = vectors.iter().position(|v| v.len() != dimensions) {
            return Err(TaskFailure::validation(format!(
                "vector {bad} has {} dimensions, expected {dimensions}",
                vectors[bad].len()
            )));
        }
        check_finite(&vectors)?;

        let records: Vec<VectorRecord> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, embedding)| VectorRecord {
                namespace: owner_id,
                source_id,
                chunk_index: chunk.index,
                text: chunk.text,
                embedding,
            })
            .collect();
        let chunk_count = records.len();

        self.deps
            .vectors
            .upsert(records)
            .await
            .map_err(|e| self.deps.classifier.failure_for("vector upsert", &e))?;

        let pruned = self
            .deps
            .vectors
            .prune(owner_id, source_id, chunk_count as u32)
            .await
            .map_err(|e| self.deps.classifier.failure_for("vector prune", &e))?;

        debug!(%source_id, chunks = chunk_count, pruned, "Document embedded");
        Ok(TaskOutput::Embedded {
            chunks: chunk_count,
            pruned: pruned as usize,
        })
    }
}

#[async_trait]
impl TaskHandler for EmbedHandler {
    fn task_type(&self) -> TaskType {
        self.task_type
    }

    #[instrument(skip_all, fields(task_id = %claimed.id(), task_type = %self.task_type))]
    async fn handle(&self, claimed: &ClaimedTask, payload: &TaskPayload) -> HandlerResult {
        let content = &self.deps.content;
        let classify = |e: ProviderError| self.deps.classifier.failure_for("content lookup", &e);

        let (owner_id, document) = match (self.task_type, payload) {
            (TaskType::EmbedResume, TaskPayload::EmbedResume(p)) => {
                let found = content.resume_version(p.resume_version_id).await.map_err(classify)?;
                let doc = owned_document(found, "resume version", p.resume_version_id, p.user_id)?;
                (p.user_id, doc)
            }
            (TaskType::EmbedJob, TaskPayload::EmbedJob(p)) => {
                let found = content.job(p.job_id).await.map_err(classify)?;
                (p.user_id, owned_document(found, "job", p.job_id, p.user_id)?)
            }
            _ => return Err(wrong_payload(self.task_type, payload)),
        };

        self.embed_document(owner_id, document.id, &document.text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{
        ContentStore, EmbeddingProvider, InMemoryContentStore, InMemoryVectorIndex, LlmProvider,
        LlmRequest, ProviderResult, VectorIndex,
    };
    use crate::state_machine::TaskStatus;
    use chrono::Utc;
    use std::sync::Arc;

    struct FixedEmbeddings;

    #[async_trait]
    impl EmbeddingProvider for FixedEmbeddings {
        fn dimensions(&self) -> usize {
            2
        }

        async fn embed(&self, texts: &[String]) -> ProviderResult<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    struct NoLlm;

    #[async_trait]
    impl LlmProvider for NoLlm {
        fn model(&self) -> &str {
            "none"
        }

        async fn generate(&self, _request: LlmRequest) -> ProviderResult<String> {
            Err(ProviderError::Config("not used".into()))
        }
    }

    fn claimed(payload: &TaskPayload) -> ClaimedTask {
        let now = Utc::now();
        let task = crate::models::Task {
            id: Uuid::new_v4(),
            task_type: payload.task_type(),
            payload: payload.to_value().unwrap(),
            target_id: payload.target().id,
            status: TaskStatus::Processing,
            attempts: 0,
            max_attempts: 3,
            last_error: None,
            last_error_kind: None,
            visible_at: now,
            claim_owner: Some("w".into()),
            lease_version: 1,
            claim_count: 1,
            created_at: now,
            updated_at: now,
        };
        ClaimedTask::from_task(task, false)
    }

    fn setup() -> (Arc<InMemoryContentStore>, Arc<InMemoryVectorIndex>, EmbedHandler) {
        let content = Arc::new(InMemoryContentStore::new());
        let vectors = Arc::new(InMemoryVectorIndex::new());
        let deps = HandlerDependencies::new(
            content.clone() as Arc<dyn ContentStore>,
            Arc::new(NoLlm),
            Arc::new(FixedEmbeddings),
            vectors.clone() as Arc<dyn VectorIndex>,
        );
        (content, vectors, EmbedHandler::job(deps, TextChunker::new(20, 5)))
    }

    #[tokio::test]
    async fn test_reembedding_overwrites_and_prunes() {
        let (content, vectors, handler) = setup();
        let (user, job) = (Uuid::new_v4(), Uuid::new_v4());
        let payload = TaskPayload::EmbedJob(crate::models::EmbedJobPayload { user_id: user, job_id: job });

        content.insert_job(job, user, "word ".repeat(20));
        let first = handler.handle(&claimed(&payload), &payload).await.unwrap();
        let TaskOutput::Embedded { chunks: long, .. } = first else {
            panic!("unexpected output {first:?}");
        };
        assert!(long > 2);

        content.insert_job(job, user, "short description");
        let second = handler.handle(&claimed(&payload), &payload).await.unwrap();
        assert!(matches!(second, TaskOutput::Embedded { chunks: 1, pruned } if pruned == long - 1));
        assert_eq!(vectors.count(user, job).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_foreign_document_is_permanent_failure() {
        let (content, _vectors, handler) = setup();
        let (user, job) = (Uuid::new_v4(), Uuid::new_v4());
        content.insert_job(job, Uuid::new_v4(), "someone else's job");
        let payload = TaskPayload::EmbedJob(crate::models::EmbedJobPayload { user_id: user, job_id: job });

        let failure = handler.handle(&claimed(&payload), &payload).await.unwrap_err();
        assert_eq!(failure.kind, crate::models::FailureKind::Permanent);
    }
}
