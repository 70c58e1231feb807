//! # Task Handlers
//!
//! One handler per task type. A handler reads its inputs through the
//! provider traits and returns either a [`TaskOutput`] for the result writer
//! or a classified [`TaskFailure`] for the retry controller. Handlers never
//! write to the task row.

pub mod embed;
pub mod optimize;

use crate::models::{ClaimedTask, TaskFailure, TaskOutput, TaskPayload, TaskType};
use crate::orchestration::error_classifier::ErrorClassifier;
use crate::providers::{ContentStore, Document, EmbeddingProvider, LlmProvider, VectorIndex};
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

pub use embed::EmbedHandler;
pub use optimize::OptimizeHandler;

pub type HandlerResult = Result<TaskOutput, TaskFailure>;

#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Task type this handler processes
    fn task_type(&self) -> TaskType;

    async fn handle(&self, claimed: &ClaimedTask, payload: &TaskPayload) -> HandlerResult;
}

/// External collaborators shared by all handlers
#[derive(Clone)]
pub struct HandlerDependencies {
    pub content: Arc<dyn ContentStore>,
    pub llm: Arc<dyn LlmProvider>,
    pub embeddings: Arc<dyn EmbeddingProvider>,
    pub vectors: Arc<dyn VectorIndex>,
    pub classifier: ErrorClassifier,
}

impl HandlerDependencies {
    pub fn new(
        content: Arc<dyn ContentStore>,
        llm: Arc<dyn LlmProvider>,
        embeddings: Arc<dyn EmbeddingProvider>,
        vectors: Arc<dyn VectorIndex>,
    ) -> Self {
        Self {
            content,
            llm,
            embeddings,
            vectors,
            classifier: ErrorClassifier::new(),
        }
    }
}

/// Check that a looked-up document exists, belongs to `owner_id`, and has text
pub(crate) fn owned_document(
    document: Option<Document>,
    what: &str,
    id: Uuid,
    owner_id: Uuid,
) -> Result<Document, TaskFailure> {
    let document = document.ok_or_else(|| TaskFailure::permanent(format!("{what} {id} not found")))?;
    if document.owner_id != owner_id {
        return Err(TaskFailure::permanent(format!(
            "{what} {id} does not belong to user {owner_id}"
        )));
    }
    if document.text.trim().is_empty() {
        return Err(TaskFailure::permanent(format!("{what} {id} has no text")));
    }
    Ok(document)
}

/// Reject embeddings with NaN or infinite components before they reach the index
pub(crate) fn check_finite(vectors: &[Vec<f32>]) -> Result<(), TaskFailure> {
    for (position, vector) in vectors.iter().enumerate() {
        if let Some(component) = vector.iter().position(|v| !v.is_finite()) {
            return Err(TaskFailure::validation(format!(
                "vector {position} has a non-finite component at {component}"
            )));
        }
    }
    Ok(())
}

/// A payload routed to the wrong handler is a bug in dispatch, never retried
pub(crate) fn wrong_payload(expected: TaskType, payload: &TaskPayload) -> TaskFailure {
    TaskFailure::permanent(format!(
        "handler for {expected} received a {} payload",
        payload.task_type()
    ))
}
