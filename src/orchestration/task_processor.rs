//! # Task Processor
//!
//! Runs one claimed task through the handler registered for its type.
//!
//! The processor owns the failure boundary: a payload that does not decode,
//! a task type without a handler, and a handler that exceeds
//! `worker.handler_timeout_seconds` all become [`TaskFailure`]s. Nothing a
//! handler does surfaces as an `Err`.

use crate::config::OrchestratorConfig;
use crate::models::{ClaimedTask, ProcessingOutcome, TaskFailure, TaskType};
use crate::orchestration::chunker::TextChunker;
use crate::orchestration::handlers::{
    EmbedHandler, HandlerDependencies, OptimizeHandler, TaskHandler,
};
use crate::store::TaskStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

pub struct TaskProcessor {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
    handler_timeout: Duration,
}

impl TaskProcessor {
    /// Processor without handlers
    pub fn new(handler_timeout: Duration) -> Self {
        Self {
            handlers: HashMap::new(),
            handler_timeout,
        }
    }

    /// Processor with the embed and optimize handlers wired to `deps`
    pub fn with_default_handlers(
        deps: HandlerDependencies,
        store: Arc<dyn TaskStore>,
        config: &OrchestratorConfig,
    ) -> Self {
        let chunker = TextChunker::from_config(&config.chunking);
        let mut processor = Self::new(config.worker.handler_timeout());
        processor.register(Arc::new(EmbedHandler::resume(deps.clone(), chunker.clone())));
        processor.register(Arc::new(EmbedHandler::job(deps.clone(), chunker)));
        processor.register(Arc::new(OptimizeHandler::new(
            deps,
            store,
            config.optimize.clone(),
            config.chunking.target_chars,
        )));
        processor
    }

    /// Register a handler, replacing any previous one for its task type
    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) {
        let task_type = handler.task_type();
        if self.handlers.insert(task_type, handler).is_some() {
            debug!(%task_type, "Replaced task handler");
        }
    }

    pub fn handles(&self, task_type: TaskType) -> bool {
        self.handlers.contains_key(&task_type)
    }

    #[instrument(skip_all, fields(task_id = %claimed.id(), task_type = %claimed.task.task_type))]
    pub async fn process(&self, claimed: &ClaimedTask) -> ProcessingOutcome {
        match self.run(claimed).await {
            Ok(output) => ProcessingOutcome::Succeeded(output),
            Err(failure) => {
                debug!(kind = %failure.kind, error = %failure.message, "Handler failed");
                ProcessingOutcome::Failed(failure)
            }
        }
    }

    async fn run(&self, claimed: &ClaimedTask) -> Result<crate::models::TaskOutput, TaskFailure> {
        let task_type = claimed.task.task_type;
        let payload = claimed
            .task
            .typed_payload()
            .map_err(|e| TaskFailure::permanent(format!("invalid {task_type} payload: {e}")))?;

        let handler = self
            .handlers
            .get(&task_type)
            .ok_or_else(|| TaskFailure::permanent(format!("no handler registered for {task_type}")))?;

        match tokio::time::timeout(self.handler_timeout, handler.handle(claimed, &payload)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_ms = self.handler_timeout.as_millis() as u64, "Handler timed out");
                Err(TaskFailure::transient(format!(
                    "{task_type} handler timed out after {:?}",
                    self.handler_timeout
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FailureKind, Task, TaskOutput, TaskPayload};
    use crate::orchestration::handlers::HandlerResult;
    use crate::state_machine::TaskStatus;
    use async_trait::async_trait;
    use chrono::Utc;
    use uuid::Uuid;

    struct SlowHandler;

    #[async_trait]
    impl TaskHandler for SlowHandler {
        fn task_type(&self) -> TaskType {
            TaskType::EmbedJob
        }

        async fn handle(&self, _claimed: &ClaimedTask, _payload: &TaskPayload) -> HandlerResult {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(TaskOutput::Embedded { chunks: 0, pruned: 0 })
        }
    }

    fn claimed(task_type: TaskType, payload: serde_json::Value) -> ClaimedTask {
        let now = Utc::now();
        ClaimedTask::from_task(
            Task {
                id: Uuid::new_v4(),
                task_type,
                payload,
                target_id: Uuid::new_v4(),
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
            },
            false,
        )
    }

    fn failure_kind(outcome: ProcessingOutcome) -> FailureKind {
        match outcome {
            ProcessingOutcome::Failed(failure) => failure.kind,
            ProcessingOutcome::Succeeded(output) => panic!("unexpected success: {output:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_payload_is_permanent() {
        let processor = TaskProcessor::new(Duration::from_secs(1));
        let task = claimed(TaskType::Optimize, serde_json::json!({"job_id": "nope"}));
        assert_eq!(failure_kind(processor.process(&task).await), FailureKind::Permanent);
    }

    #[tokio::test]
    async fn test_missing_handler_is_permanent() {
        let processor = TaskProcessor::new(Duration::from_secs(1));
        let payload = serde_json::json!({"user_id": Uuid::new_v4(), "job_id": Uuid::new_v4()});
        let task = claimed(TaskType::EmbedJob, payload);
        assert_eq!(failure_kind(processor.process(&task).await), FailureKind::Permanent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_transient() {
        let mut processor = TaskProcessor::new(Duration::from_millis(50));
        processor.register(Arc::new(SlowHandler));
        let payload = serde_json::json!({"user_id": Uuid::new_v4(), "job_id": Uuid::new_v4()});
        let task = claimed(TaskType::EmbedJob, payload);
        assert_eq!(failure_kind(processor.process(&task).await), FailureKind::Transient);
    }
}
