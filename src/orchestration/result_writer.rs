//! # Result Writer
//!
//! Persists handler output and completes the task in one store transaction,
//! so a result never exists without its task being `complete` and a task is
//! never `complete` without its result.

use crate::error::Result;
use crate::models::{AttemptRecord, ClaimedTask, TaskOutput};
use crate::store::{CommitOutcome, TaskStore};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

pub struct ResultWriter {
    store: Arc<dyn TaskStore>,
}

impl ResultWriter {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    #[instrument(skip_all, fields(task_id = %claimed.id(), task_type = %claimed.task.task_type, output = output.kind()))]
    pub async fn write(
        &self,
        claimed: &ClaimedTask,
        output: &TaskOutput,
        attempt: &AttemptRecord,
    ) -> Result<CommitOutcome> {
        let commit = self.store.complete(claimed, output, attempt).await?;

        match (commit, output) {
            (CommitOutcome::Stale, _) => {
                warn!(
                    lease_version = claimed.lease.version,
                    "Lease lost before completion; result dropped"
                );
            }
            (CommitOutcome::Applied, TaskOutput::Optimized(result)) => {
                info!(
                    job_id = %result.job_id,
                    score = result.score(),
                    latency_ms = attempt.latency_ms,
                    "Optimization result stored"
                );
            }
            (CommitOutcome::Applied, TaskOutput::Deduplicated { existing_result_id }) => {
                info!(%existing_result_id, "Equivalent result already stored; task completed");
            }
            (CommitOutcome::Applied, TaskOutput::Embedded { chunks, pruned }) => {
                debug!(chunks, pruned, "Embeddings indexed");
            }
        }
        Ok(commit)
    }
}
