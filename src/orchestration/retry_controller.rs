//! # Retry Controller
//!
//! Turns a failed attempt into the next task state.
//!
//! | Failure | Budget | Transition |
//! |---|---|---|
//! | transient / validation | `attempts + 1 < max_attempts` | `queued`, visible after backoff |
//! | transient / validation | exhausted | `failed` |
//! | permanent | ignored | `failed` |
//!
//! `attempts` is incremented by every failure, so after `max_attempts`
//! failures the task is terminal.

use crate::error::Result;
use crate::models::{AttemptRecord, ClaimedTask, Task, TaskFailure};
use crate::orchestration::backoff_calculator::{BackoffCalculator, BackoffResult};
use crate::store::{CommitOutcome, TaskStore};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Why a task was failed terminally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailReason {
    /// The failure was permanent; retrying cannot help
    Permanent,
    /// The retry budget is used up
    AttemptsExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    Retry(BackoffResult),
    Fail(FailReason),
}

impl RetryDecision {
    pub fn is_retry(&self) -> bool {
        matches!(self, Self::Retry(_))
    }
}

/// What happened to a failed task
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FailureResolution {
    pub decision: RetryDecision,
    pub commit: CommitOutcome,
}

pub struct RetryController {
    store: Arc<dyn TaskStore>,
    backoff: BackoffCalculator,
}

impl RetryController {
    pub fn new(store: Arc<dyn TaskStore>, backoff: BackoffCalculator) -> Self {
        Self { store, backoff }
    }

    /// Pure retry decision for `task` after `failure`
    pub fn decide(&self, task: &Task, failure: &TaskFailure) -> RetryDecision {
        if !failure.kind.is_retryable() {
            return RetryDecision::Fail(FailReason::Permanent);
        }
        let failures = task.attempts.saturating_add(1);
        if failures >= task.max_attempts {
            return RetryDecision::Fail(FailReason::AttemptsExhausted);
        }
        let attempt = u32::try_from(failures).unwrap_or(1);
        RetryDecision::Retry(self.backoff.calculate(attempt, failure.retry_after))
    }

    /// Decide and persist; a stale commit means another worker owns the task
    #[instrument(skip_all, fields(task_id = %claimed.id(), task_type = %claimed.task.task_type, kind = %failure.kind))]
    pub async fn handle_failure(
        &self,
        claimed: &ClaimedTask,
        failure: &TaskFailure,
        attempt: &AttemptRecord,
    ) -> Result<FailureResolution> {
        let decision = self.decide(&claimed.task, failure);
        let commit = match decision {
            RetryDecision::Retry(backoff) => {
                let commit = self
                    .store
                    .retry(claimed, failure, backoff.delay, attempt)
                    .await?;
                if commit.is_applied() {
                    info!(
                        attempts = claimed.task.attempts + 1,
                        max_attempts = claimed.task.max_attempts,
                        delay_ms = backoff.delay.as_millis() as u64,
                        backoff_type = ?backoff.backoff_type,
                        error = %failure.message,
                        "Task failed, scheduled for retry"
                    );
                }
                commit
            }
            RetryDecision::Fail(reason) => {
                let commit = self.store.fail(claimed, failure, attempt).await?;
                if commit.is_applied() {
                    warn!(
                        attempts = claimed.task.attempts + 1,
                        reason = ?reason,
                        error = %failure.message,
                        "Task failed terminally"
                    );
                }
                commit
            }
        };

        if !commit.is_applied() {
            warn!("Lease lost before failure could be recorded; dropping outcome");
        }
        Ok(FailureResolution { decision, commit })
    }
}
