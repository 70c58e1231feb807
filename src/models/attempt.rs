//! Attempt records backing the invalid-output reliability metric.

use crate::models::outcome::{FailureKind, ProcessingOutcome, TaskOutput};
use crate::models::task::{ClaimedTask, TaskType};
use chrono::{DateTime, Utc};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Transient,
    /// The LLM's reply failed schema or consistency checks
    InvalidOutput,
    /// Any other validation failure
    Validation,
    Permanent,
    Deduplicated,
}

impl AttemptOutcome {
    pub fn from_processing(outcome: &ProcessingOutcome) -> Self {
        match outcome {
            ProcessingOutcome::Succeeded(TaskOutput::Deduplicated { .. }) => Self::Deduplicated,
            ProcessingOutcome::Succeeded(_) => Self::Succeeded,
            ProcessingOutcome::Failed(failure) if failure.invalid_output => Self::InvalidOutput,
            ProcessingOutcome::Failed(failure) => match failure.kind {
                FailureKind::Transient => Self::Transient,
                FailureKind::Validation => Self::Validation,
                FailureKind::Permanent => Self::Permanent,
            },
        }
    }
}

/// One committed handler execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct AttemptRecord {
    pub task_id: Uuid,
    pub task_type: TaskType,
    pub attempt_no: i32,
    pub outcome: AttemptOutcome,
    /// Whether this execution called the LLM
    pub llm_called: bool,
    pub latency_ms: i64,
    pub recorded_at: DateTime<Utc>,
}

impl AttemptRecord {
    /// Record for the current execution of `claimed`; the attempt number is
    /// the task's claim count, so re-claims after a crash are counted too
    pub fn for_claim(
        claimed: &ClaimedTask,
        outcome: AttemptOutcome,
        latency: Duration,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: claimed.id(),
            task_type: claimed.task.task_type,
            attempt_no: claimed.task.claim_count,
            outcome,
            llm_called: false,
            latency_ms: i64::try_from(latency.as_millis()).unwrap_or(i64::MAX),
            recorded_at,
        }
    }

    /// Record for a finished execution, outcome and LLM use taken from `outcome`
    pub fn for_outcome(
        claimed: &ClaimedTask,
        outcome: &ProcessingOutcome,
        latency: Duration,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            llm_called: outcome.llm_called(),
            ..Self::for_claim(
                claimed,
                AttemptOutcome::from_processing(outcome),
                latency,
                recorded_at,
            )
        }
    }
}

/// Invalid-output rate of the optimize handler.
///
/// Only optimize attempts that called the LLM are counted, so failures before
/// the call (missing entities, embedding or vector errors) and deduplicated
/// runs never move the rate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityReport {
    /// Optimize attempts that called the LLM
    pub total_optimize_attempts: i64,
    /// Attempts whose LLM reply failed validation
    pub invalid_outputs: i64,
    pub transient_failures: i64,
    /// Permanent and non-output validation failures after the call
    pub other_failures: i64,
    pub succeeded: i64,
}

impl ReliabilityReport {
    /// Invalid outputs over optimize attempts that called the LLM; 0.0 with none
    pub fn invalid_output_rate(&self) -> f64 {
        if self.total_optimize_attempts == 0 {
            return 0.0;
        }
        self.invalid_outputs as f64 / self.total_optimize_attempts as f64
    }

    /// Fold one optimize attempt into the report
    pub fn record(&mut self, attempt: &AttemptRecord) {
        if attempt.task_type == TaskType::Optimize && attempt.llm_called {
            self.record_count(attempt.outcome, 1);
        }
    }

    /// Fold `count` optimize attempts that called the LLM with the same outcome
    pub fn record_count(&mut self, outcome: AttemptOutcome, count: i64) {
        match outcome {
            AttemptOutcome::Deduplicated => return,
            AttemptOutcome::Succeeded => self.succeeded += count,
            AttemptOutcome::Transient => self.transient_failures += count,
            AttemptOutcome::InvalidOutput => self.invalid_outputs += count,
            AttemptOutcome::Validation | AttemptOutcome::Permanent => {
                self.other_failures += count
            }
        }
        self.total_optimize_attempts += count;
    }
}
