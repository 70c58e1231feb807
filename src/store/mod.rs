//! # Task Store
//!
//! Durable home of tasks, optimization results, attempt records, and the
//! denormalised status of dependent entities.
//!
//! ## Guarded Writes
//!
//! Every write after a claim is conditioned on the row still being
//! `processing` under the same `claim_owner` and `lease_version`. A worker
//! whose lease lapsed and was re-claimed elsewhere gets
//! [`CommitOutcome::Stale`] back and must drop its result.
//!
//! ## Implementations
//!
//! - [`PgTaskStore`]: PostgreSQL via sqlx, `FOR UPDATE SKIP LOCKED` claiming
//! - [`InMemoryTaskStore`]: a mutex-guarded map with identical semantics, for
//!   tests, benchmarks, and local development

pub mod memory;
pub mod postgres;

use crate::error::Result;
use crate::models::{
    AttemptRecord, ClaimedTask, EntityRef, EntityStatusView, Lease, NewTask, OptimizationResult,
    ReliabilityReport, Task, TaskFailure, TaskOutput,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

pub use memory::InMemoryTaskStore;
pub use postgres::PgTaskStore;

/// Retry budget for tasks enqueued without one
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Whether a guarded write took effect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Applied,
    /// The lease was lost; nothing was written
    Stale,
}

impl CommitOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a queued task, visible immediately, and mark its entity queued
    /// unless the entity is currently processing
    async fn enqueue(&self, task: &NewTask) -> Result<Task>;

    /// Lease up to `batch_size` eligible tasks to `owner`, oldest first.
    ///
    /// At most one task per `(task_type, target_id)` is returned, and none for
    /// a key that already holds a live lease.
    async fn claim(
        &self,
        owner: &str,
        batch_size: u32,
        lease_duration: Duration,
    ) -> Result<Vec<ClaimedTask>>;

    /// Push the lease expiry forward; `None` when the lease was lost
    async fn extend_lease(
        &self,
        task_id: Uuid,
        lease: &Lease,
        duration: Duration,
    ) -> Result<Option<Lease>>;

    /// Persist the output and mark the task complete in one transaction
    async fn complete(
        &self,
        claimed: &ClaimedTask,
        output: &TaskOutput,
        attempt: &AttemptRecord,
    ) -> Result<CommitOutcome>;

    /// Record a failed attempt and re-queue after `delay`
    async fn retry(
        &self,
        claimed: &ClaimedTask,
        failure: &TaskFailure,
        delay: Duration,
        attempt: &AttemptRecord,
    ) -> Result<CommitOutcome>;

    /// Record a failed attempt and mark the task failed
    async fn fail(
        &self,
        claimed: &ClaimedTask,
        failure: &TaskFailure,
        attempt: &AttemptRecord,
    ) -> Result<CommitOutcome>;

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>>;

    /// Status view of a job or resume version; `None` when unknown
    async fn status(&self, entity: EntityRef) -> Result<Option<EntityStatusView>>;

    /// Result for `job_id` with this fingerprint created at or after `since`
    async fn find_optimization(
        &self,
        job_id: Uuid,
        input_fingerprint: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<OptimizationResult>>;

    /// All result versions for a job, oldest first
    async fn optimizations_for_job(&self, job_id: Uuid) -> Result<Vec<OptimizationResult>>;

    async fn attempts_for_task(&self, task_id: Uuid) -> Result<Vec<AttemptRecord>>;

    /// Invalid-output rate over recorded optimize attempts
    async fn reliability_report(&self) -> Result<ReliabilityReport>;
}
