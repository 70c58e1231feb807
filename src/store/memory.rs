//! In-memory task store.
//!
//! All state sits behind a single `parking_lot::Mutex`, which makes every
//! operation atomic the way a transaction is in the PostgreSQL store. The
//! clock can be advanced to exercise lease expiry and backoff without sleeping.

use super::{CommitOutcome, TaskStore, DEFAULT_MAX_ATTEMPTS};
use crate::error::{OrchestratorError, Result};
use crate::models::{
    AttemptRecord, ClaimedTask, EntityKind, EntityRef, EntityStatusView, Lease, NewTask,
    OptimizationResult, ReliabilityReport, Task, TaskFailure, TaskOutput, TaskType,
};
use crate::orchestration::idempotency::IdempotencyGuard;
use crate::state_machine::{self, EntityStatus, TaskEvent, TaskStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Default)]
struct MemoryState {
    tasks: HashMap<Uuid, Task>,
    optimizations: Vec<OptimizationResult>,
    attempts: Vec<AttemptRecord>,
    entity_status: HashMap<(TaskType, Uuid), EntityStatus>,
}

impl MemoryState {
    fn guarded_task_mut(&mut self, task_id: Uuid, lease: &Lease) -> Option<&mut Task> {
        self.tasks.get_mut(&task_id).filter(|task| {
            task.status == TaskStatus::Processing
                && task.claim_owner.as_deref() == Some(lease.owner.as_str())
                && task.lease_version == lease.version
        })
    }

    fn set_entity_status(&mut self, task_type: TaskType, target_id: Uuid, status: EntityStatus) {
        self.entity_status.insert((task_type, target_id), status);
    }

    /// Summary of the newest task for `(task_type, target_id)` when it failed
    fn failure_summary(&self, task_type: TaskType, target_id: Uuid) -> Option<String> {
        self.tasks
            .values()
            .filter(|task| task.task_type == task_type && task.target_id == target_id)
            .max_by_key(|task| (task.created_at, task.id))
            .filter(|task| task.status == TaskStatus::Failed)
            .and_then(|task| task.last_error_kind)
            .map(|kind| kind.user_summary().to_string())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    state: Mutex<MemoryState>,
    clock_offset: Mutex<chrono::Duration>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current store time, including any simulated advance
    pub fn now(&self) -> DateTime<Utc> {
        Utc::now() + *self.clock_offset.lock()
    }

    /// Move the store clock forward
    pub fn advance_clock(&self, by: Duration) {
        let by = Self::chrono_duration(by);
        let mut offset = self.clock_offset.lock();
        *offset = offset.checked_add(&by).unwrap_or(*offset);
    }

    /// Every task, oldest first
    pub fn tasks(&self) -> Vec<Task> {
        let state = self.state.lock();
        let mut tasks: Vec<Task> = state.tasks.values().cloned().collect();
        tasks.sort_by_key(|task| (task.created_at, task.id));
        tasks
    }

    /// Overwrite a task row, bypassing all guards
    pub fn put_task(&self, task: Task) {
        self.state.lock().tasks.insert(task.id, task);
    }

    /// Look up a task, failing when it does not exist
    pub fn task(&self, task_id: Uuid) -> Result<Task> {
        self.state
            .lock()
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found(format!("task {task_id}")))
    }

    fn chrono_duration(duration: Duration) -> chrono::Duration {
        chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
    }

    fn apply_failure(
        &self,
        claimed: &ClaimedTask,
        failure: &TaskFailure,
        event: TaskEvent,
        delay: Option<Duration>,
        attempt: &AttemptRecord,
    ) -> Result<CommitOutcome> {
        let now = self.now();
        let mut state = self.state.lock();
        let Some(task) = state.guarded_task_mut(claimed.id(), &claimed.lease) else {
            return Ok(CommitOutcome::Stale);
        };

        let next = state_machine::transition(task.status, event)?;
        state_machine::check_attempts(task.attempts, task.attempts + 1)?;
        task.status = next;
        task.attempts += 1;
        task.last_error = Some(failure.stored_message());
        task.last_error_kind = Some(failure.kind);
        task.updated_at = now;
        if let Some(delay) = delay {
            task.visible_at = now + Self::chrono_duration(delay);
            task.claim_owner = None;
        }
        let (task_type, target_id) = (task.task_type, task.target_id);

        state.set_entity_status(task_type, target_id, EntityStatus::from(next));
        state.attempts.push(attempt.clone());
        Ok(CommitOutcome::Applied)
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn enqueue(&self, new_task: &NewTask) -> Result<Task> {
        let now = self.now();
        let target = new_task.payload.target();
        let task = Task {
            id: Uuid::new_v4(),
            task_type: new_task.task_type(),
            payload: new_task.payload.to_value()?,
            target_id: target.id,
            status: TaskStatus::Queued,
            attempts: 0,
            max_attempts: new_task.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            last_error: None,
            last_error_kind: None,
            visible_at: now,
            claim_owner: None,
            lease_version: 0,
            claim_count: 0,
            created_at: now,
            updated_at: now,
        };

        let mut state = self.state.lock();
        let key = (task.task_type, task.target_id);
        if state.entity_status.get(&key) != Some(&EntityStatus::Processing) {
            state.entity_status.insert(key, EntityStatus::Queued);
        }
        state.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn claim(
        &self,
        owner: &str,
        batch_size: u32,
        lease_duration: Duration,
    ) -> Result<Vec<ClaimedTask>> {
        let now = self.now();
        let expires_at = now + Self::chrono_duration(lease_duration);
        let mut state = self.state.lock();

        let selected = IdempotencyGuard::from_tasks(state.tasks.values(), now).select(
            state.tasks.values(),
            now,
            batch_size as usize,
        );

        let mut claimed = Vec::with_capacity(selected.len());
        for task_id in selected {
            let Some(task) = state.tasks.get_mut(&task_id) else {
                continue;
            };
            let reclaimed = task.status == TaskStatus::Processing;
            let event = if reclaimed {
                TaskEvent::Reclaim
            } else {
                TaskEvent::Claim
            };
            task.status = state_machine::transition(task.status, event)?;
            task.claim_owner = Some(owner.to_string());
            task.lease_version += 1;
            task.claim_count += 1;
            task.visible_at = expires_at;
            task.updated_at = now;

            let snapshot = task.clone();
            state.set_entity_status(snapshot.task_type, snapshot.target_id, EntityStatus::Processing);
            claimed.push(ClaimedTask::from_task(snapshot, reclaimed));
        }

        if !claimed.is_empty() {
            debug!(owner = owner, claimed = claimed.len(), "Claimed tasks from memory store");
        }
        Ok(claimed)
    }

    async fn extend_lease(
        &self,
        task_id: Uuid,
        lease: &Lease,
        duration: Duration,
    ) -> Result<Option<Lease>> {
        let now = self.now();
        let mut state = self.state.lock();
        let Some(task) = state.guarded_task_mut(task_id, lease) else {
            return Ok(None);
        };
        task.visible_at = now + Self::chrono_duration(duration);
        task.updated_at = now;
        Ok(Some(Lease {
            owner: lease.owner.clone(),
            version: lease.version,
            expires_at: task.visible_at,
        }))
    }

    async fn complete(
        &self,
        claimed: &ClaimedTask,
        output: &TaskOutput,
        attempt: &AttemptRecord,
    ) -> Result<CommitOutcome> {
        let now = self.now();
        let mut state = self.state.lock();
        let Some(task) = state.guarded_task_mut(claimed.id(), &claimed.lease) else {
            return Ok(CommitOutcome::Stale);
        };

        task.status = state_machine::transition(task.status, TaskEvent::Complete)?;
        task.updated_at = now;
        let (task_id, task_type, target_id) = (task.id, task.task_type, task.target_id);

        if let TaskOutput::Optimized(result) = output {
            let version_no = state
                .optimizations
                .iter()
                .filter(|existing| existing.job_id == result.job_id)
                .map(|existing| existing.version_no)
                .max()
                .unwrap_or(0)
                + 1;
            state
                .optimizations
                .push(OptimizationResult::from_new(result, task_id, version_no, now));
        }

        state.set_entity_status(task_type, target_id, EntityStatus::Complete);
        state.attempts.push(attempt.clone());
        Ok(CommitOutcome::Applied)
    }

    async fn retry(
        &self,
        claimed: &ClaimedTask,
        failure: &TaskFailure,
        delay: Duration,
        attempt: &AttemptRecord,
    ) -> Result<CommitOutcome> {
        self.apply_failure(claimed, failure, TaskEvent::Retry, Some(delay), attempt)
    }

    async fn fail(
        &self,
        claimed: &ClaimedTask,
        failure: &TaskFailure,
        attempt: &AttemptRecord,
    ) -> Result<CommitOutcome> {
        self.apply_failure(claimed, failure, TaskEvent::Fail, None, attempt)
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>> {
        Ok(self.state.lock().tasks.get(&task_id).cloned())
    }

    async fn status(&self, entity: EntityRef) -> Result<Option<EntityStatusView>> {
        let state = self.state.lock();
        let view = match entity.kind {
            EntityKind::Job => {
                let status = state
                    .entity_status
                    .get(&(TaskType::Optimize, entity.id))
                    .copied();
                let embedding_status = state
                    .entity_status
                    .get(&(TaskType::EmbedJob, entity.id))
                    .copied();
                if status.is_none() && embedding_status.is_none() {
                    return Ok(None);
                }
                let result = state
                    .optimizations
                    .iter()
                    .filter(|result| result.job_id == entity.id)
                    .max_by_key(|result| result.version_no)
                    .cloned();
                EntityStatusView {
                    entity,
                    // `jobs.status` defaults to 'queued' before any optimize runs
                    status: status.unwrap_or(EntityStatus::Queued),
                    embedding_status,
                    result,
                    error_summary: state.failure_summary(TaskType::Optimize, entity.id),
                }
            }
            EntityKind::ResumeVersion => {
                let Some(status) = state
                    .entity_status
                    .get(&(TaskType::EmbedResume, entity.id))
                    .copied()
                else {
                    return Ok(None);
                };
                EntityStatusView {
                    entity,
                    status,
                    embedding_status: Some(status),
                    result: None,
                    error_summary: state.failure_summary(TaskType::EmbedResume, entity.id),
                }
            }
        };
        Ok(Some(view))
    }

    async fn find_optimization(
        &self,
        job_id: Uuid,
        input_fingerprint: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<OptimizationResult>> {
        Ok(self
            .state
            .lock()
            .optimizations
            .iter()
            .filter(|result| {
                result.job_id == job_id
                    && result.input_fingerprint == input_fingerprint
                    && result.created_at >= since
            })
            .max_by_key(|result| result.version_no)
            .cloned())
    }

    async fn optimizations_for_job(&self, job_id: Uuid) -> Result<Vec<OptimizationResult>> {
        let state = self.state.lock();
        let mut results: Vec<OptimizationResult> = state
            .optimizations
            .iter()
            .filter(|result| result.job_id == job_id)
            .cloned()
            .collect();
        results.sort_by_key(|result| result.version_no);
        Ok(results)
    }

    async fn attempts_for_task(&self, task_id: Uuid) -> Result<Vec<AttemptRecord>> {
        Ok(self
            .state
            .lock()
            .attempts
            .iter()
            .filter(|record| record.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn reliability_report(&self) -> Result<ReliabilityReport> {
        let state = self.state.lock();
        let mut report = ReliabilityReport::default();
        for record in &state.attempts {
            report.record(record);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AttemptOutcome, FailureKind};

    const LEASE: Duration = Duration::from_secs(60);

    fn attempt(claimed: &ClaimedTask, outcome: AttemptOutcome) -> AttemptRecord {
        AttemptRecord {
            task_id: claimed.id(),
            task_type: claimed.task.task_type,
            attempt_no: claimed.task.attempts + 1,
            outcome,
            llm_called: false,
            latency_ms: 1,
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_claim_is_fifo_and_bounded() {
        let store = InMemoryTaskStore::new();
        let user = Uuid::new_v4();
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(store.enqueue(&NewTask::embed_job(user, Uuid::new_v4())).await.unwrap().id);
            store.advance_clock(Duration::from_millis(1));
        }

        let claimed = store.claim("w1", 2, LEASE).await.unwrap();
        let claimed_ids: Vec<Uuid> = claimed.iter().map(|c| c.id()).collect();
        assert_eq!(claimed_ids, ids[..2].to_vec());
        assert!(claimed.iter().all(|c| c.task.status == TaskStatus::Processing));
        assert!(claimed.iter().all(|c| c.lease.version == 1 && c.lease.owner == "w1"));
    }

    #[tokio::test]
    async fn test_claim_skips_key_with_live_lease() {
        let store = InMemoryTaskStore::new();
        let (user, version) = (Uuid::new_v4(), Uuid::new_v4());
        let first = store.enqueue(&NewTask::embed_resume(user, version)).await.unwrap();
        let second = store.enqueue(&NewTask::embed_resume(user, version)).await.unwrap();

        let claimed = store.claim("w1", 10, LEASE).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id(), first.id);

        assert!(store.claim("w2", 10, LEASE).await.unwrap().is_empty());
        let untouched = store.task(second.id).unwrap();
        assert_eq!(untouched, second);
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed_with_new_version() {
        let store = InMemoryTaskStore::new();
        store.enqueue(&NewTask::embed_job(Uuid::new_v4(), Uuid::new_v4())).await.unwrap();
        let first = store.claim("w1", 1, LEASE).await.unwrap().remove(0);

        store.advance_clock(Duration::from_secs(59));
        assert!(store.claim("w2", 1, LEASE).await.unwrap().is_empty());

        store.advance_clock(Duration::from_secs(2));
        let second = store.claim("w2", 1, LEASE).await.unwrap().remove(0);
        assert!(second.reclaimed);
        assert_eq!(second.lease.version, first.lease.version + 1);
        assert_eq!(second.task.claim_count, 2);

        let stale = store
            .complete(&first, &TaskOutput::Embedded { chunks: 1, pruned: 0 }, &attempt(&first, AttemptOutcome::Succeeded))
            .await
            .unwrap();
        assert_eq!(stale, CommitOutcome::Stale);
    }

    #[tokio::test]
    async fn test_retry_delays_visibility_and_counts_attempt() {
        let store = InMemoryTaskStore::new();
        let task = store.enqueue(&NewTask::embed_job(Uuid::new_v4(), Uuid::new_v4())).await.unwrap();
        let claimed = store.claim("w1", 1, LEASE).await.unwrap().remove(0);

        let failure = TaskFailure::transient("503");
        let outcome = store
            .retry(&claimed, &failure, Duration::from_secs(10), &attempt(&claimed, AttemptOutcome::Transient))
            .await
            .unwrap();
        assert!(outcome.is_applied());

        let row = store.task(task.id).unwrap();
        assert_eq!(row.status, TaskStatus::Queued);
        assert_eq!(row.attempts, 1);
        assert_eq!(row.last_error_kind, Some(FailureKind::Transient));
        assert!(row.claim_owner.is_none());

        assert!(store.claim("w1", 1, LEASE).await.unwrap().is_empty());
        store.advance_clock(Duration::from_secs(11));
        assert_eq!(store.claim("w1", 1, LEASE).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_task_reports_user_summary() {
        let store = InMemoryTaskStore::new();
        let job = Uuid::new_v4();
        store
            .enqueue(&NewTask::optimize(Uuid::new_v4(), job, Uuid::new_v4()))
            .await
            .unwrap();
        let claimed = store.claim("w1", 1, LEASE).await.unwrap().remove(0);
        store
            .fail(&claimed, &TaskFailure::permanent("job missing"), &attempt(&claimed, AttemptOutcome::Permanent))
            .await
            .unwrap();

        let view = store.status(EntityRef::job(job)).await.unwrap().unwrap();
        assert_eq!(view.status, EntityStatus::Failed);
        assert_eq!(
            view.error_summary.as_deref(),
            Some(FailureKind::Permanent.user_summary())
        );
        assert!(view.result.is_none());
    }

    #[tokio::test]
    async fn test_enqueue_keeps_processing_entity_status() {
        let store = InMemoryTaskStore::new();
        let (user, job) = (Uuid::new_v4(), Uuid::new_v4());
        store.enqueue(&NewTask::embed_job(user, job)).await.unwrap();
        store.claim("w1", 1, LEASE).await.unwrap();
        store.enqueue(&NewTask::embed_job(user, job)).await.unwrap();

        let view = store.status(EntityRef::job(job)).await.unwrap().unwrap();
        assert_eq!(view.embedding_status, Some(EntityStatus::Processing));
        assert!(store.status(EntityRef::resume_version(job)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_job_without_optimize_reports_column_default() {
        let store = InMemoryTaskStore::new();
        let (user, job) = (Uuid::new_v4(), Uuid::new_v4());
        store.enqueue(&NewTask::embed_job(user, job)).await.unwrap();
        store.claim("w1", 1, LEASE).await.unwrap();

        let view = store.status(EntityRef::job(job)).await.unwrap().unwrap();
        assert_eq!(view.status, EntityStatus::Queued);
        assert_eq!(view.embedding_status, Some(EntityStatus::Processing));
        assert!(view.result.is_none());
    }
}
