//! # PostgreSQL Task Store
//!
//! ## Claiming
//!
//! A claim runs as a single statement:
//!
//! 1. rank eligible rows per `(task_type, target_id)` and keep the oldest one
//!    per key, dropping keys that already hold a live lease;
//! 2. lock the survivors with `FOR UPDATE SKIP LOCKED`, re-checking
//!    eligibility so a row claimed concurrently falls out;
//! 3. move the locked rows to `processing`, bump `lease_version` and
//!    `claim_count`, and set `visible_at` to the lease expiry;
//! 4. mark the dependent jobs and resume versions `processing`. Job updates
//!    are folded per job first, since a statement may touch a row only once
//!    and one batch can hold both the optimize and the embed task of a job.
//!
//! Concurrent claimers therefore never return the same row, a key with a
//! live lease is never claimed a second time, and the lease and the entity
//! status commit or fail together.
//!
//! ## Guarded Writes
//!
//! Completion, retry, and failure update the task row only
//! `WHERE status = 'processing' AND claim_owner = $owner AND lease_version = $version`,
//! inside the same transaction as the result insert, entity status update,
//! and attempt record. Zero affected rows rolls everything back and yields
//! [`CommitOutcome::Stale`].

use super::{CommitOutcome, TaskStore, DEFAULT_MAX_ATTEMPTS};
use crate::error::Result;
use crate::models::{
    AttemptOutcome, AttemptRecord, ClaimedTask, EntityKind, EntityRef, EntityStatusView,
    FailureKind, Lease, NewTask, OptimizationResult, ReliabilityReport, Task, TaskFailure,
    TaskOutput, TaskType,
};
use crate::state_machine::{EntityStatus, TaskStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

const CLAIM_SQL: &str = r#"
WITH candidates AS (
    SELECT ranked.id
    FROM (
        SELECT t.id, t.task_type, t.target_id, t.created_at,
               row_number() OVER (
                   PARTITION BY t.task_type, t.target_id
                   ORDER BY t.created_at, t.id
               ) AS key_rank
        FROM task_queue t
        WHERE t.status IN ('queued', 'processing')
          AND t.visible_at <= NOW()
    ) ranked
    WHERE ranked.key_rank = 1
      AND NOT EXISTS (
          SELECT 1
          FROM task_queue live
          WHERE live.task_type = ranked.task_type
            AND live.target_id = ranked.target_id
            AND live.status = 'processing'
            AND live.visible_at > NOW()
      )
    ORDER BY ranked.created_at, ranked.id
    LIMIT $2
),
locked AS (
    SELECT t.id, t.status AS previous_status
    FROM task_queue t
    JOIN candidates c ON c.id = t.id
    WHERE t.status IN ('queued', 'processing')
      AND t.visible_at <= NOW()
    ORDER BY t.created_at, t.id
    FOR UPDATE OF t SKIP LOCKED
),
claimed AS (
    UPDATE task_queue t
    SET status = 'processing',
        claim_owner = $1,
        lease_version = t.lease_version + 1,
        claim_count = t.claim_count + 1,
        visible_at = NOW() + make_interval(secs => $3::float8),
        updated_at = NOW()
    FROM locked
    WHERE t.id = locked.id
    RETURNING t.id, t.task_type, t.payload, t.target_id, t.status, t.attempts, t.max_attempts,
              t.last_error, t.last_error_kind, t.visible_at, t.claim_owner, t.lease_version,
              t.claim_count, t.created_at, t.updated_at,
              (locked.previous_status = 'processing') AS reclaimed
),
job_claims AS (
    SELECT target_id,
           bool_or(task_type = 'optimize') AS optimize,
           bool_or(task_type = 'embed_job') AS embed
    FROM claimed
    WHERE task_type IN ('optimize', 'embed_job')
    GROUP BY target_id
),
processing_jobs AS (
    UPDATE jobs j
    SET status = CASE WHEN c.optimize THEN 'processing' ELSE j.status END,
        embedding_status = CASE WHEN c.embed THEN 'processing' ELSE j.embedding_status END,
        updated_at = NOW()
    FROM job_claims c
    WHERE j.id = c.target_id
    RETURNING j.id
),
processing_resume_versions AS (
    UPDATE resume_versions r
    SET embedding_status = 'processing'
    FROM claimed c
    WHERE c.task_type = 'embed_resume'
      AND r.id = c.target_id
    RETURNING r.id
)
SELECT * FROM claimed
"#;

#[derive(FromRow)]
struct ClaimedTaskRow {
    #[sqlx(flatten)]
    task: Task,
    reclaimed: bool,
}

#[derive(FromRow)]
struct TaskKeyRow {
    task_type: TaskType,
    target_id: Uuid,
}

#[derive(FromRow)]
struct LatestTaskRow {
    status: TaskStatus,
    last_error_kind: Option<FailureKind>,
}

#[derive(FromRow)]
struct OutcomeCountRow {
    outcome: AttemptOutcome,
    count: i64,
}

#[derive(Debug, Clone)]
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Write the denormalised status of the entity a task works on
    async fn update_entity_status(
        tx: &mut Transaction<'_, Postgres>,
        task_type: TaskType,
        target_id: Uuid,
        status: EntityStatus,
    ) -> Result<()> {
        let sql = match task_type {
            TaskType::Optimize => "UPDATE jobs SET status = $2, updated_at = NOW() WHERE id = $1",
            TaskType::EmbedJob => {
                "UPDATE jobs SET embedding_status = $2, updated_at = NOW() WHERE id = $1"
            }
            TaskType::EmbedResume => {
                "UPDATE resume_versions SET embedding_status = $2 WHERE id = $1"
            }
        };
        sqlx::query(sql)
            .bind(target_id)
            .bind(status.as_str())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Mark the entity queued on enqueue, leaving an in-flight one alone
    async fn mark_entity_queued(
        tx: &mut Transaction<'_, Postgres>,
        task_type: TaskType,
        target_id: Uuid,
    ) -> Result<()> {
        let sql = match task_type {
            TaskType::Optimize => {
                "UPDATE jobs SET status = 'queued', updated_at = NOW() \
                 WHERE id = $1 AND status <> 'processing'"
            }
            TaskType::EmbedJob => {
                "UPDATE jobs SET embedding_status = 'queued', updated_at = NOW() \
                 WHERE id = $1 AND embedding_status <> 'processing'"
            }
            TaskType::EmbedResume => {
                "UPDATE resume_versions SET embedding_status = 'queued' \
                 WHERE id = $1 AND embedding_status <> 'processing'"
            }
        };
        sqlx::query(sql).bind(target_id).execute(&mut **tx).await?;
        Ok(())
    }

    async fn insert_attempt(
        tx: &mut Transaction<'_, Postgres>,
        attempt: &AttemptRecord,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO task_attempts
                (task_id, task_type, attempt_no, outcome, llm_called, latency_ms, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(attempt.task_id)
        .bind(attempt.task_type.as_str())
        .bind(attempt.attempt_no)
        .bind(attempt.outcome)
        .bind(attempt.llm_called)
        .bind(attempt.latency_ms)
        .bind(attempt.recorded_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn insert_optimization(
        tx: &mut Transaction<'_, Postgres>,
        task_id: Uuid,
        result: &crate::models::NewOptimizationResult,
    ) -> Result<()> {
        // Serialise version numbering per job
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1::text, 0))")
            .bind(result.job_id)
            .execute(&mut **tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO optimizations
                (id, job_id, owner_id, resume_version_id, task_id, version_no, score,
                 report, preview_markdown, change_log, input_fingerprint, created_at)
            SELECT $1, $2, $3, $4, $5, COALESCE(MAX(version_no), 0) + 1, $6,
                   $7, $8, $9, $10, NOW()
            FROM optimizations
            WHERE job_id = $2
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(result.job_id)
        .bind(result.owner_id)
        .bind(result.resume_version_id)
        .bind(task_id)
        .bind(result.score())
        .bind(Json(result.stored_report()))
        .bind(&result.report.preview_markdown)
        .bind(Json(&result.report.change_log))
        .bind(&result.input_fingerprint)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Apply a guarded failure transition. `delay` re-queues, `None` fails terminally.
    async fn record_failure(
        &self,
        claimed: &ClaimedTask,
        failure: &TaskFailure,
        delay: Option<Duration>,
        attempt: &AttemptRecord,
    ) -> Result<CommitOutcome> {
        let mut tx = self.pool.begin().await?;

        let (next_status, delay_secs) = match delay {
            Some(delay) => (TaskStatus::Queued, delay.as_secs_f64()),
            None => (TaskStatus::Failed, 0.0),
        };

        let row = sqlx::query_as::<_, TaskKeyRow>(
            r#"
            UPDATE task_queue
            SET status = $4,
                attempts = attempts + 1,
                last_error = $5,
                last_error_kind = $6,
                visible_at = CASE WHEN $4 = 'queued'
                                  THEN NOW() + make_interval(secs => $7::float8)
                                  ELSE visible_at END,
                claim_owner = CASE WHEN $4 = 'queued' THEN NULL ELSE claim_owner END,
                updated_at = NOW()
            WHERE id = $1
              AND status = 'processing'
              AND claim_owner = $2
              AND lease_version = $3
            RETURNING task_type, target_id
            "#,
        )
        .bind(claimed.id())
        .bind(&claimed.lease.owner)
        .bind(claimed.lease.version)
        .bind(next_status.as_str())
        .bind(failure.stored_message())
        .bind(failure.kind.as_str())
        .bind(delay_secs)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            error!(task_id = %claimed.id(), error = %e, "Failed to record task failure");
            e
        })?;

        let Some(key) = row else {
            tx.rollback().await?;
            return Ok(CommitOutcome::Stale);
        };

        Self::update_entity_status(&mut tx, key.task_type, key.target_id, next_status.into())
            .await?;
        Self::insert_attempt(&mut tx, attempt).await?;
        tx.commit().await?;
        Ok(CommitOutcome::Applied)
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    #[instrument(skip(self, new_task), fields(task_type = %new_task.task_type()))]
    async fn enqueue(&self, new_task: &NewTask) -> Result<Task> {
        let target = new_task.payload.target();
        let task_type = new_task.task_type();
        let mut tx = self.pool.begin().await?;

        let task = sqlx::query_as::<_, Task>(
            r#"
            INSERT INTO task_queue (id, task_type, payload, target_id, status, max_attempts, visible_at)
            VALUES ($1, $2, $3, $4, 'queued', $5, NOW())
            RETURNING id, task_type, payload, target_id, status, attempts, max_attempts,
                      last_error, last_error_kind, visible_at, claim_owner, lease_version,
                      claim_count, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(task_type.as_str())
        .bind(new_task.payload.to_value()?)
        .bind(target.id)
        .bind(new_task.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS))
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to enqueue task");
            e
        })?;

        Self::mark_entity_queued(&mut tx, task_type, target.id).await?;
        tx.commit().await?;

        debug!(task_id = %task.id, target = %target, "Task enqueued");
        Ok(task)
    }

    #[instrument(skip(self))]
    async fn claim(
        &self,
        owner: &str,
        batch_size: u32,
        lease_duration: Duration,
    ) -> Result<Vec<ClaimedTask>> {
        let rows = sqlx::query_as::<_, ClaimedTaskRow>(CLAIM_SQL)
            .bind(owner)
            .bind(i64::from(batch_size))
            .bind(lease_duration.as_secs_f64())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to claim tasks");
                e
            })?;

        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let mut claimed: Vec<ClaimedTask> = rows
            .into_iter()
            .map(|row| ClaimedTask::from_task(row.task, row.reclaimed))
            .collect();
        claimed.sort_by_key(|c| (c.task.created_at, c.task.id));

        let reclaimed = claimed.iter().filter(|c| c.reclaimed).count();
        info!(
            claimed_count = claimed.len(),
            reclaimed_count = reclaimed,
            "Successfully claimed tasks"
        );
        Ok(claimed)
    }

    #[instrument(skip(self, lease))]
    async fn extend_lease(
        &self,
        task_id: Uuid,
        lease: &Lease,
        duration: Duration,
    ) -> Result<Option<Lease>> {
        let expires_at: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            UPDATE task_queue
            SET visible_at = NOW() + make_interval(secs => $4::float8),
                updated_at = NOW()
            WHERE id = $1
              AND status = 'processing'
              AND claim_owner = $2
              AND lease_version = $3
            RETURNING visible_at
            "#,
        )
        .bind(task_id)
        .bind(&lease.owner)
        .bind(lease.version)
        .bind(duration.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(expires_at.map(|expires_at| Lease {
            owner: lease.owner.clone(),
            version: lease.version,
            expires_at,
        }))
    }

    #[instrument(skip(self, claimed, output, attempt), fields(task_id = %claimed.id()))]
    async fn complete(
        &self,
        claimed: &ClaimedTask,
        output: &TaskOutput,
        attempt: &AttemptRecord,
    ) -> Result<CommitOutcome> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, TaskKeyRow>(
            r#"
            UPDATE task_queue
            SET status = 'complete', updated_at = NOW()
            WHERE id = $1
              AND status = 'processing'
              AND claim_owner = $2
              AND lease_version = $3
            RETURNING task_type, target_id
            "#,
        )
        .bind(claimed.id())
        .bind(&claimed.lease.owner)
        .bind(claimed.lease.version)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to complete task");
            e
        })?;

        let Some(key) = row else {
            tx.rollback().await?;
            warn!(lease_version = claimed.lease.version, "Completion lost its lease");
            return Ok(CommitOutcome::Stale);
        };

        if let TaskOutput::Optimized(result) = output {
            Self::insert_optimization(&mut tx, claimed.id(), result).await?;
        }
        Self::update_entity_status(&mut tx, key.task_type, key.target_id, EntityStatus::Complete)
            .await?;
        Self::insert_attempt(&mut tx, attempt).await?;
        tx.commit().await?;

        Ok(CommitOutcome::Applied)
    }

    async fn retry(
        &self,
        claimed: &ClaimedTask,
        failure: &TaskFailure,
        delay: Duration,
        attempt: &AttemptRecord,
    ) -> Result<CommitOutcome> {
        self.record_failure(claimed, failure, Some(delay), attempt).await
    }

    async fn fail(
        &self,
        claimed: &ClaimedTask,
        failure: &TaskFailure,
        attempt: &AttemptRecord,
    ) -> Result<CommitOutcome> {
        self.record_failure(claimed, failure, None, attempt).await
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>> {
        let task = sqlx::query_as::<_, Task>(
            r#"
            SELECT id, task_type, payload, target_id, status, attempts, max_attempts,
                   last_error, last_error_kind, visible_at, claim_owner, lease_version,
                   claim_count, created_at, updated_at
            FROM task_queue
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(task)
    }

    async fn status(&self, entity: EntityRef) -> Result<Option<EntityStatusView>> {
        let (primary_type, status, embedding_status) = match entity.kind {
            EntityKind::Job => {
                let row: Option<(EntityStatus, EntityStatus)> =
                    sqlx::query_as("SELECT status, embedding_status FROM jobs WHERE id = $1")
                        .bind(entity.id)
                        .fetch_optional(&self.pool)
                        .await?;
                let Some((status, embedding_status)) = row else {
                    return Ok(None);
                };
                (TaskType::Optimize, status, Some(embedding_status))
            }
            EntityKind::ResumeVersion => {
                let row: Option<EntityStatus> = sqlx::query_scalar(
                    "SELECT embedding_status FROM resume_versions WHERE id = $1",
                )
                .bind(entity.id)
                .fetch_optional(&self.pool)
                .await?;
                let Some(status) = row else {
                    return Ok(None);
                };
                (TaskType::EmbedResume, status, Some(status))
            }
        };

        let result = match entity.kind {
            EntityKind::Job => {
                sqlx::query_as::<_, OptimizationResult>(
                    "SELECT * FROM optimizations WHERE job_id = $1 ORDER BY version_no DESC LIMIT 1",
                )
                .bind(entity.id)
                .fetch_optional(&self.pool)
                .await?
            }
            EntityKind::ResumeVersion => None,
        };

        let latest = sqlx::query_as::<_, LatestTaskRow>(
            r#"
            SELECT status, last_error_kind
            FROM task_queue
            WHERE task_type = $1 AND target_id = $2
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(primary_type.as_str())
        .bind(entity.id)
        .fetch_optional(&self.pool)
        .await?;

        let error_summary = latest
            .filter(|row| row.status == TaskStatus::Failed)
            .and_then(|row| row.last_error_kind)
            .map(|kind| kind.user_summary().to_string());

        Ok(Some(EntityStatusView {
            entity,
            status,
            embedding_status,
            result,
            error_summary,
        }))
    }

    async fn find_optimization(
        &self,
        job_id: Uuid,
        input_fingerprint: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<OptimizationResult>> {
        let result = sqlx::query_as::<_, OptimizationResult>(
            r#"
            SELECT * FROM optimizations
            WHERE job_id = $1 AND input_fingerprint = $2 AND created_at >= $3
            ORDER BY version_no DESC
            LIMIT 1
            "#,
        )
        .bind(job_id)
        .bind(input_fingerprint)
        .bind(since)
        .fetch_optional(&self.pool)
        .await?;
        Ok(result)
    }

    async fn optimizations_for_job(&self, job_id: Uuid) -> Result<Vec<OptimizationResult>> {
        let results = sqlx::query_as::<_, OptimizationResult>(
            "SELECT * FROM optimizations WHERE job_id = $1 ORDER BY version_no",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(results)
    }

    async fn attempts_for_task(&self, task_id: Uuid) -> Result<Vec<AttemptRecord>> {
        let records = sqlx::query_as::<_, AttemptRecord>(
            r#"
            SELECT task_id, task_type, attempt_no, outcome, llm_called, latency_ms, recorded_at
            FROM task_attempts
            WHERE task_id = $1
            ORDER BY id
            "#,
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn reliability_report(&self) -> Result<ReliabilityReport> {
        let rows = sqlx::query_as::<_, OutcomeCountRow>(
            r#"
            SELECT outcome, COUNT(*) AS count
            FROM task_attempts
            WHERE task_type = 'optimize' AND llm_called
            GROUP BY outcome
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut report = ReliabilityReport::default();
        for row in rows {
            report.record_count(row.outcome, row.count);
        }
        Ok(report)
    }
}
