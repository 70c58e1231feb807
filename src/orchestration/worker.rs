//! # Worker
//!
//! The poll loop: claim a batch, run it with bounded parallelism, commit each
//! outcome, sleep when idle.
//!
//! ## Loop
//!
//! ```text
//! loop {
//!     claim(min(batch_size, max_concurrency)) ──► for_each_concurrent(max_concurrency) {
//!         process ──► Succeeded ──► ResultWriter::write      (→ complete)
//!                 └─► Failed    ──► RetryController::handle  (→ queued | failed)
//!     }
//!     idle? sleep(poll_interval)    store error? sleep(store backoff)
//! }
//! ```
//!
//! A poll never leases more tasks than it can run at once. Each task starts
//! right after its claim, so the handler timeout (shorter than the lease) also
//! bounds how long any lease is held before its outcome is committed.
//!
//! Shutdown is a `tokio::sync::watch` signal. The current batch always runs
//! to completion before the loop exits, so no claimed task is abandoned
//! mid-write; anything still leased by a killed process is reclaimed after
//! its lease expires.

use crate::config::{BackoffConfig, WorkerConfig};
use crate::error::Result;
use crate::logging::{log_error, log_task_operation};
use crate::models::{AttemptRecord, ClaimedTask, ProcessingOutcome};
use crate::orchestration::backoff_calculator::BackoffCalculator;
use crate::orchestration::result_writer::ResultWriter;
use crate::orchestration::retry_controller::{RetryController, RetryDecision};
use crate::orchestration::task_claimer::{TaskClaimer, TaskClaimerConfig};
use crate::orchestration::task_processor::TaskProcessor;
use crate::store::TaskStore;
use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Invalid-output rate above which the periodic report warns
const INVALID_OUTPUT_RATE_TARGET: f64 = 0.02;

/// How one claimed task ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskResolution {
    Completed,
    Retried,
    Failed,
    /// The lease was lost; the outcome was dropped
    Stale,
}

/// Counts for one claimed batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub claimed: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    pub stale: usize,
    /// Outcomes that could not be committed because the store failed
    pub store_errors: usize,
}

impl BatchSummary {
    fn record(&mut self, resolution: Result<TaskResolution>) {
        match resolution {
            Ok(TaskResolution::Completed) => self.completed += 1,
            Ok(TaskResolution::Retried) => self.retried += 1,
            Ok(TaskResolution::Failed) => self.failed += 1,
            Ok(TaskResolution::Stale) => self.stale += 1,
            Err(_) => self.store_errors += 1,
        }
    }
}

/// Counters since the worker started
#[derive(Debug, Default)]
pub struct WorkerStats {
    batches: AtomicU64,
    claimed: AtomicU64,
    completed: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    stale: AtomicU64,
    store_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStatsSnapshot {
    pub batches: u64,
    pub claimed: u64,
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
    pub stale: u64,
    pub store_errors: u64,
}

impl WorkerStats {
    fn add(&self, summary: &BatchSummary) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.claimed.fetch_add(summary.claimed as u64, Ordering::Relaxed);
        self.completed.fetch_add(summary.completed as u64, Ordering::Relaxed);
        self.retried.fetch_add(summary.retried as u64, Ordering::Relaxed);
        self.failed.fetch_add(summary.failed as u64, Ordering::Relaxed);
        self.stale.fetch_add(summary.stale as u64, Ordering::Relaxed);
        self.store_errors.fetch_add(summary.store_errors as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            claimed: self.claimed.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }
}

/// Worker id from configuration, else `<hostname>-<short uuid>`
pub fn resolve_worker_id(config: &WorkerConfig) -> String {
    if let Some(id) = config.worker_id.as_deref().filter(|id| !id.is_empty()) {
        return id.to_string();
    }
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{host}-{}", &suffix[..8])
}

pub struct Worker {
    claimer: TaskClaimer,
    processor: Arc<TaskProcessor>,
    writer: ResultWriter,
    retry: RetryController,
    store: Arc<dyn TaskStore>,
    config: WorkerConfig,
    stats: WorkerStats,
    last_report: Mutex<Option<Instant>>,
}

impl Worker {
    pub fn new(
        store: Arc<dyn TaskStore>,
        processor: Arc<TaskProcessor>,
        worker: &WorkerConfig,
        backoff: &BackoffConfig,
    ) -> Self {
        let worker_id = resolve_worker_id(worker);
        Self {
            claimer: TaskClaimer::new(store.clone(), worker_id, TaskClaimerConfig::from(worker)),
            processor,
            writer: ResultWriter::new(store.clone()),
            retry: RetryController::new(store.clone(), BackoffCalculator::from_config(backoff)),
            store,
            config: worker.clone(),
            stats: WorkerStats::default(),
            last_report: Mutex::new(None),
        }
    }

    pub fn worker_id(&self) -> &str {
        self.claimer.worker_id()
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Claim one batch and drive every task to a committed outcome.
    ///
    /// Fails only when the claim itself fails; commit errors are counted in
    /// [`BatchSummary::store_errors`].
    pub async fn run_once(&self) -> Result<BatchSummary> {
        let batch = self.claimer.claim_ready_tasks(self.config.claim_limit()).await?;
        let summary = Mutex::new(BatchSummary {
            claimed: batch.len(),
            ..BatchSummary::default()
        });

        futures::stream::iter(batch)
            .for_each_concurrent(self.config.max_concurrency, |claimed| {
                let summary = &summary;
                async move {
                    let resolution = self.execute(claimed).await;
                    summary.lock().record(resolution);
                }
            })
            .await;

        let summary = summary.into_inner();
        self.stats.add(&summary);
        if summary.claimed > 0 {
            debug!(worker_id = %self.worker_id(), ?summary, "Batch finished");
        }
        Ok(summary)
    }

    /// Poll until `shutdown` turns true (or its sender is dropped)
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            worker_id = %self.worker_id(),
            batch_size = self.config.claim_limit(),
            max_concurrency = self.config.max_concurrency,
            "Starting worker loop"
        );
        let mut consecutive_failures: u32 = 0;

        while !*shutdown.borrow() {
            let wait = match self.run_once().await {
                Ok(summary) if summary.store_errors > 0 => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    self.config.store_error_backoff(consecutive_failures)
                }
                Ok(summary) => {
                    consecutive_failures = 0;
                    if summary.claimed == 0 {
                        self.config.poll_interval()
                    } else {
                        Duration::ZERO
                    }
                }
                Err(e) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    let backoff = self.config.store_error_backoff(consecutive_failures);
                    log_error(
                        "worker",
                        "claim",
                        &e.to_string(),
                        Some(&format!("consecutive_failures={consecutive_failures}")),
                    );
                    backoff
                }
            };

            self.maybe_report_reliability().await;

            if wait.is_zero() {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        debug!("Shutdown sender dropped");
                        break;
                    }
                }
            }
        }

        info!(worker_id = %self.worker_id(), stats = ?self.stats(), "Worker loop ended");
        Ok(())
    }

    async fn execute(&self, claimed: ClaimedTask) -> Result<TaskResolution> {
        let started = Instant::now();
        let outcome = self.process_with_heartbeat(&claimed).await;
        let attempt = AttemptRecord::for_outcome(&claimed, &outcome, started.elapsed(), Utc::now());

        let task_type = claimed.task.task_type.as_str();
        let result = match &outcome {
            ProcessingOutcome::Succeeded(output) => self
                .writer
                .write(&claimed, output, &attempt)
                .await
                .map(|commit| {
                    if commit.is_applied() {
                        log_task_operation(
                            "complete",
                            claimed.id(),
                            task_type,
                            "complete",
                            Some(output.kind()),
                        );
                        TaskResolution::Completed
                    } else {
                        TaskResolution::Stale
                    }
                }),
            ProcessingOutcome::Failed(failure) => self
                .retry
                .handle_failure(&claimed, failure, &attempt)
                .await
                .map(|resolution| match (resolution.commit.is_applied(), resolution.decision) {
                    (false, _) => TaskResolution::Stale,
                    (true, RetryDecision::Retry(_)) => {
                        log_task_operation(
                            "retry",
                            claimed.id(),
                            task_type,
                            "queued",
                            Some(failure.kind.as_str()),
                        );
                        TaskResolution::Retried
                    }
                    (true, RetryDecision::Fail(_)) => {
                        log_task_operation(
                            "fail",
                            claimed.id(),
                            task_type,
                            "failed",
                            Some(failure.kind.as_str()),
                        );
                        TaskResolution::Failed
                    }
                }),
        };

        if let Err(e) = &result {
            log_error(
                "worker",
                "commit_outcome",
                &e.to_string(),
                Some(&format!("task_id={}", claimed.id())),
            );
        }
        result
    }

    /// Run the handler, extending the lease in the background when enabled
    async fn process_with_heartbeat(&self, claimed: &ClaimedTask) -> ProcessingOutcome {
        let processing = self.processor.process(claimed);
        if !self.config.heartbeat_enabled {
            return processing.await;
        }

        tokio::pin!(processing);
        tokio::select! {
            outcome = &mut processing => outcome,
            _ = self.heartbeat(claimed) => processing.await,
        }
    }

    /// Extend the lease every heartbeat interval; returns once it is lost
    async fn heartbeat(&self, claimed: &ClaimedTask) {
        let mut lease = claimed.lease.clone();
        let mut interval = tokio::time::interval(self.config.heartbeat_interval());
        interval.tick().await;
        loop {
            interval.tick().await;
            match self.claimer.extend_claim(claimed.id(), &lease).await {
                Ok(Some(extended)) => lease = extended,
                Ok(None) => return,
                Err(e) => {
                    // Keep trying; the lease may still be held
                    warn!(task_id = %claimed.id(), error = %e, "Heartbeat failed");
                }
            }
        }
    }

    async fn maybe_report_reliability(&self) {
        let interval = Duration::from_secs(self.config.reliability_report_interval_seconds);
        if interval.is_zero() {
            return;
        }
        {
            let mut last = self.last_report.lock();
            match *last {
                Some(at) if at.elapsed() < interval => return,
                _ => *last = Some(Instant::now()),
            }
        }

        match self.store.reliability_report().await {
            Ok(report) if report.total_optimize_attempts == 0 => {}
            Ok(report) => {
                let rate = report.invalid_output_rate();
                if rate > INVALID_OUTPUT_RATE_TARGET {
                    warn!(
                        invalid_output_rate = rate,
                        invalid_outputs = report.invalid_outputs,
                        total_optimize_attempts = report.total_optimize_attempts,
                        "Invalid-output rate above target"
                    );
                } else {
                    info!(
                        invalid_output_rate = rate,
                        total_optimize_attempts = report.total_optimize_attempts,
                        "Optimize reliability"
                    );
                }
            }
            Err(e) => error!(error = %e, "Failed to compute reliability report"),
        }
    }
}
