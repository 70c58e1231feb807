//! # Task Claimer
//!
//! Leases eligible tasks to one worker.
//!
//! ## Key Features
//!
//! - **Atomic Claiming**: delegated to [`TaskStore::claim`], which moves rows to
//!   `processing` in a single statement (`FOR UPDATE SKIP LOCKED` in Postgres)
//! - **FIFO**: oldest `created_at` first
//! - **Bounded Batches**: requests above `max_batch_size` are capped
//! - **Crash Recovery**: tasks whose lease expired are claimable again
//! - **Heartbeat Support**: leases can be extended during long handlers
//!
//! ## Usage
//!
//! ```rust,no_run
//! use resume_orchestrator::orchestration::task_claimer::{TaskClaimer, TaskClaimerConfig};
//! use resume_orchestrator::store::InMemoryTaskStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> resume_orchestrator::Result<()> {
//! let store = Arc::new(InMemoryTaskStore::new());
//! let claimer = TaskClaimer::new(store, "worker-host123".to_string(), TaskClaimerConfig::default());
//!
//! for claimed in claimer.claim_ready_tasks(5).await? {
//!     println!("claimed {} until {}", claimed.id(), claimed.lease.expires_at);
//! }
//! # Ok(())
//! # }
//! ```

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::models::{ClaimedTask, Lease};
use crate::store::TaskStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Configuration for task claiming behavior
#[derive(Debug, Clone)]
pub struct TaskClaimerConfig {
    /// Maximum number of tasks to claim in a single batch
    pub max_batch_size: u32,
    /// How long a claim stays valid without a heartbeat
    pub lease_duration: Duration,
}

impl Default for TaskClaimerConfig {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for TaskClaimerConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            max_batch_size: config.max_batch_size,
            lease_duration: config.lease_duration(),
        }
    }
}

/// Task claiming component for one worker
pub struct TaskClaimer {
    store: Arc<dyn TaskStore>,
    worker_id: String,
    config: TaskClaimerConfig,
}

impl TaskClaimer {
    pub fn new(store: Arc<dyn TaskStore>, worker_id: String, config: TaskClaimerConfig) -> Self {
        Self {
            store,
            worker_id,
            config,
        }
    }

    /// Claim up to `limit` tasks (capped at `max_batch_size`), oldest first.
    ///
    /// An empty batch is the normal idle result.
    #[instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn claim_ready_tasks(&self, limit: u32) -> Result<Vec<ClaimedTask>> {
        let actual_limit = limit.min(self.config.max_batch_size);
        if actual_limit == 0 {
            return Ok(Vec::new());
        }

        let claimed = self
            .store
            .claim(&self.worker_id, actual_limit, self.config.lease_duration)
            .await?;

        if claimed.is_empty() {
            debug!("No ready tasks available for claiming");
            return Ok(claimed);
        }

        let reclaimed = claimed.iter().filter(|c| c.reclaimed).count();
        info!(
            claimed_count = claimed.len(),
            reclaimed_count = reclaimed,
            "Claimed tasks"
        );
        if reclaimed > 0 {
            warn!(
                reclaimed_count = reclaimed,
                "Reclaimed tasks whose previous lease expired"
            );
        }

        Ok(claimed)
    }

    /// Extend a claim (heartbeat). Returns the new lease, or `None` when the
    /// lease was already lost to another worker.
    #[instrument(skip(self, lease), fields(worker_id = %self.worker_id))]
    pub async fn extend_claim(&self, task_id: uuid::Uuid, lease: &Lease) -> Result<Option<Lease>> {
        let extended = self
            .store
            .extend_lease(task_id, lease, self.config.lease_duration)
            .await?;

        match &extended {
            Some(lease) => debug!(%task_id, expires_at = %lease.expires_at, "Task claim extended"),
            None => warn!(%task_id, "Task claim was not extended (lease lost)"),
        }
        Ok(extended)
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn config(&self) -> &TaskClaimerConfig {
        &self.config
    }
}
