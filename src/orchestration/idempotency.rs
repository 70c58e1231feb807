//! # Idempotency Guard
//!
//! At most one task per dependent entity and task type runs at a time.
//!
//! Two rules, applied together at claim time:
//!
//! 1. A key holding a live lease (`processing`, lease not yet expired) blocks
//!    every other task with the same key.
//! 2. Within one claim batch only the oldest eligible task per key is taken.
//!
//! Tasks skipped by either rule stay `queued` and untouched; they are picked
//! up by a later poll once the running task finishes. The PostgreSQL store
//! expresses the same rules in its claim statement (`row_number()` per key
//! plus a `NOT EXISTS` over live leases).

use crate::models::{NewTask, Task, TaskType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

/// `(task_type, target_id)`: the unit of mutual exclusion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub task_type: TaskType,
    pub target_id: Uuid,
}

impl IdempotencyKey {
    pub fn new(task_type: TaskType, target_id: Uuid) -> Self {
        Self {
            task_type,
            target_id,
        }
    }
}

impl From<&Task> for IdempotencyKey {
    fn from(task: &Task) -> Self {
        Self::new(task.task_type, task.target_id)
    }
}

impl From<&NewTask> for IdempotencyKey {
    fn from(task: &NewTask) -> Self {
        Self::new(task.task_type(), task.payload.target().id)
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.task_type, self.target_id)
    }
}

/// Picks the tasks one claim may take
#[derive(Debug, Default)]
pub struct IdempotencyGuard {
    live: HashSet<IdempotencyKey>,
    admitted: HashSet<IdempotencyKey>,
}

impl IdempotencyGuard {
    /// Guard seeded with every key that holds a live lease at `now`
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>, now: DateTime<Utc>) -> Self {
        let live = tasks
            .into_iter()
            .filter(|task| task.holds_live_lease(now))
            .map(IdempotencyKey::from)
            .collect();
        Self {
            live,
            admitted: HashSet::new(),
        }
    }

    /// Whether `task` may join the batch. Call in FIFO order; a key is
    /// consumed by its first candidate whether or not that one is admitted.
    pub fn admit(&mut self, task: &Task) -> bool {
        let key = IdempotencyKey::from(task);
        self.admitted.insert(key) && !self.live.contains(&key)
    }

    /// Eligible tasks for one batch, oldest first, at most `batch_size`
    pub fn select<'a>(
        &mut self,
        candidates: impl IntoIterator<Item = &'a Task>,
        now: DateTime<Utc>,
        batch_size: usize,
    ) -> Vec<Uuid> {
        let mut eligible: Vec<&Task> = candidates
            .into_iter()
            .filter(|task| task.is_claimable(now))
            .collect();
        eligible.sort_by_key(|task| (task.created_at, task.id));

        eligible
            .into_iter()
            .filter(|task| self.admit(task))
            .take(batch_size)
            .map(|task| task.id)
            .collect()
    }
}
