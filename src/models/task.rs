//! # Task Model
//!
//! A unit of background work stored in the `task_queue` table.
//!
//! ## Database Schema
//!
//! Maps to `task_queue`:
//! - `id`: UUID primary key
//! - `task_type`: `embed_resume | embed_job | optimize`
//! - `payload`: JSONB, typed per task type (see [`TaskPayload`])
//! - `target_id`: the dependent entity, derived from the payload at enqueue time
//! - `status`, `attempts`, `max_attempts`, `last_error`, `last_error_kind`
//! - `visible_at`: earliest claim time while queued, lease expiry while processing
//! - `claim_owner`, `lease_version`, `claim_count`: lease bookkeeping
//!
//! `(task_type, target_id)` is the idempotency key: at most one task per key
//! holds a live lease at any time.

use crate::models::entity::EntityRef;
use crate::models::outcome::FailureKind;
use crate::state_machine::TaskStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum TaskType {
    EmbedResume,
    EmbedJob,
    Optimize,
}

impl TaskType {
    pub const ALL: [TaskType; 3] = [Self::EmbedResume, Self::EmbedJob, Self::Optimize];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmbedResume => "embed_resume",
            Self::EmbedJob => "embed_job",
            Self::Optimize => "optimize",
        }
    }

    /// Build the entity reference a task of this type works on
    pub fn target(&self, target_id: Uuid) -> EntityRef {
        match self {
            Self::EmbedResume => EntityRef::resume_version(target_id),
            Self::EmbedJob | Self::Optimize => EntityRef::job(target_id),
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "embed_resume" => Ok(Self::EmbedResume),
            "embed_job" => Ok(Self::EmbedJob),
            "optimize" => Ok(Self::Optimize),
            _ => Err(format!("Unknown task type: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedResumePayload {
    pub user_id: Uuid,
    pub resume_version_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedJobPayload {
    pub user_id: Uuid,
    pub job_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizePayload {
    pub user_id: Uuid,
    pub job_id: Uuid,
    pub resume_version_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_lang: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jd_lang: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_output_lang: Option<String>,
}

impl OptimizePayload {
    /// Output language: desired, else the resume's, else English
    pub fn target_lang(&self) -> &str {
        non_empty(&self.desired_output_lang)
            .or_else(|| non_empty(&self.resume_lang))
            .unwrap_or("en")
    }
}

fn non_empty(lang: &Option<String>) -> Option<&str> {
    lang.as_deref().filter(|lang| !lang.is_empty())
}

/// Payload typed per task type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPayload {
    EmbedResume(EmbedResumePayload),
    EmbedJob(EmbedJobPayload),
    Optimize(OptimizePayload),
}

impl TaskPayload {
    pub fn task_type(&self) -> TaskType {
        match self {
            Self::EmbedResume(_) => TaskType::EmbedResume,
            Self::EmbedJob(_) => TaskType::EmbedJob,
            Self::Optimize(_) => TaskType::Optimize,
        }
    }

    /// The dependent entity this payload works on
    pub fn target(&self) -> EntityRef {
        match self {
            Self::EmbedResume(p) => EntityRef::resume_version(p.resume_version_id),
            Self::EmbedJob(p) => EntityRef::job(p.job_id),
            Self::Optimize(p) => EntityRef::job(p.job_id),
        }
    }

    /// Owning user, also the vector index namespace
    pub fn owner_id(&self) -> Uuid {
        match self {
            Self::EmbedResume(p) => p.user_id,
            Self::EmbedJob(p) => p.user_id,
            Self::Optimize(p) => p.user_id,
        }
    }

    /// Decode a stored payload for the given task type
    pub fn parse(task_type: TaskType, value: &serde_json::Value) -> serde_json::Result<Self> {
        Ok(match task_type {
            TaskType::EmbedResume => Self::EmbedResume(serde_json::from_value(value.clone())?),
            TaskType::EmbedJob => Self::EmbedJob(serde_json::from_value(value.clone())?),
            TaskType::Optimize => Self::Optimize(serde_json::from_value(value.clone())?),
        })
    }

    pub fn to_value(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            Self::EmbedResume(p) => serde_json::to_value(p),
            Self::EmbedJob(p) => serde_json::to_value(p),
            Self::Optimize(p) => serde_json::to_value(p),
        }
    }
}

/// Request to enqueue a task
#[derive(Debug, Clone)]
pub struct NewTask {
    pub payload: TaskPayload,
    /// Retry budget; the configured default applies when absent
    pub max_attempts: Option<i32>,
}

impl NewTask {
    pub fn new(payload: TaskPayload) -> Self {
        Self {
            payload,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn embed_resume(user_id: Uuid, resume_version_id: Uuid) -> Self {
        Self::new(TaskPayload::EmbedResume(EmbedResumePayload {
            user_id,
            resume_version_id,
            resume_id: None,
        }))
    }

    pub fn embed_job(user_id: Uuid, job_id: Uuid) -> Self {
        Self::new(TaskPayload::EmbedJob(EmbedJobPayload { user_id, job_id }))
    }

    pub fn optimize(user_id: Uuid, job_id: Uuid, resume_version_id: Uuid) -> Self {
        Self::new(TaskPayload::Optimize(OptimizePayload {
            user_id,
            job_id,
            resume_version_id,
            instructions: None,
            resume_lang: None,
            jd_lang: None,
            desired_output_lang: None,
        }))
    }

    pub fn task_type(&self) -> TaskType {
        self.payload.task_type()
    }
}

/// A row of `task_queue`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub target_id: Uuid,
    pub status: TaskStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub last_error_kind: Option<FailureKind>,
    pub visible_at: DateTime<Utc>,
    pub claim_owner: Option<String>,
    pub lease_version: i64,
    pub claim_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn target(&self) -> EntityRef {
        self.task_type.target(self.target_id)
    }

    pub fn typed_payload(&self) -> serde_json::Result<TaskPayload> {
        TaskPayload::parse(self.task_type, &self.payload)
    }

    /// Queued and visible, or processing with a lapsed lease
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, TaskStatus::Queued | TaskStatus::Processing) && self.visible_at <= now
    }

    /// Processing with a lease that has not yet expired
    pub fn holds_live_lease(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Processing && self.visible_at > now
    }
}

/// Token proving ownership of a claim. Every write after the claim must
/// present it; a mismatch means the lease was lost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: String,
    pub version: i64,
    pub expires_at: DateTime<Utc>,
}

/// A task leased to a worker
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub task: Task,
    pub lease: Lease,
    /// The previous lease on this task had expired
    pub reclaimed: bool,
}

impl ClaimedTask {
    pub fn from_task(task: Task, reclaimed: bool) -> Self {
        let lease = Lease {
            owner: task.claim_owner.clone().unwrap_or_default(),
            version: task.lease_version,
            expires_at: task.visible_at,
        };
        Self {
            task,
            lease,
            reclaimed,
        }
    }

    pub fn id(&self) -> Uuid {
        self.task.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_target_derivation() {
        let user = Uuid::new_v4();
        let job = Uuid::new_v4();
        let version = Uuid::new_v4();

        let optimize = NewTask::optimize(user, job, version);
        assert_eq!(optimize.payload.target(), EntityRef::job(job));
        assert_eq!(optimize.task_type(), TaskType::Optimize);

        let embed = NewTask::embed_resume(user, version);
        assert_eq!(embed.payload.target(), EntityRef::resume_version(version));
        assert_eq!(embed.payload.owner_id(), user);
    }

    #[test]
    fn test_payload_parse_rejects_missing_fields() {
        let value = json!({ "user_id": Uuid::new_v4() });
        assert!(TaskPayload::parse(TaskType::EmbedJob, &value).is_err());
    }

    #[test]
    fn test_payload_value_round_trip_keeps_options() {
        let payload = TaskPayload::Optimize(OptimizePayload {
            user_id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            resume_version_id: Uuid::new_v4(),
            instructions: Some("Emphasise leadership".to_string()),
            resume_lang: Some("ar".to_string()),
            jd_lang: None,
            desired_output_lang: None,
        });
        let value = payload.to_value().unwrap();
        assert!(value.get("jd_lang").is_none());
        assert_eq!(TaskPayload::parse(TaskType::Optimize, &value).unwrap(), payload);
    }

    #[test]
    fn test_target_lang_fallbacks() {
        let mut payload = OptimizePayload {
            user_id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            resume_version_id: Uuid::new_v4(),
            instructions: None,
            resume_lang: None,
            jd_lang: None,
            desired_output_lang: None,
        };
        assert_eq!(payload.target_lang(), "en");
        payload.resume_lang = Some("ar".to_string());
        assert_eq!(payload.target_lang(), "ar");
        payload.desired_output_lang = Some("en".to_string());
        assert_eq!(payload.target_lang(), "en");

        // An empty desired language still falls through to the resume's
        payload.desired_output_lang = Some(String::new());
        assert_eq!(payload.target_lang(), "ar");
        payload.resume_lang = Some(String::new());
        assert_eq!(payload.target_lang(), "en");
    }

    #[test]
    fn test_task_type_parsing() {
        for task_type in TaskType::ALL {
            assert_eq!(task_type.as_str().parse::<TaskType>().unwrap(), task_type);
        }
        assert!("embed".parse::<TaskType>().is_err());
    }
}
