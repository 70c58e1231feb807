//! Dependent entities whose status mirrors the tasks working on them.

use crate::models::optimization::OptimizationResult;
use crate::state_machine::EntityStatus;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Job,
    ResumeVersion,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Job => "job",
            Self::ResumeVersion => "resume_version",
        }
    }
}

/// Typed reference to a job or resume version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: Uuid,
}

impl EntityRef {
    pub fn job(id: Uuid) -> Self {
        Self {
            kind: EntityKind::Job,
            id,
        }
    }

    pub fn resume_version(id: Uuid) -> Self {
        Self {
            kind: EntityKind::ResumeVersion,
            id,
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// Read view returned by `status(entity)`.
///
/// `status` is the primary status of the entity: the optimize status for a
/// job, the embedding status for a resume version. Jobs additionally expose
/// their embedding status. `result` is the latest optimization result, jobs only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityStatusView {
    pub entity: EntityRef,
    pub status: EntityStatus,
    pub embedding_status: Option<EntityStatus>,
    pub result: Option<OptimizationResult>,
    /// User-facing summary of the latest failure, never raw provider text
    pub error_summary: Option<String>,
}
