//! # Data Models
//!
//! Rows and value types shared by the stores, the processor, and the status
//! read surface.

pub mod attempt;
pub mod entity;
pub mod optimization;
pub mod outcome;
pub mod task;

pub use attempt::{AttemptOutcome, AttemptRecord, ReliabilityReport};
pub use entity::{EntityKind, EntityRef, EntityStatusView};
pub use optimization::{
    ContactInfo, Evidence, EvidenceSource, ExperienceItem, ExtractedEntities,
    NewOptimizationResult, OptimizationReport, OptimizationResult, ReportReliability,
    SkillFinding, StoredReport,
};
pub use outcome::{FailureKind, ProcessingOutcome, TaskFailure, TaskOutput, MAX_ERROR_LENGTH};
pub use task::{
    ClaimedTask, EmbedJobPayload, EmbedResumePayload, Lease, NewTask, OptimizePayload, Task,
    TaskPayload, TaskType,
};
