//! # Optimization Results
//!
//! The structured report produced by the optimize handler and the immutable,
//! versioned rows it is stored as (`optimizations` table). A re-run inserts a
//! new `version_no`; existing rows are never updated.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

/// Where a piece of evidence was quoted from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceSource {
    Resume,
    Job,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Evidence {
    pub source: EvidenceSource,
    /// Verbatim excerpt supporting the finding
    pub excerpt: String,
    /// Retrieved resume chunk the excerpt came from, if any
    pub chunk_index: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SkillFinding {
    pub skill: String,
    pub evidence: Vec<Evidence>,
}

/// Structured output requested from the LLM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct OptimizationReport {
    /// Match score between 0 and 100
    pub score: i64,
    /// Job requirements the resume covers
    pub matched: Vec<SkillFinding>,
    /// Job requirements absent from the resume
    pub missing: Vec<SkillFinding>,
    /// Requirements only weakly supported by the resume
    pub weak: Vec<SkillFinding>,
    /// Concrete edits applied in the preview
    pub change_log: Vec<String>,
    /// The improved resume in Markdown
    pub preview_markdown: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ExperienceItem {
    pub role: String,
    pub company: String,
    pub duration: String,
    pub highlights: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ContactInfo {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub linkedin: Option<String>,
}

/// Structured facts parsed from the resume, stored beside the report
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ExtractedEntities {
    pub skills: Vec<String>,
    pub tools: Vec<String>,
    /// Degrees and certifications
    pub education: Vec<String>,
    pub experience: Vec<ExperienceItem>,
    pub contact: Option<ContactInfo>,
}

impl ExtractedEntities {
    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
            && self.tools.is_empty()
            && self.education.is_empty()
            && self.experience.is_empty()
            && self.contact.is_none()
    }
}

/// Provenance stored next to every report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportReliability {
    pub model: String,
    pub attempt_no: i32,
    pub retrieved_chunks: usize,
    pub translated: bool,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredReport {
    #[serde(flatten)]
    pub report: OptimizationReport,
    /// Absent when extraction was disabled or its reply was unusable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entities: Option<ExtractedEntities>,
    pub reliability: ReportReliability,
}

/// Handler output awaiting persistence
#[derive(Debug, Clone, PartialEq)]
pub struct NewOptimizationResult {
    pub job_id: Uuid,
    pub owner_id: Uuid,
    pub resume_version_id: Uuid,
    /// SHA-256 over the inputs that determine the result
    pub input_fingerprint: String,
    pub report: OptimizationReport,
    pub entities: Option<ExtractedEntities>,
    pub reliability: ReportReliability,
}

impl NewOptimizationResult {
    /// Score clamped into the stored range
    pub fn score(&self) -> i32 {
        self.report.score.clamp(0, 100) as i32
    }

    pub fn stored_report(&self) -> StoredReport {
        StoredReport {
            report: self.report.clone(),
            entities: self.entities.clone(),
            reliability: self.reliability.clone(),
        }
    }
}

/// A persisted row of `optimizations`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct OptimizationResult {
    pub id: Uuid,
    pub job_id: Uuid,
    pub owner_id: Uuid,
    pub resume_version_id: Uuid,
    pub task_id: Uuid,
    pub version_no: i32,
    pub score: i32,
    pub report: Json<StoredReport>,
    pub preview_markdown: String,
    pub change_log: Json<Vec<String>>,
    pub input_fingerprint: String,
    pub created_at: DateTime<Utc>,
}

impl OptimizationResult {
    /// Materialise a row from handler output
    pub fn from_new(
        new: &NewOptimizationResult,
        task_id: Uuid,
        version_no: i32,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id: new.job_id,
            owner_id: new.owner_id,
            resume_version_id: new.resume_version_id,
            task_id,
            version_no,
            score: new.score(),
            report: Json(new.stored_report()),
            preview_markdown: new.report.preview_markdown.clone(),
            change_log: Json(new.report.change_log.clone()),
            input_fingerprint: new.input_fingerprint.clone(),
            created_at,
        }
    }
}
