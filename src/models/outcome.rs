//! Handler outcomes and the failure taxonomy.

use crate::models::optimization::NewOptimizationResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Upper bound on stored error text
pub const MAX_ERROR_LENGTH: usize = 500;

/// Failure taxonomy driving retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum FailureKind {
    /// Timeouts, 5xx, rate limits, network errors
    Transient,
    /// Output that failed schema or consistency checks
    Validation,
    /// Missing entities, ownership mismatch, bad payloads, provider rejections
    Permanent,
}

impl FailureKind {
    /// Whether another attempt may succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Validation => "validation",
            Self::Permanent => "permanent",
        }
    }

    /// Message safe to show to end users
    pub fn user_summary(&self) -> &'static str {
        match self {
            Self::Transient => "A temporary service problem interrupted processing. Please try again later.",
            Self::Validation => "The generated result did not pass validation. Please try again.",
            Self::Permanent => "The request could not be processed. Check that the inputs exist and belong to you.",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed handler execution, captured as data
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Minimum delay requested by the provider (rate limits)
    pub retry_after: Option<Duration>,
    /// The LLM was called during the failed attempt
    pub llm_called: bool,
    /// The LLM answered but its reply failed schema or consistency checks
    pub invalid_output: bool,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
            llm_called: false,
            invalid_output: false,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Validation, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Permanent, message)
    }

    /// A validation failure of the LLM's own reply
    pub fn invalid_output(message: impl Into<String>) -> Self {
        Self {
            llm_called: true,
            invalid_output: true,
            ..Self::validation(message)
        }
    }

    /// Mark the failure as happening at or after the LLM call
    pub fn after_llm_call(mut self) -> Self {
        self.llm_called = true;
        self
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    /// Message prefixed with the failure kind and cut to `MAX_ERROR_LENGTH` characters
    pub fn stored_message(&self) -> String {
        truncate_chars(&format!("{}: {}", self.kind, self.message), MAX_ERROR_LENGTH)
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failure: {}", self.kind, self.message)
    }
}

/// Successful handler output, persisted by the result writer
#[derive(Debug, Clone)]
pub enum TaskOutput {
    /// Chunks embedded and indexed for a document
    Embedded { chunks: usize, pruned: usize },
    /// A new optimization result to insert
    Optimized(Box<NewOptimizationResult>),
    /// An equivalent result already exists; nothing to insert
    Deduplicated { existing_result_id: Uuid },
}

impl TaskOutput {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Embedded { .. } => "embedded",
            Self::Optimized(_) => "optimized",
            Self::Deduplicated { .. } => "deduplicated",
        }
    }

    /// Whether producing this output required an LLM call
    pub fn llm_called(&self) -> bool {
        matches!(self, Self::Optimized(_))
    }
}

/// Result of running one claimed task through its handler
#[derive(Debug, Clone)]
pub enum ProcessingOutcome {
    Succeeded(TaskOutput),
    Failed(TaskFailure),
}

impl ProcessingOutcome {
    pub fn llm_called(&self) -> bool {
        match self {
            Self::Succeeded(output) => output.llm_called(),
            Self::Failed(failure) => failure.llm_called,
        }
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
