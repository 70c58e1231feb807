use serde::{Deserialize, Serialize};

/// Events that drive task status transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEvent {
    /// A worker leased a queued task
    Claim,
    /// A worker leased a task whose previous lease expired
    Reclaim,
    /// The handler succeeded and its output was persisted
    Complete,
    /// The handler failed and the retry budget allows another attempt
    Retry,
    /// The handler failed terminally
    Fail,
}

impl TaskEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Claim => "claim",
            Self::Reclaim => "reclaim",
            Self::Complete => "complete",
            Self::Retry => "retry",
            Self::Fail => "fail",
        }
    }

    /// Check if this event represents a terminal transition
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Fail)
    }
}
