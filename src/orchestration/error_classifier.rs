//! # Error Classifier
//!
//! Maps provider errors onto the failure taxonomy that drives retries.
//!
//! ## Overview
//!
//! Handlers never decide whether an error is worth retrying. They hand every
//! [`ProviderError`] to the classifier, which produces an
//! [`ErrorClassification`] and from it a [`TaskFailure`].
//!
//! | Error | Category | Kind |
//! |---|---|---|
//! | `Timeout`, HTTP 408 | `Timeout` | transient |
//! | HTTP 429 | `RateLimit` | transient, honours `Retry-After` |
//! | HTTP 5xx | `ServerError` | transient |
//! | `Network` | `Network` | transient |
//! | `Storage` | `DependencyFailure` | transient |
//! | `Parse` | `InvalidResponse` | validation |
//! | other HTTP 4xx | `Rejected` | permanent |
//! | `Config` | `Configuration` | permanent |

use crate::models::{FailureKind, TaskFailure};
use crate::providers::ProviderError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Timeout,
    RateLimit,
    ServerError,
    Network,
    /// Our own storage behind a provider (vector table, content tables)
    DependencyFailure,
    /// The provider answered with a body we could not interpret
    InvalidResponse,
    /// The provider refused the request itself
    Rejected,
    Configuration,
}

impl ErrorCategory {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Timeout
            | Self::RateLimit
            | Self::ServerError
            | Self::Network
            | Self::DependencyFailure => FailureKind::Transient,
            Self::InvalidResponse => FailureKind::Validation,
            Self::Rejected | Self::Configuration => FailureKind::Permanent,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "Timeout"),
            Self::RateLimit => write!(f, "Rate Limit"),
            Self::ServerError => write!(f, "Server Error"),
            Self::Network => write!(f, "Network"),
            Self::DependencyFailure => write!(f, "Dependency Failure"),
            Self::InvalidResponse => write!(f, "Invalid Response"),
            Self::Rejected => write!(f, "Rejected"),
            Self::Configuration => write!(f, "Configuration"),
        }
    }
}

/// Classification result for one provider error
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorClassification {
    pub error_category: ErrorCategory,
    pub kind: FailureKind,
    /// Minimum delay requested by the provider
    pub retry_after: Option<Duration>,
    pub error_code: &'static str,
    pub error_message: String,
}

impl ErrorClassification {
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Failure for the retry controller, prefixed with the operation that failed
    pub fn into_failure(self, operation: &str) -> TaskFailure {
        TaskFailure::new(self.kind, format!("{operation}: {}", self.error_message))
            .with_retry_after(self.retry_after)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, error: &ProviderError) -> ErrorClassification {
        let (error_category, error_code) = match error {
            ProviderError::Timeout(_) => (ErrorCategory::Timeout, "PROVIDER_TIMEOUT"),
            ProviderError::Network(_) => (ErrorCategory::Network, "PROVIDER_UNREACHABLE"),
            ProviderError::Storage(_) => (ErrorCategory::DependencyFailure, "STORAGE_ERROR"),
            ProviderError::Parse(_) => (ErrorCategory::InvalidResponse, "INVALID_RESPONSE"),
            ProviderError::Config(_) => (ErrorCategory::Configuration, "PROVIDER_MISCONFIGURED"),
            ProviderError::Api { status, .. } => Self::classify_status(*status),
        };

        ErrorClassification {
            error_category,
            kind: error_category.failure_kind(),
            retry_after: error.retry_after(),
            error_code,
            error_message: error.to_string(),
        }
    }

    /// Shorthand for `classify(error).into_failure(operation)`
    pub fn failure_for(&self, operation: &str, error: &ProviderError) -> TaskFailure {
        self.classify(error).into_failure(operation)
    }

    fn classify_status(status: u16) -> (ErrorCategory, &'static str) {
        match status {
            408 => (ErrorCategory::Timeout, "HTTP_REQUEST_TIMEOUT"),
            429 => (ErrorCategory::RateLimit, "HTTP_RATE_LIMITED"),
            500..=599 => (ErrorCategory::ServerError, "HTTP_SERVER_ERROR"),
            // 4xx and anything unexpected: retrying the same request will not help
            _ => (ErrorCategory::Rejected, "HTTP_REJECTED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind_of(error: ProviderError) -> FailureKind {
        ErrorClassifier::new().classify(&error).kind
    }

    #[test]
    fn test_transient_errors() {
        assert_eq!(kind_of(ProviderError::Timeout("30s".into())), FailureKind::Transient);
        assert_eq!(kind_of(ProviderError::Network("reset".into())), FailureKind::Transient);
        assert_eq!(kind_of(ProviderError::api(503, "overloaded")), FailureKind::Transient);
        assert_eq!(kind_of(ProviderError::api(408, "slow")), FailureKind::Transient);
        assert_eq!(kind_of(ProviderError::Storage("pool".into())), FailureKind::Transient);
    }

    #[test]
    fn test_rejections_are_permanent() {
        assert_eq!(kind_of(ProviderError::api(400, "bad request")), FailureKind::Permanent);
        assert_eq!(kind_of(ProviderError::api(401, "bad key")), FailureKind::Permanent);
        assert_eq!(kind_of(ProviderError::Config("no key".into())), FailureKind::Permanent);
    }

    #[test]
    fn test_parse_errors_are_validation_failures() {
        assert_eq!(kind_of(ProviderError::Parse("no choices".into())), FailureKind::Validation);
    }

    #[test]
    fn test_rate_limit_carries_retry_after() {
        let error = ProviderError::Api {
            status: 429,
            message: "slow down".into(),
            retry_after: Some(Duration::from_secs(12)),
        };
        let failure = ErrorClassifier::new().failure_for("llm completion", &error);
        assert_eq!(failure.kind, FailureKind::Transient);
        assert_eq!(failure.retry_after, Some(Duration::from_secs(12)));
        assert!(failure.message.starts_with("llm completion: API error (429)"));
    }
}
