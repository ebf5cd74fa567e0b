//! Error types for repolens operations.
//!
//! Two layers live here:
//! - `JobError` / `ErrorKind`: the failure recorded on a job and surfaced
//!   verbatim by the API.
//! - `TaskError`, `FetchError`, `LlmError`: errors raised while a worker is
//!   executing a job, classified into transient and permanent failures.
//!
//! Subsystem errors that never reach a job record (`BrokerError`,
//! `CoordinatorError`, `PoolError`) live next to their subsystem.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::broker::BrokerError;

/// Classification of a job failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The repository host could not be reached after bounded retries.
    RepoUnavailable,
    /// The repository or reference does not exist.
    InvalidRef,
    /// The reasoning service failed, timed out, or rate-limited past the retry budget.
    ServiceUnavailable,
    /// The artifact handed to an analysis job is missing, malformed, or empty.
    InvalidArtifact,
    /// An upstream job failed or was cancelled.
    DependencyFailed,
    /// The job exceeded its maximum lifetime.
    TimedOut,
    /// Broker or bookkeeping failure inside the service.
    Internal,
}

impl ErrorKind {
    /// Returns the wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RepoUnavailable => "repo_unavailable",
            ErrorKind::InvalidRef => "invalid_ref",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::InvalidArtifact => "invalid_artifact",
            ErrorKind::DependencyFailed => "dependency_failed",
            ErrorKind::TimedOut => "timed_out",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure detail stored on a job record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

/// Error raised by a job handler during one execution attempt.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Retryable failure (network blips, rate limits, timeouts).
    #[error("transient failure: {0}")]
    Transient(JobError),

    /// Failure that will not improve with retries.
    #[error("permanent failure: {0}")]
    Permanent(JobError),

    /// Cancellation was observed at a checkpoint.
    #[error("job cancelled")]
    Cancelled,
}

impl TaskError {
    pub fn transient(kind: ErrorKind, message: impl Into<String>) -> Self {
        TaskError::Transient(JobError::new(kind, message))
    }

    pub fn permanent(kind: ErrorKind, message: impl Into<String>) -> Self {
        TaskError::Permanent(JobError::new(kind, message))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, TaskError::Transient(_))
    }
}

impl From<BrokerError> for TaskError {
    fn from(err: BrokerError) -> Self {
        TaskError::Transient(JobError::internal(err.to_string()))
    }
}

/// Errors that can occur while fetching a repository snapshot.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Invalid repository URL: {0}")]
    InvalidUrl(String),

    #[error("Reference '{git_ref}' not found in {repo}")]
    InvalidRef { repo: String, git_ref: String },

    #[error("Unsupported repository host '{0}'")]
    UnsupportedHost(String),

    #[error("Rate limited by repository host: {0}")]
    RateLimited(String),

    #[error("Repository host unavailable: {0}")]
    Unavailable(String),

    #[error("Repository request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unexpected response from repository host: {0}")]
    Malformed(String),
}

impl FetchError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::RateLimited(_)
                | FetchError::Unavailable(_)
                | FetchError::Timeout(_)
                | FetchError::Malformed(_)
        )
    }
}

impl From<FetchError> for TaskError {
    fn from(err: FetchError) -> Self {
        if err.is_transient() {
            TaskError::transient(ErrorKind::RepoUnavailable, err.to_string())
        } else {
            TaskError::permanent(ErrorKind::InvalidRef, err.to_string())
        }
    }
}

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API key: LITELLM_API_KEY or OPENROUTER_API_KEY must be set")]
    MissingApiKey,

    #[error("Missing API base URL: LITELLM_API_BASE environment variable not set")]
    MissingApiBase,

    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(String),

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },
}

impl LlmError {
    /// Whether the reasoning service may answer if asked again.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::RequestFailed(_)
            | LlmError::RateLimited(_)
            | LlmError::Timeout(_)
            | LlmError::ParseError(_) => true,
            LlmError::ApiError { code, .. } => *code == 408 || *code == 429 || *code >= 500,
            LlmError::MissingApiKey | LlmError::MissingApiBase | LlmError::ClientBuild(_) => false,
        }
    }
}

impl From<LlmError> for TaskError {
    fn from(err: LlmError) -> Self {
        if err.is_transient() {
            TaskError::transient(ErrorKind::ServiceUnavailable, err.to_string())
        } else {
            TaskError::permanent(ErrorKind::ServiceUnavailable, err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_wire_names() {
        let json = serde_json::to_string(&ErrorKind::DependencyFailed).expect("serialize");
        assert_eq!(json, "\"dependency_failed\"");
        assert_eq!(ErrorKind::InvalidRef.to_string(), "invalid_ref");
    }

    #[test]
    fn test_job_error_display() {
        let err = JobError::new(ErrorKind::RepoUnavailable, "connection reset");
        assert_eq!(err.to_string(), "repo_unavailable: connection reset");
    }

    #[test]
    fn test_fetch_error_classification() {
        assert!(FetchError::Timeout(Duration::from_secs(5)).is_transient());
        assert!(FetchError::RateLimited("slow down".into()).is_transient());
        let invalid = FetchError::InvalidRef {
            repo: "github.com/a/b".into(),
            git_ref: "nope".into(),
        };
        assert!(!invalid.is_transient());

        match TaskError::from(invalid) {
            TaskError::Permanent(e) => assert_eq!(e.kind, ErrorKind::InvalidRef),
            other => panic!("expected permanent error, got {other:?}"),
        }
    }

    #[test]
    fn test_llm_error_classification() {
        assert!(LlmError::RateLimited("429".into()).is_transient());
        assert!(LlmError::ApiError {
            code: 503,
            message: "overloaded".into()
        }
        .is_transient());
        assert!(!LlmError::ApiError {
            code: 401,
            message: "bad key".into()
        }
        .is_transient());

        match TaskError::from(LlmError::Timeout(Duration::from_secs(1))) {
            TaskError::Transient(e) => assert_eq!(e.kind, ErrorKind::ServiceUnavailable),
            other => panic!("expected transient error, got {other:?}"),
        }
    }
}
