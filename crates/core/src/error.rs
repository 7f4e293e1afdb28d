// crates/core/src/error.rs
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::jobs::{JobId, JobKind, JobState};

/// Errors raised by job lifecycle operations.
///
/// `Clone` so a failure can travel inside a child-completion event.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum JobError {
    #[error("Validation failed for job {job}: {message}")]
    Validation { job: JobId, message: String },

    #[error("Child job {child} failed: {reason}")]
    ChildFailure { child: JobId, reason: String },

    #[error("Job {job} timed out (deadline {deadline})")]
    Timeout { job: JobId, deadline: DateTime<Utc> },

    #[error("Job {job} of kind {kind} does not support {operation}")]
    Unsupported {
        job: JobId,
        kind: JobKind,
        operation: &'static str,
    },

    #[error("Job {job} failed: {message}")]
    Failed { job: JobId, message: String },

    #[error("Job {job} was cancelled")]
    Cancelled { job: JobId },

    #[error("Job {job} cannot transition from {from} to {to}")]
    InvalidTransition {
        job: JobId,
        from: JobState,
        to: JobState,
    },

    #[error("Job {job} cannot start from state {state}")]
    NotRunnable { job: JobId, state: JobState },

    #[error("Job {child} is not a child of job {parent}")]
    NotAChild { parent: JobId, child: JobId },

    #[error("Unexpected response for job {job} in state {state}")]
    UnexpectedResponse { job: JobId, state: JobState },

    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("No behavior registered for job kind {0}")]
    UnknownKind(JobKind),

    #[error("Maintenance target state must be terminal, got {0}")]
    NonTerminalTarget(JobState),
}

impl JobError {
    pub fn validation(job: JobId, message: impl Into<String>) -> Self {
        Self::Validation {
            job,
            message: message.into(),
        }
    }

    pub fn failed(job: JobId, message: impl Into<String>) -> Self {
        Self::Failed {
            job,
            message: message.into(),
        }
    }

    /// Whether this error came from a child job rather than the job itself.
    pub fn is_child_failure(&self) -> bool {
        matches!(self, Self::ChildFailure { .. } | Self::Cancelled { .. })
    }
}

/// Errors that can occur while loading engine configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Malformed TOML configuration: {0}")]
    MalformedToml(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}
