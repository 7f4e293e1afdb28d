// crates/core/src/jobs/state.rs
//! Lifecycle states and terminal outcomes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a job.
///
/// ```text
/// Created -> NeedsResources -> Runnable <-> WaitingForSubjob
///                                  |              |
///                                  +-> CompletedSuccess | CompletedError
/// ```
///
/// `Cancelled` and `CompletedError` are reachable from every non-terminal
/// state. Nothing leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Created,
    NeedsResources,
    Runnable,
    WaitingForSubjob,
    CompletedSuccess,
    CompletedError,
    Cancelled,
}

impl JobState {
    pub const ALL: [JobState; 7] = [
        Self::Created,
        Self::NeedsResources,
        Self::Runnable,
        Self::WaitingForSubjob,
        Self::CompletedSuccess,
        Self::CompletedError,
        Self::Cancelled,
    ];

    pub const TERMINAL: [JobState; 3] =
        [Self::CompletedSuccess, Self::CompletedError, Self::Cancelled];

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    ///
    /// A non-terminal state may "transition" to itself; the caller treats
    /// that as a no-op.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;

        if self.is_terminal() {
            return false;
        }
        if next == self || matches!(next, Cancelled | CompletedError) {
            return true;
        }
        match self {
            Created => next == NeedsResources,
            NeedsResources => next == Runnable,
            Runnable => matches!(next, WaitingForSubjob | CompletedSuccess),
            WaitingForSubjob => matches!(next, Runnable | CompletedSuccess),
            CompletedSuccess | CompletedError | Cancelled => false,
        }
    }

    /// Outcome of a terminal state; `None` while the job is still live.
    pub fn outcome(self) -> Option<JobOutcome> {
        match self {
            Self::CompletedSuccess => Some(JobOutcome::Success),
            Self::CompletedError => Some(JobOutcome::Failure),
            Self::Cancelled => Some(JobOutcome::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::NeedsResources => "needs_resources",
            Self::Runnable => "runnable",
            Self::WaitingForSubjob => "waiting_for_subjob",
            Self::CompletedSuccess => "completed_success",
            Self::CompletedError => "completed_error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a finished job ended, as reported to the originating request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Success,
    Failure,
    Cancelled,
}

impl JobOutcome {
    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    /// The terminal state this outcome corresponds to.
    pub fn state(self) -> JobState {
        match self {
            Self::Success => JobState::CompletedSuccess,
            Self::Failure => JobState::CompletedError,
            Self::Cancelled => JobState::Cancelled,
        }
    }
}
