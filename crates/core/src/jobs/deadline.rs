// crates/core/src/jobs/deadline.rs
//! Allocation and execution deadlines for a single job.
//!
//! Deadlines are plain instants. Nothing here sleeps or polls: the external
//! scheduler asks [`JobTree::overdue_jobs`](super::tree::JobTree::overdue_jobs)
//! and calls the timeout entry point itself.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How long a job may wait for an external response.
pub const MAXIMUM_EXPECTED_RESPONSE_DURATION: Duration = Duration::from_secs(6 * 60);

/// Soft allocation window. Lowering it only causes allocation to be
/// re-evaluated more often.
pub const MAXIMUM_EXPECTED_ALLOCATION_DURATION: Duration = Duration::from_secs(4 * 60);

/// Hard allocation ceiling, measured from creation. Never reset.
pub const MAXIMUM_ALLOWED_ALLOCATION_DURATION: Duration = Duration::from_secs(8 * 60);

/// Window a running job has to make forward progress.
pub const MAXIMUM_EXPECTED_EXECUTION_TIME_DURATION: Duration = Duration::from_secs(10 * 60);

/// Which deadline elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadlineKind {
    /// Soft allocation window: allocation is re-evaluated.
    Allocation,
    /// Hard allocation ceiling: always fatal.
    AllocationCeiling,
    /// Execution window: the kind's timeout policy decides.
    Execution,
    /// Overall time limit measured from start.
    TimeLimit,
}

impl fmt::Display for DeadlineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Allocation => "allocation",
            Self::AllocationCeiling => "allocation_ceiling",
            Self::Execution => "execution",
            Self::TimeLimit => "time_limit",
        })
    }
}

/// Default deadline durations. Job kinds may override the windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlineConfig {
    pub allocation_window: Duration,
    pub allocation_ceiling: Duration,
    pub execution_window: Duration,
    pub response_window: Duration,
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        Self {
            allocation_window: MAXIMUM_EXPECTED_ALLOCATION_DURATION,
            allocation_ceiling: MAXIMUM_ALLOWED_ALLOCATION_DURATION,
            execution_window: MAXIMUM_EXPECTED_EXECUTION_TIME_DURATION,
            response_window: MAXIMUM_EXPECTED_RESPONSE_DURATION,
        }
    }
}

/// `now + duration`, saturating at the latest representable instant.
pub(crate) fn deadline_after(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Deadline bookkeeping for one job.
#[derive(Debug, Clone, PartialEq)]
pub struct Deadlines {
    created_at: DateTime<Utc>,
    allocation: Option<DateTime<Utc>>,
    execution: Option<DateTime<Utc>>,
    time_limit: Duration,
}

impl Deadlines {
    pub fn new(created_at: DateTime<Utc>, time_limit: Duration) -> Self {
        Self {
            created_at,
            allocation: None,
            execution: None,
            time_limit,
        }
    }

    pub fn allocation(&self) -> Option<DateTime<Utc>> {
        self.allocation
    }

    pub fn execution(&self) -> Option<DateTime<Utc>> {
        self.execution
    }

    /// Overall time limit. Zero means unlimited.
    pub fn time_limit(&self) -> Duration {
        self.time_limit
    }

    pub(crate) fn set_time_limit(&mut self, limit: Duration) {
        self.time_limit = limit;
    }

    /// Stretch the time limit so it ends at `until`. Ignored before the job
    /// started or when `until` is not after the start.
    pub(crate) fn extend_time_limit_to(&mut self, started_at: Option<DateTime<Utc>>, until: DateTime<Utc>) {
        let Some(start) = started_at else {
            return;
        };
        match (until - start).to_std() {
            Ok(limit) if !limit.is_zero() => self.time_limit = limit,
            _ => {}
        }
    }

    /// Arm the soft allocation deadline at `now + duration` and return it.
    pub fn set_next_allocation(&mut self, duration: Duration, now: DateTime<Utc>) -> DateTime<Utc> {
        let deadline = deadline_after(now, duration);
        self.allocation = Some(deadline);
        deadline
    }

    /// Arm the execution deadline at `now + duration` and return it.
    pub fn set_next_execution(&mut self, duration: Duration, now: DateTime<Utc>) -> DateTime<Utc> {
        let deadline = deadline_after(now, duration);
        self.execution = Some(deadline);
        deadline
    }

    pub(crate) fn clear_allocation(&mut self) {
        self.allocation = None;
    }

    pub fn allocation_overdue_at(&self, now: DateTime<Utc>) -> bool {
        self.allocation.is_some_and(|d| d < now)
    }

    pub fn execution_overdue_at(&self, now: DateTime<Utc>) -> bool {
        self.execution.is_some_and(|d| d < now)
    }

    /// The instant the hard allocation ceiling falls on.
    pub fn allocation_ceiling(&self, ceiling: Duration) -> DateTime<Utc> {
        deadline_after(self.created_at, ceiling)
    }

    /// Whether more than `ceiling` has passed since creation, regardless of
    /// how often the soft window was re-armed.
    pub fn allocation_ceiling_exceeded_at(&self, ceiling: Duration, now: DateTime<Utc>) -> bool {
        self.allocation_ceiling(ceiling) < now
    }

    /// The instant the overall time limit falls on, if one applies.
    pub fn time_limit_deadline(&self, started_at: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        if self.time_limit.is_zero() {
            return None;
        }
        started_at.map(|start| deadline_after(start, self.time_limit))
    }

    /// True only with a non-zero limit, a start time, and
    /// `started_at + time_limit < now`.
    pub fn time_limit_expired_at(&self, started_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        self.time_limit_deadline(started_at).is_some_and(|d| d < now)
    }
}
