// crates/core/src/jobs/node.rs
//! A single unit of work in a job tree.
//!
//! Kind behaviors receive `&mut JobNode` and may touch parameters,
//! resources, iteration counters and deadlines. State, timestamps and tree
//! links are `pub(crate)`: only the lifecycle and the tree move them.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::deadline::Deadlines;
use super::state::{JobOutcome, JobState};
use super::types::{JobId, JobKind, JobProgress, JobSpec, ParamValue, Parameters, ResourceHandle};
use crate::error::JobError;

/// One job: identity, state, timing, progress and tree links.
#[derive(Debug, Clone)]
pub struct JobNode {
    id: JobId,
    kind: JobKind,
    priority: u32,
    state: JobState,
    parent: Option<JobId>,
    children: Vec<JobId>,
    parameters: Parameters,
    resources: Vec<ResourceHandle>,
    resources_released: bool,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    elapsed_secs: f64,
    deadlines: Deadlines,
    iteration_count: u32,
    original_iteration_count: u32,
    percent_complete: f64,
    marked_for_cancellation: bool,
}

impl JobNode {
    pub(crate) fn new(id: JobId, spec: JobSpec, parent: Option<JobId>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            kind: spec.kind,
            priority: spec.priority,
            state: JobState::Created,
            parent,
            children: Vec::new(),
            parameters: spec.parameters,
            resources: Vec::new(),
            resources_released: false,
            created_at: now,
            started_at: None,
            completed_at: None,
            elapsed_secs: 0.0,
            deadlines: Deadlines::new(now, spec.time_limit),
            iteration_count: spec.iterations,
            original_iteration_count: spec.iterations,
            percent_complete: 0.0,
            marked_for_cancellation: false,
        }
    }

    // -- Identity -------------------------------------------------------------

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn is_kind(&self, kind: JobKind) -> bool {
        self.kind == kind
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn set_priority(&mut self, priority: u32) {
        self.priority = priority;
    }

    // -- State ----------------------------------------------------------------

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn outcome(&self) -> Option<JobOutcome> {
        self.state.outcome()
    }

    /// Move to `next`, enforcing the lifecycle table. Same-state moves on a
    /// live job are a no-op.
    pub(crate) fn transition_to(&mut self, next: JobState) -> Result<(), JobError> {
        if !self.state.can_transition_to(next) {
            return Err(JobError::InvalidTransition {
                job: self.id,
                from: self.state,
                to: next,
            });
        }
        if next != self.state {
            tracing::debug!(job_id = %self.id, from = %self.state, to = %next, "Job state transition");
            self.state = next;
        }
        Ok(())
    }

    /// Move to a terminal state and stamp completion.
    pub(crate) fn finish(&mut self, outcome: JobOutcome, now: DateTime<Utc>) -> Result<(), JobError> {
        self.transition_to(outcome.state())?;
        self.set_completed_at(now);
        Ok(())
    }

    /// Overwrite the state with a terminal one, bypassing the lifecycle
    /// table. Used only by bulk maintenance; resources are left untouched.
    pub(crate) fn stamp_terminal(&mut self, state: JobState, now: DateTime<Utc>) {
        self.state = state;
        self.set_completed_at(now);
    }

    pub fn is_marked_for_cancellation(&self) -> bool {
        self.marked_for_cancellation
    }

    pub(crate) fn mark_for_cancellation(&mut self) {
        self.marked_for_cancellation = true;
    }

    // -- Tree links -----------------------------------------------------------

    pub fn parent(&self) -> Option<JobId> {
        self.parent
    }

    pub fn has_parent(&self) -> bool {
        self.parent.is_some()
    }

    pub fn children(&self) -> &[JobId] {
        &self.children
    }

    pub(crate) fn push_child(&mut self, child: JobId) {
        self.children.push(child);
    }

    // -- Parameters & resources -----------------------------------------------

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn parameter(&self, key: &str) -> Option<&ParamValue> {
        self.parameters.get(key)
    }

    /// Insert or replace a parameter, returning the previous value.
    pub fn set_parameter(&mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Option<ParamValue> {
        self.parameters.insert(key.into(), value.into())
    }

    pub fn resources(&self) -> &[ResourceHandle] {
        &self.resources
    }

    pub fn add_resource(&mut self, resource: ResourceHandle) {
        self.resources.push(resource);
    }

    pub fn resources_released(&self) -> bool {
        self.resources_released
    }

    /// Returns true the first time only; release happens once per node.
    pub(crate) fn begin_release(&mut self) -> bool {
        !std::mem::replace(&mut self.resources_released, true)
    }

    // -- Timing ---------------------------------------------------------------

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    /// Seconds between start and completion; 0 until both are set.
    pub fn elapsed_time(&self) -> f64 {
        self.elapsed_secs
    }

    pub(crate) fn set_started_at(&mut self, now: DateTime<Utc>) {
        self.started_at = Some(now);
    }

    pub(crate) fn set_completed_at(&mut self, now: DateTime<Utc>) {
        self.completed_at = Some(now);
        self.elapsed_secs = match self.started_at {
            Some(start) => ((now - start).num_milliseconds().max(0) as f64) / 1000.0,
            None => 0.0,
        };
    }

    // -- Deadlines ------------------------------------------------------------

    pub fn deadlines(&self) -> &Deadlines {
        &self.deadlines
    }

    pub(crate) fn deadlines_mut(&mut self) -> &mut Deadlines {
        &mut self.deadlines
    }

    pub fn time_limit(&self) -> Duration {
        self.deadlines.time_limit()
    }

    pub fn set_time_limit(&mut self, limit: Duration) {
        self.deadlines.set_time_limit(limit);
    }

    pub(crate) fn extend_time_limit_to(&mut self, until: DateTime<Utc>) {
        self.deadlines.extend_time_limit_to(self.started_at, until);
    }

    pub fn set_next_expected_allocation_duration_at(&mut self, duration: Duration, now: DateTime<Utc>) -> DateTime<Utc> {
        self.deadlines.set_next_allocation(duration, now)
    }

    pub fn set_next_expected_allocation_duration(&mut self, duration: Duration) -> DateTime<Utc> {
        self.set_next_expected_allocation_duration_at(duration, Utc::now())
    }

    pub fn set_next_expected_execution_duration_at(&mut self, duration: Duration, now: DateTime<Utc>) -> DateTime<Utc> {
        self.deadlines.set_next_execution(duration, now)
    }

    pub fn set_next_expected_execution_duration(&mut self, duration: Duration) -> DateTime<Utc> {
        self.set_next_expected_execution_duration_at(duration, Utc::now())
    }

    pub fn has_time_limit_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.deadlines.time_limit_expired_at(self.started_at, now)
    }

    pub fn has_time_limit_expired(&self) -> bool {
        self.has_time_limit_expired_at(Utc::now())
    }

    // -- Progress -------------------------------------------------------------

    pub fn iteration_count(&self) -> u32 {
        self.iteration_count
    }

    pub fn original_iteration_count(&self) -> u32 {
        self.original_iteration_count
    }

    /// Reset both iteration counters.
    pub fn set_iteration_counters(&mut self, count: u32) {
        self.iteration_count = count;
        self.original_iteration_count = count;
    }

    /// Count one iteration down, stopping at zero.
    pub fn decrement_iteration_count(&mut self) -> u32 {
        self.iteration_count = self.iteration_count.saturating_sub(1);
        self.iteration_count
    }

    pub fn has_remaining_iterations(&self) -> bool {
        self.iteration_count > 0
    }

    /// Fraction of work done at `now`: the larger of elapsed time over the
    /// time limit and consumed iterations over the original count.
    pub fn percent_complete_at(&self, now: DateTime<Utc>) -> f64 {
        let limit_ms = self.time_limit().as_millis() as f64;
        let time_fraction = match self.started_at {
            Some(start) if limit_ms > 0.0 => {
                let end = self.completed_at.unwrap_or(now);
                (end - start).num_milliseconds() as f64 / limit_ms
            }
            _ => 0.0,
        };

        let iteration_fraction = if self.original_iteration_count == 0 {
            0.0
        } else {
            let original = f64::from(self.original_iteration_count);
            (original - f64::from(self.iteration_count) - 1.0) / original
        };

        time_fraction.max(iteration_fraction).max(0.0)
    }

    pub fn percent_complete(&self) -> f64 {
        self.percent_complete_at(Utc::now())
    }

    /// The value cached by the last [`refresh_percent_complete`](Self::refresh_percent_complete).
    pub fn last_percent_complete(&self) -> f64 {
        self.percent_complete
    }

    pub(crate) fn refresh_percent_complete(&mut self, now: DateTime<Utc>) -> f64 {
        self.percent_complete = self.percent_complete_at(now);
        self.percent_complete
    }

    pub fn progress(&self, now: DateTime<Utc>) -> JobProgress {
        JobProgress {
            job_id: self.id,
            parent_id: self.parent,
            kind: self.kind.to_string(),
            state: self.state,
            percent_complete: self.percent_complete_at(now),
            elapsed_secs: self.elapsed_secs,
            iteration_count: self.iteration_count,
            original_iteration_count: self.original_iteration_count,
            marked_for_cancellation: self.marked_for_cancellation,
            timestamp: now.to_rfc3339(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const LEAF: JobKind = JobKind::new("leaf");

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 5, 12, 0, 0).unwrap()
    }

    fn at(ms: i64) -> DateTime<Utc> {
        t0() + chrono::Duration::milliseconds(ms)
    }

    fn node(spec: JobSpec) -> JobNode {
        JobNode::new(JobId::next(), spec, None, t0())
    }

    #[test]
    fn test_new_node_defaults() {
        let n = node(JobSpec::new(LEAF));
        assert_eq!(n.state(), JobState::Created);
        assert_eq!(n.priority(), crate::jobs::types::DEFAULT_PRIORITY);
        assert!(n.started_at().is_none());
        assert!(n.completed_at().is_none());
        assert_eq!(n.elapsed_time(), 0.0);
        assert!(!n.is_marked_for_cancellation());
        assert!(n.is_kind(LEAF));
    }

    #[test]
    fn test_elapsed_time_recomputed_on_completion() {
        let mut n = node(JobSpec::new(LEAF));
        n.set_started_at(at(1_000));
        n.set_completed_at(at(3_500));
        assert_eq!(n.elapsed_time(), 2.5);

        // Completion before start (clock skew) clamps to zero.
        n.set_completed_at(at(500));
        assert_eq!(n.elapsed_time(), 0.0);
    }

    #[test]
    fn test_elapsed_time_zero_without_start() {
        let mut n = node(JobSpec::new(LEAF));
        n.set_completed_at(at(3_500));
        assert_eq!(n.elapsed_time(), 0.0);
    }

    #[test]
    fn test_transition_rejects_leaving_terminal() {
        let mut n = node(JobSpec::new(LEAF));
        n.finish(JobOutcome::Cancelled, at(10)).unwrap();
        let err = n.transition_to(JobState::Runnable).unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { from: JobState::Cancelled, .. }));
        assert!(n.finish(JobOutcome::Success, at(20)).is_err());
        assert_eq!(n.completed_at(), Some(at(10)));
    }

    #[test]
    fn test_percent_complete_unconfigured_is_zero() {
        let mut n = node(JobSpec::new(LEAF));
        n.set_started_at(t0());
        assert_eq!(n.percent_complete_at(at(50_000)), 0.0);
    }

    #[test]
    fn test_percent_complete_time_fraction() {
        let mut n = node(JobSpec::new(LEAF).with_time_limit(Duration::from_secs(10)));
        assert_eq!(n.percent_complete_at(at(5_000)), 0.0);
        n.set_started_at(t0());
        assert_eq!(n.percent_complete_at(at(2_500)), 0.25);
        // Completed jobs measure against completion, not now.
        n.set_completed_at(at(5_000));
        assert_eq!(n.percent_complete_at(at(60_000)), 0.5);
    }

    #[test]
    fn test_percent_complete_iteration_fraction() {
        let mut n = node(JobSpec::new(LEAF).with_iterations(4));
        // (4 - 4 - 1) / 4 is negative; floored to zero.
        assert_eq!(n.percent_complete_at(t0()), 0.0);
        n.decrement_iteration_count();
        n.decrement_iteration_count();
        assert_eq!(n.percent_complete_at(t0()), 0.25);
    }

    #[test]
    fn test_percent_complete_takes_the_larger_metric() {
        let mut n = node(
            JobSpec::new(LEAF)
                .with_time_limit(Duration::from_secs(10))
                .with_iterations(2),
        );
        n.set_started_at(t0());
        n.decrement_iteration_count();
        n.decrement_iteration_count();
        // time: 0.1, iterations: (2 - 0 - 1) / 2 = 0.5
        assert_eq!(n.percent_complete_at(at(1_000)), 0.5);
        assert_eq!(n.percent_complete_at(at(8_000)), 0.8);
        assert_eq!(n.refresh_percent_complete(at(8_000)), 0.8);
        assert_eq!(n.last_percent_complete(), 0.8);
    }

    #[test]
    fn test_iteration_helpers() {
        let mut n = node(JobSpec::new(LEAF));
        n.set_iteration_counters(1);
        assert!(n.has_remaining_iterations());
        assert_eq!(n.decrement_iteration_count(), 0);
        assert_eq!(n.decrement_iteration_count(), 0);
        assert!(!n.has_remaining_iterations());
        assert_eq!(n.original_iteration_count(), 1);
    }

    #[test]
    fn test_begin_release_once() {
        let mut n = node(JobSpec::new(LEAF));
        n.add_resource(ResourceHandle("gpu-0".into()));
        assert!(n.begin_release());
        assert!(!n.begin_release());
        assert!(n.resources_released());
        assert_eq!(n.resources().len(), 1);
    }

    #[test]
    fn test_time_limit_expiry_requires_start() {
        let mut n = node(JobSpec::new(LEAF).with_time_limit(Duration::from_millis(5_000)));
        assert!(!n.has_time_limit_expired_at(at(6_000)));
        n.set_started_at(t0());
        assert!(n.has_time_limit_expired_at(at(6_000)));
        n.set_time_limit(Duration::ZERO);
        assert!(!n.has_time_limit_expired_at(at(6_000)));
    }
}
