// crates/core/src/jobs/behavior.rs
//! Per-kind job behavior and the registry that maps kinds to behaviors.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::deadline::{DeadlineConfig, DeadlineKind};
use super::node::JobNode;
use super::state::JobState;
use super::types::{ChildCompletion, ExecutionResult, ExternalResponse, JobKind, Parameters, TimeoutAction};
use crate::error::JobError;

/// Kind-specific behavior plugged into the lifecycle.
///
/// Only `kind` and `start` are required. Every other hook has the default
/// policy: no validation, no resources, fail on child failure, reject
/// external responses, fail on timeout.
pub trait JobBehavior: Send + Sync {
    fn kind(&self) -> JobKind;

    /// Single-action jobs run once and complete; they never wait for a
    /// response after `start`.
    fn is_single_action(&self) -> bool {
        false
    }

    /// Parameters every job of this kind starts with. Values already present
    /// on the `JobSpec` win.
    fn default_parameters(&self) -> Parameters {
        Parameters::new()
    }

    /// Runs before any resource is acquired. An error here is terminal.
    fn validate_parameters(&self, _job: &JobNode) -> Result<(), JobError> {
        Ok(())
    }

    fn create_initial_resources(&self, _job: &mut JobNode) -> Result<(), JobError> {
        Ok(())
    }

    /// `Ok(false)` leaves the job waiting for resources; allocation is
    /// retried when the soft allocation window elapses.
    fn allocate_resources(&self, _job: &mut JobNode) -> Result<bool, JobError> {
        Ok(true)
    }

    /// Called exactly once per job, on completion or cancellation.
    fn release_resources(&self, _job: &JobNode) {}

    fn start(&self, job: &mut JobNode) -> Result<ExecutionResult, JobError>;

    fn on_child_complete(
        &self,
        _job: &mut JobNode,
        _child: &JobNode,
        event: &ChildCompletion,
    ) -> Result<ExecutionResult, JobError> {
        fail_on_child_error(event)?;
        Ok(ExecutionResult::done())
    }

    fn on_external_response(
        &self,
        job: &mut JobNode,
        _response: &ExternalResponse,
    ) -> Result<ExecutionResult, JobError> {
        Err(JobError::Unsupported {
            job: job.id(),
            kind: job.kind(),
            operation: "external responses",
        })
    }

    /// Whether a response that arrives after the job finished may be dropped
    /// quietly instead of being reported.
    fn accepts_unexpected_response(&self, _response: &ExternalResponse, _state: JobState) -> bool {
        false
    }

    fn on_timeout(
        &self,
        job: &mut JobNode,
        _kind: DeadlineKind,
        deadline: DateTime<Utc>,
    ) -> Result<TimeoutAction, JobError> {
        tracing::info!(job_id = %job.id(), kind = %job.kind(), %deadline, "Job timed out");
        Err(JobError::Timeout {
            job: job.id(),
            deadline,
        })
    }

    fn allocation_window(&self, config: &DeadlineConfig) -> Duration {
        config.allocation_window
    }

    /// Execution window armed while waiting on children.
    fn child_complete_window(&self, config: &DeadlineConfig) -> Duration {
        config.execution_window
    }

    /// Execution window armed while waiting on an external response.
    fn response_window(&self, config: &DeadlineConfig) -> Duration {
        config.response_window
    }
}

/// Default child-error policy: a failed child fails the parent.
pub fn fail_on_child_error(event: &ChildCompletion) -> Result<(), JobError> {
    if event.success {
        return Ok(());
    }
    let reason = event
        .error
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "child reported failure".to_string());
    tracing::info!(
        parent_id = %event.parent,
        child_id = %event.child,
        reason = %reason,
        "Child job failed, parent transitioning to error state"
    );
    Err(JobError::ChildFailure {
        child: event.child,
        reason,
    })
}

/// Maps job kinds to their behavior.
#[derive(Clone, Default)]
pub struct BehaviorRegistry {
    behaviors: HashMap<JobKind, Arc<dyn JobBehavior>>,
}

impl BehaviorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `behavior` under its kind, returning any behavior it replaces.
    pub fn register(&mut self, behavior: Arc<dyn JobBehavior>) -> Option<Arc<dyn JobBehavior>> {
        self.behaviors.insert(behavior.kind(), behavior)
    }

    pub fn with(mut self, behavior: impl JobBehavior + 'static) -> Self {
        self.register(Arc::new(behavior));
        self
    }

    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn JobBehavior>> {
        self.behaviors.get(&kind).cloned()
    }

    pub fn contains(&self, kind: JobKind) -> bool {
        self.behaviors.contains_key(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = JobKind> + '_ {
        self.behaviors.keys().copied()
    }
}

impl fmt::Debug for BehaviorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.kinds().map(|k| k.as_str()).collect();
        kinds.sort_unstable();
        f.debug_struct("BehaviorRegistry").field("kinds", &kinds).finish()
    }
}
