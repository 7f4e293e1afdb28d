// crates/core/src/jobs/lifecycle.rs
//! The lifecycle protocol: driver-facing entry points that move jobs through
//! their states and delegate kind-specific decisions to a [`JobBehavior`].
//!
//! Every entry point takes the tree explicitly. Operations that fail a job
//! perform the terminal transition and propagation first, then return the
//! error so the driver can log it.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::behavior::{BehaviorRegistry, JobBehavior};
use super::deadline::{DeadlineConfig, DeadlineKind};
use super::node::JobNode;
use super::provider::Provider;
use super::state::{JobOutcome, JobState};
use super::tree::JobTree;
use super::types::{ChildCompletion, ExecutionResult, ExternalResponse, JobId, TimeoutAction};
use crate::clock::Clock;
use crate::error::JobError;

/// Entry point whose behavior result is being applied.
#[derive(Debug, Clone, Copy)]
enum Phase {
    Start,
    ChildComplete,
    Response,
    Timeout,
}

pub struct Lifecycle {
    registry: Arc<BehaviorRegistry>,
    provider: Arc<dyn Provider>,
    clock: Arc<dyn Clock>,
    config: DeadlineConfig,
}

impl Lifecycle {
    pub fn new(
        registry: Arc<BehaviorRegistry>,
        provider: Arc<dyn Provider>,
        clock: Arc<dyn Clock>,
        config: DeadlineConfig,
    ) -> Self {
        Self {
            registry,
            provider,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &DeadlineConfig {
        &self.config
    }

    pub fn registry(&self) -> &BehaviorRegistry {
        &self.registry
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn behavior_for(&self, tree: &JobTree, id: JobId) -> Result<Arc<dyn JobBehavior>, JobError> {
        let kind = tree.node(id)?.kind();
        self.registry.get(kind).ok_or(JobError::UnknownKind(kind))
    }

    /// Resolve the behavior, failing the job when its kind is unregistered.
    fn behavior_or_fail(&self, tree: &mut JobTree, id: JobId) -> Result<Arc<dyn JobBehavior>, JobError> {
        match self.behavior_for(tree, id) {
            Ok(behavior) => Ok(behavior),
            Err(e @ JobError::UnknownKind(_)) => self.fail(tree, id, e),
            Err(e) => Err(e),
        }
    }

    // -- Creation & allocation ------------------------------------------------

    /// Prepare and allocate a freshly created job.
    pub fn submit(&self, tree: &mut JobTree, id: JobId) -> Result<(), JobError> {
        self.prepare(tree, id)?;
        self.allocate(tree, id)?;
        Ok(())
    }

    /// Apply default parameters, validate, create initial resources, then
    /// move to NEEDS_RESOURCES with the soft allocation window armed.
    pub fn prepare(&self, tree: &mut JobTree, id: JobId) -> Result<(), JobError> {
        let behavior = self.behavior_or_fail(tree, id)?;
        let node = tree.node_mut(id)?;
        for (key, value) in behavior.default_parameters() {
            if node.parameter(&key).is_none() {
                node.set_parameter(key, value);
            }
        }

        let prepared = behavior
            .validate_parameters(node)
            .and_then(|()| behavior.create_initial_resources(node));
        if let Err(e) = prepared {
            tracing::info!(job_id = %id, kind = %node.kind(), error = %e, "Job preparation failed");
            return self.fail(tree, id, e);
        }

        node.transition_to(JobState::NeedsResources)?;
        let window = behavior.allocation_window(&self.config);
        node.set_next_expected_allocation_duration_at(window, self.now());
        Ok(())
    }

    /// Ask the kind for resources. `Ok(true)` means the job is RUNNABLE and a
    /// start was requested; `Ok(false)` means it keeps waiting with a fresh
    /// soft window. Past the hard ceiling the job fails with a timeout.
    pub fn allocate(&self, tree: &mut JobTree, id: JobId) -> Result<bool, JobError> {
        let state = tree.node(id)?.state();
        if state.is_terminal() {
            tracing::debug!(job_id = %id, %state, "Ignoring allocation for finished job");
            return Ok(false);
        }
        if state != JobState::NeedsResources {
            return Err(JobError::InvalidTransition {
                job: id,
                from: state,
                to: JobState::Runnable,
            });
        }

        let now = self.now();
        let deadlines = tree.node(id)?.deadlines();
        if deadlines.allocation_ceiling_exceeded_at(self.config.allocation_ceiling, now) {
            let deadline = deadlines.allocation_ceiling(self.config.allocation_ceiling);
            tracing::warn!(job_id = %id, %deadline, "Allocation ceiling exceeded");
            return self.fail(tree, id, JobError::Timeout { job: id, deadline });
        }

        let behavior = self.behavior_or_fail(tree, id)?;
        let node = tree.node_mut(id)?;
        match behavior.allocate_resources(node) {
            Ok(true) => {
                node.transition_to(JobState::Runnable)?;
                node.deadlines_mut().clear_allocation();
                tracing::debug!(job_id = %id, kind = %node.kind(), "Resources allocated");
                self.provider.request_start(id);
                Ok(true)
            }
            Ok(false) => {
                let window = behavior.allocation_window(&self.config);
                let next = node.set_next_expected_allocation_duration_at(window, now);
                tracing::debug!(job_id = %id, next_attempt = %next, "Resources unavailable");
                Ok(false)
            }
            Err(e) => self.fail(tree, id, e),
        }
    }

    // -- Execution ------------------------------------------------------------

    /// Start a RUNNABLE job. A job flagged for cancellation is cancelled
    /// instead.
    pub fn start(&self, tree: &mut JobTree, id: JobId) -> Result<(), JobError> {
        let node = tree.node(id)?;
        if node.is_terminal() {
            tracing::debug!(job_id = %id, state = %node.state(), "Ignoring start for finished job");
            return Ok(());
        }
        if node.is_marked_for_cancellation() {
            return self.cancel(tree, id);
        }
        if node.state() != JobState::Runnable {
            return Err(JobError::NotRunnable {
                job: id,
                state: node.state(),
            });
        }

        let behavior = self.behavior_or_fail(tree, id)?;
        let now = self.now();
        let node = tree.node_mut(id)?;
        node.set_started_at(now);
        tracing::debug!(job_id = %id, kind = %node.kind(), "Starting job");
        match behavior.start(node) {
            Ok(result) => self.apply_result(tree, id, behavior.as_ref(), result, Phase::Start),
            Err(e) => self.fail(tree, id, e),
        }
    }

    /// Deliver a child completion to its parent. Events for a finished
    /// parent are dropped. A child that is still live is settled according
    /// to the event first.
    pub fn on_child_complete(&self, tree: &mut JobTree, event: ChildCompletion) -> Result<(), JobError> {
        let parent = tree.node(event.parent)?;
        if parent.is_terminal() {
            tracing::debug!(
                parent_id = %event.parent,
                child_id = %event.child,
                "Ignoring child completion for finished parent"
            );
            return Ok(());
        }
        if !parent.children().contains(&event.child) {
            return Err(JobError::NotAChild {
                parent: event.parent,
                child: event.child,
            });
        }

        if !tree.node(event.child)?.is_terminal() {
            let outcome = if event.success {
                JobOutcome::Success
            } else {
                JobOutcome::Failure
            };
            self.settle(tree, event.child, outcome)?;
        }

        if tree.node(event.parent)?.is_marked_for_cancellation() {
            return self.cancel(tree, event.parent);
        }

        let behavior = self.behavior_or_fail(tree, event.parent)?;
        let child = tree.node(event.child)?.clone();
        let node = tree.node_mut(event.parent)?;
        if node.state() == JobState::WaitingForSubjob {
            node.transition_to(JobState::Runnable)?;
        }
        match behavior.on_child_complete(node, &child, &event) {
            Ok(result) => self.apply_result(tree, event.parent, behavior.as_ref(), result, Phase::ChildComplete),
            Err(e) => self.fail(tree, event.parent, e),
        }
    }

    /// Deliver an external response. A response for a finished job is
    /// dropped when the kind accepts it and reported otherwise; neither
    /// changes any state.
    pub fn on_external_response(&self, tree: &mut JobTree, response: ExternalResponse) -> Result<(), JobError> {
        let id = response.job;
        let behavior = self.behavior_for(tree, id)?;
        let node = tree.node_mut(id)?;
        let state = node.state();
        if !matches!(state, JobState::Runnable | JobState::WaitingForSubjob) {
            if behavior.accepts_unexpected_response(&response, state) {
                tracing::debug!(job_id = %id, %state, "Dropping accepted unexpected response");
                return Ok(());
            }
            return Err(JobError::UnexpectedResponse { job: id, state });
        }

        match behavior.on_external_response(node, &response) {
            Ok(result) => self.apply_result(tree, id, behavior.as_ref(), result, Phase::Response),
            Err(e) => self.fail(tree, id, e),
        }
    }

    /// Handle an elapsed deadline reported by the external scheduler.
    pub fn on_timeout(
        &self,
        tree: &mut JobTree,
        id: JobId,
        kind: DeadlineKind,
        deadline: DateTime<Utc>,
    ) -> Result<(), JobError> {
        if tree.node(id)?.is_terminal() {
            tracing::debug!(job_id = %id, %kind, "Ignoring timeout for finished job");
            return Ok(());
        }
        match kind {
            DeadlineKind::Allocation => self.allocate(tree, id).map(|_| ()),
            DeadlineKind::AllocationCeiling => {
                tracing::warn!(job_id = %id, %deadline, "Allocation ceiling exceeded");
                self.fail(tree, id, JobError::Timeout { job: id, deadline })
            }
            DeadlineKind::Execution | DeadlineKind::TimeLimit => {
                let behavior = self.behavior_or_fail(tree, id)?;
                let node = tree.node_mut(id)?;
                match behavior.on_timeout(node, kind, deadline) {
                    Ok(TimeoutAction::Extend(by)) => {
                        let next = node.set_next_expected_execution_duration_at(by, self.now());
                        tracing::debug!(job_id = %id, %kind, next_deadline = %next, "Execution deadline extended");
                        self.rearm_time_limit(tree, id, kind)
                    }
                    Ok(TimeoutAction::Retry(children)) if children.is_empty() => {
                        tracing::warn!(job_id = %id, %kind, "Timeout retry spawned no children");
                        self.fail(tree, id, JobError::Timeout { job: id, deadline })
                    }
                    Ok(TimeoutAction::Retry(children)) => {
                        tracing::info!(job_id = %id, %kind, retries = children.len(), "Retrying after timeout");
                        let result = ExecutionResult::spawn(children);
                        self.apply_result(tree, id, behavior.as_ref(), result, Phase::Timeout)?;
                        self.rearm_time_limit(tree, id, kind)
                    }
                    Ok(TimeoutAction::Complete) => self.complete(tree, id),
                    Err(e) => self.fail(tree, id, e),
                }
            }
        }
    }

    /// A handled time limit moves to the job's new execution deadline so the
    /// next poll does not report it again.
    fn rearm_time_limit(&self, tree: &mut JobTree, id: JobId, kind: DeadlineKind) -> Result<(), JobError> {
        if kind != DeadlineKind::TimeLimit {
            return Ok(());
        }
        let node = tree.node_mut(id)?;
        if node.is_terminal() {
            return Ok(());
        }
        if let Some(until) = node.deadlines().execution() {
            node.extend_time_limit_to(until);
            tracing::debug!(job_id = %id, time_limit_ms = node.time_limit().as_millis() as u64, "Time limit extended");
        }
        Ok(())
    }

    // -- Termination ----------------------------------------------------------

    /// Cancel `id` and its active descendants, leaves first. Only `id` itself
    /// reports upward: its parent sees a failed child, a root notifies the
    /// request with `false`. Cancelling a finished job does nothing.
    pub fn cancel(&self, tree: &mut JobTree, id: JobId) -> Result<(), JobError> {
        let now = self.now();
        let cancelled = tree.cancel_cascade(id, now, &mut |node: &JobNode| self.release(node))?;
        if cancelled.is_empty() {
            tracing::debug!(job_id = %id, "Job already finished, nothing to cancel");
            return Ok(());
        }
        tracing::info!(job_id = %id, cancelled = cancelled.len(), "Cancelled job");
        tree.propagate(id, Some(JobError::Cancelled { job: id }), self.provider.as_ref())
    }

    /// Complete `id` successfully. Any still-active descendants are
    /// cancelled first.
    pub fn complete(&self, tree: &mut JobTree, id: JobId) -> Result<(), JobError> {
        self.finish(tree, id, JobOutcome::Success, None)
    }

    /// Complete `id` with `error` and report it upward. Unlike internal
    /// failures this is a requested outcome, so it returns `Ok`.
    pub fn complete_with_error(&self, tree: &mut JobTree, id: JobId, error: JobError) -> Result<(), JobError> {
        self.finish(tree, id, JobOutcome::Failure, Some(error))
    }

    fn fail<T>(&self, tree: &mut JobTree, id: JobId, error: JobError) -> Result<T, JobError> {
        self.finish(tree, id, JobOutcome::Failure, Some(error.clone()))?;
        Err(error)
    }

    fn finish(
        &self,
        tree: &mut JobTree,
        id: JobId,
        outcome: JobOutcome,
        error: Option<JobError>,
    ) -> Result<(), JobError> {
        if tree.node(id)?.is_terminal() {
            return Ok(());
        }
        self.settle(tree, id, outcome)?;
        let node = tree.node(id)?;
        tracing::info!(
            job_id = %id,
            kind = %node.kind(),
            state = %node.state(),
            elapsed_secs = node.elapsed_time(),
            "Job finished"
        );
        tree.propagate(id, error, self.provider.as_ref())
    }

    /// Cancel leftover descendants, then move `id` to `outcome` and release
    /// its resources. Nothing is reported upward.
    fn settle(&self, tree: &mut JobTree, id: JobId, outcome: JobOutcome) -> Result<(), JobError> {
        let now = self.now();
        let mut release = |node: &JobNode| self.release(node);
        let orphans = tree.cancel_descendants(id, now, &mut release)?;
        if !orphans.is_empty() {
            tracing::debug!(job_id = %id, cancelled = orphans.len(), "Cancelled leftover descendants");
        }
        tree.settle(id, outcome, now, &mut release)
    }

    fn release(&self, node: &JobNode) {
        if let Some(behavior) = self.registry.get(node.kind()) {
            tracing::debug!(job_id = %node.id(), kind = %node.kind(), "Releasing job resources");
            behavior.release_resources(node);
        }
    }

    // -- Results --------------------------------------------------------------

    fn apply_result(
        &self,
        tree: &mut JobTree,
        id: JobId,
        behavior: &dyn JobBehavior,
        result: ExecutionResult,
        phase: Phase,
    ) -> Result<(), JobError> {
        if !result.success {
            return self.fail(tree, id, JobError::failed(id, "job reported failure"));
        }

        let now = self.now();
        if !result.children.is_empty() {
            let mut spawned = Vec::with_capacity(result.children.len());
            for spec in result.children {
                spawned.push(tree.add_child(id, spec, now)?);
            }
            let node = tree.node_mut(id)?;
            node.transition_to(JobState::WaitingForSubjob)?;
            node.set_next_expected_execution_duration_at(behavior.child_complete_window(&self.config), now);
            tracing::debug!(job_id = %id, ?phase, children = spawned.len(), "Waiting for child jobs");

            for child in spawned {
                // A failing child reports to this job through the provider.
                if let Err(e) = self.submit(tree, child) {
                    tracing::debug!(job_id = %id, child_id = %child, error = %e, "Child submission failed");
                }
            }
            return Ok(());
        }

        if result.awaiting_response && !behavior.is_single_action() {
            let node = tree.node_mut(id)?;
            node.transition_to(JobState::Runnable)?;
            node.set_next_expected_execution_duration_at(behavior.response_window(&self.config), now);
            tracing::debug!(job_id = %id, ?phase, "Waiting for external response");
            return Ok(());
        }

        if tree.has_active_children(id) {
            let node = tree.node_mut(id)?;
            node.transition_to(JobState::WaitingForSubjob)?;
            node.set_next_expected_execution_duration_at(behavior.child_complete_window(&self.config), now);
            return Ok(());
        }

        self.complete(tree, id)
    }
}
