// crates/core/src/jobs/tree.rs
//! Arena-backed job tree: parent/child links, descendant queries,
//! cancellation cascade and completion propagation.
//!
//! Nodes live in insertion order in a `Vec`; links are [`JobId`]s resolved
//! through an index, so a parent and its children never hold references to
//! each other.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::deadline::{DeadlineConfig, DeadlineKind};
use super::node::JobNode;
use super::provider::{Provider, Request};
use super::state::{JobOutcome, JobState};
use super::types::{ChildCompletion, JobId, JobProgress, JobSpec};
use crate::error::JobError;

/// A job whose deadline elapsed, as reported by [`JobTree::overdue_jobs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverdueJob {
    pub job: JobId,
    pub kind: DeadlineKind,
    pub deadline: DateTime<Utc>,
}

/// One job tree serving one client request.
pub struct JobTree {
    nodes: Vec<JobNode>,
    index: HashMap<JobId, usize>,
    request: Option<Arc<dyn Request>>,
    request_notified: bool,
}

impl JobTree {
    pub fn new(root: JobSpec, request: Option<Arc<dyn Request>>, now: DateTime<Utc>) -> Self {
        let id = JobId::next();
        let mut index = HashMap::new();
        index.insert(id, 0);
        Self {
            nodes: vec![JobNode::new(id, root, None, now)],
            index,
            request,
            request_notified: false,
        }
    }

    pub fn root_id(&self) -> JobId {
        self.nodes[0].id()
    }

    pub fn root(&self) -> &JobNode {
        &self.nodes[0]
    }

    pub fn get(&self, id: JobId) -> Option<&JobNode> {
        self.index.get(&id).map(|&i| &self.nodes[i])
    }

    pub fn get_mut(&mut self, id: JobId) -> Option<&mut JobNode> {
        match self.index.get(&id) {
            Some(&i) => Some(&mut self.nodes[i]),
            None => None,
        }
    }

    pub fn node(&self, id: JobId) -> Result<&JobNode, JobError> {
        self.get(id).ok_or(JobError::NotFound(id))
    }

    pub fn node_mut(&mut self, id: JobId) -> Result<&mut JobNode, JobError> {
        self.get_mut(id).ok_or(JobError::NotFound(id))
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes in insertion order, root first.
    pub fn iter(&self) -> impl Iterator<Item = &JobNode> {
        self.nodes.iter()
    }

    /// Whether the root's outcome has been reported to the request.
    pub fn request_notified(&self) -> bool {
        self.request_notified
    }

    /// Create a node for `spec` under `parent` and return its id.
    pub fn add_child(&mut self, parent: JobId, spec: JobSpec, now: DateTime<Utc>) -> Result<JobId, JobError> {
        let id = JobId::next();
        self.node_mut(parent)?.push_child(id);
        self.index.insert(id, self.nodes.len());
        self.nodes.push(JobNode::new(id, spec, Some(parent), now));
        tracing::debug!(parent_id = %parent, child_id = %id, "Attached child job");
        Ok(id)
    }

    pub fn children(&self, id: JobId) -> &[JobId] {
        self.get(id).map(JobNode::children).unwrap_or(&[])
    }

    pub fn parent(&self, id: JobId) -> Option<JobId> {
        self.get(id).and_then(JobNode::parent)
    }

    /// Direct children that are not in a terminal state.
    pub fn active_children(&self, id: JobId) -> Vec<JobId> {
        self.children(id)
            .iter()
            .copied()
            .filter(|c| self.get(*c).is_some_and(|n| !n.is_terminal()))
            .collect()
    }

    pub fn has_active_children(&self, id: JobId) -> bool {
        self.children(id)
            .iter()
            .any(|c| self.get(*c).is_some_and(|n| !n.is_terminal()))
    }

    /// Every descendant, depth-first, parents before their children.
    pub fn all_descendants(&self, id: JobId) -> Vec<JobId> {
        let mut out = Vec::new();
        let mut stack: Vec<JobId> = self.children(id).iter().rev().copied().collect();
        while let Some(next) = stack.pop() {
            out.push(next);
            stack.extend(self.children(next).iter().rev().copied());
        }
        out
    }

    /// Every non-terminal descendant, depth-first, parents first.
    pub fn all_active_descendants(&self, id: JobId) -> Vec<JobId> {
        self.all_descendants(id)
            .into_iter()
            .filter(|d| self.get(*d).is_some_and(|n| !n.is_terminal()))
            .collect()
    }

    /// Non-terminal descendants with every child listed before its parent.
    fn active_descendants_leaf_first(&self, id: JobId) -> Vec<JobId> {
        let mut out = Vec::new();
        self.collect_post_order(id, &mut out);
        out.pop();
        out.retain(|d| self.get(*d).is_some_and(|n| !n.is_terminal()));
        out
    }

    fn collect_post_order(&self, id: JobId, out: &mut Vec<JobId>) {
        for &child in self.children(id) {
            self.collect_post_order(child, out);
        }
        out.push(id);
    }

    /// Ancestors of `id`, closest first.
    pub fn ancestors(&self, id: JobId) -> Vec<JobId> {
        let mut out = Vec::new();
        let mut current = self.parent(id);
        while let Some(p) = current {
            out.push(p);
            current = self.parent(p);
        }
        out
    }

    /// The outermost ancestor of `id`, or `id` itself when it has no parent.
    pub fn top_parent(&self, id: JobId) -> Option<JobId> {
        if !self.contains(id) {
            return None;
        }
        Some(self.ancestors(id).last().copied().unwrap_or(id))
    }

    /// Flag `id` and its active descendants for cooperative cancellation.
    /// States are not touched. Returns how many nodes were flagged.
    pub fn mark_for_cancellation(&mut self, id: JobId) -> Result<usize, JobError> {
        let mut targets = self.all_active_descendants(id);
        if !self.node(id)?.is_terminal() {
            targets.push(id);
        }
        for target in &targets {
            self.node_mut(*target)?.mark_for_cancellation();
        }
        tracing::debug!(job_id = %id, flagged = targets.len(), "Marked jobs for cancellation");
        Ok(targets.len())
    }

    /// Live jobs whose deadline elapsed at `now`. One entry per job; the time
    /// limit wins over the execution window and the hard allocation ceiling
    /// over the soft window.
    pub fn overdue_jobs(&self, now: DateTime<Utc>, config: &DeadlineConfig) -> Vec<OverdueJob> {
        self.nodes
            .iter()
            .filter_map(|node| {
                let deadlines = node.deadlines();
                let (kind, deadline) = match node.state() {
                    JobState::NeedsResources => {
                        if deadlines.allocation_ceiling_exceeded_at(config.allocation_ceiling, now) {
                            (
                                DeadlineKind::AllocationCeiling,
                                deadlines.allocation_ceiling(config.allocation_ceiling),
                            )
                        } else if deadlines.allocation_overdue_at(now) {
                            (DeadlineKind::Allocation, deadlines.allocation()?)
                        } else {
                            return None;
                        }
                    }
                    JobState::Runnable | JobState::WaitingForSubjob => {
                        if node.has_time_limit_expired_at(now) {
                            (
                                DeadlineKind::TimeLimit,
                                deadlines.time_limit_deadline(node.started_at())?,
                            )
                        } else if deadlines.execution_overdue_at(now) {
                            (DeadlineKind::Execution, deadlines.execution()?)
                        } else {
                            return None;
                        }
                    }
                    _ => return None,
                };
                Some(OverdueJob {
                    job: node.id(),
                    kind,
                    deadline,
                })
            })
            .collect()
    }

    /// Progress of every node in insertion order.
    pub fn snapshot(&self, now: DateTime<Utc>) -> Vec<JobProgress> {
        self.nodes.iter().map(|n| n.progress(now)).collect()
    }

    /// Bulk maintenance: set every live job whose state is not in `excluded`
    /// to the terminal `new_state` and stamp its completion time. Finished
    /// jobs keep their outcome. No events are raised and no resources
    /// released. Returns the number of jobs touched.
    pub fn stamp_state_where_not_in(
        &mut self,
        excluded: &[JobState],
        new_state: JobState,
        now: DateTime<Utc>,
    ) -> Result<usize, JobError> {
        if !new_state.is_terminal() {
            return Err(JobError::NonTerminalTarget(new_state));
        }
        let mut touched = 0;
        for node in self.nodes.iter_mut().filter(|n| !n.is_terminal() && !excluded.contains(&n.state())) {
            node.stamp_terminal(new_state, now);
            touched += 1;
        }
        tracing::info!(touched, state = %new_state, "Stamped job states");
        Ok(touched)
    }

    /// Cancel every active descendant of `id`, leaves first. `release` runs
    /// once per node whose resources were not yet released. The descendants'
    /// parents are not signalled. Returns the cancelled ids.
    pub(crate) fn cancel_descendants(
        &mut self,
        id: JobId,
        now: DateTime<Utc>,
        release: &mut dyn FnMut(&JobNode),
    ) -> Result<Vec<JobId>, JobError> {
        let targets = self.active_descendants_leaf_first(id);
        for target in &targets {
            self.settle(*target, JobOutcome::Cancelled, now, release)?;
        }
        Ok(targets)
    }

    /// Cancel `id` after its active descendants. A terminal `id` is left
    /// alone. Returns every cancelled id, `id` last.
    pub(crate) fn cancel_cascade(
        &mut self,
        id: JobId,
        now: DateTime<Utc>,
        release: &mut dyn FnMut(&JobNode),
    ) -> Result<Vec<JobId>, JobError> {
        if self.node(id)?.is_terminal() {
            return Ok(Vec::new());
        }
        let mut cancelled = self.cancel_descendants(id, now, release)?;
        self.settle(id, JobOutcome::Cancelled, now, release)?;
        cancelled.push(id);
        Ok(cancelled)
    }

    /// Drive one live node to `outcome` and release its resources.
    pub(crate) fn settle(
        &mut self,
        id: JobId,
        outcome: JobOutcome,
        now: DateTime<Utc>,
        release: &mut dyn FnMut(&JobNode),
    ) -> Result<(), JobError> {
        let node = self.node_mut(id)?;
        if node.is_terminal() {
            return Ok(());
        }
        if outcome == JobOutcome::Cancelled {
            node.mark_for_cancellation();
        }
        node.finish(outcome, now)?;
        node.refresh_percent_complete(now);
        if node.begin_release() {
            release(node);
        }
        Ok(())
    }

    /// Report a terminal job upward: to its parent through `provider`, or for
    /// the root to the request, exactly once. Live jobs are ignored.
    pub(crate) fn propagate(
        &mut self,
        id: JobId,
        error: Option<JobError>,
        provider: &dyn Provider,
    ) -> Result<(), JobError> {
        let node = self.node(id)?;
        let Some(outcome) = node.outcome() else {
            return Ok(());
        };
        match node.parent() {
            Some(parent) => {
                provider.pass_control_to_parent_on_child_complete(ChildCompletion {
                    parent,
                    child: id,
                    success: outcome.is_success(),
                    error,
                });
            }
            None => self.notify_request(outcome.is_success()),
        }
        Ok(())
    }

    fn notify_request(&mut self, success: bool) {
        if std::mem::replace(&mut self.request_notified, true) {
            return;
        }
        tracing::info!(root_id = %self.root_id(), success, "Job tree finished");
        if let Some(request) = &self.request {
            request.complete(success);
        }
    }
}

impl fmt::Debug for JobTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobTree")
            .field("nodes", &self.nodes)
            .field("has_request", &self.request.is_some())
            .field("request_notified", &self.request_notified)
            .finish()
    }
}
