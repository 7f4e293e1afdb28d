// crates/core/src/jobs/driver.rs
//! Single-consumer event loop that drives one job tree.
//!
//! The lifecycle never calls itself across tree levels; it hands control
//! back through [`Provider`]. [`QueueProvider`] turns those calls into
//! [`JobEvent`]s on an unbounded queue, and [`TreeDriver::run`] consumes
//! them one at a time, so no two handlers ever touch the tree at once.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::behavior::BehaviorRegistry;
use super::deadline::DeadlineKind;
use super::lifecycle::Lifecycle;
use super::node::JobNode;
use super::provider::Provider;
use super::state::JobState;
use super::tree::JobTree;
use super::types::{ChildCompletion, ExternalResponse, JobId, JobProgress};
use crate::clock::Clock;
use crate::config::EngineConfig;

/// Work item for a tree driver.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Start(JobId),
    ChildComplete(ChildCompletion),
    ExternalResponse(ExternalResponse),
    Timeout {
        job: JobId,
        kind: DeadlineKind,
        deadline: DateTime<Utc>,
    },
    Cancel(JobId),
    /// Ask the driver to look for elapsed deadlines and handle them.
    CheckDeadlines,
}

impl JobEvent {
    fn job(&self) -> Option<JobId> {
        match self {
            Self::Start(id) | Self::Cancel(id) => Some(*id),
            Self::ChildComplete(event) => Some(event.parent),
            Self::ExternalResponse(response) => Some(response.job),
            Self::Timeout { job, .. } => Some(*job),
            Self::CheckDeadlines => None,
        }
    }
}

/// [`Provider`] that enqueues onto a driver's event queue.
#[derive(Debug, Clone)]
pub struct QueueProvider {
    tx: mpsc::UnboundedSender<JobEvent>,
}

impl QueueProvider {
    pub fn new(tx: mpsc::UnboundedSender<JobEvent>) -> Self {
        Self { tx }
    }

    fn send(&self, event: JobEvent) {
        if self.tx.send(event).is_err() {
            tracing::warn!("Job driver stopped, dropping event");
        }
    }
}

impl Provider for QueueProvider {
    fn request_start(&self, job: JobId) {
        self.send(JobEvent::Start(job));
    }

    fn pass_control_to_parent_on_child_complete(&self, event: ChildCompletion) {
        self.send(JobEvent::ChildComplete(event));
    }
}

/// Cloneable sender for events that originate outside the tree.
#[derive(Debug, Clone)]
pub struct DriverHandle {
    tx: mpsc::UnboundedSender<JobEvent>,
}

impl DriverHandle {
    /// Enqueue `event`. Returns false once the driver has stopped.
    pub fn send(&self, event: JobEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn respond(&self, job: JobId, payload: serde_json::Value) -> bool {
        self.send(JobEvent::ExternalResponse(ExternalResponse { job, payload }))
    }

    pub fn timeout(&self, job: JobId, kind: DeadlineKind, deadline: DateTime<Utc>) -> bool {
        self.send(JobEvent::Timeout { job, kind, deadline })
    }

    pub fn cancel(&self, job: JobId) -> bool {
        self.send(JobEvent::Cancel(job))
    }

    pub fn check_deadlines(&self) -> bool {
        self.send(JobEvent::CheckDeadlines)
    }
}

/// Owns one job tree and serializes every event delivered to it.
///
/// Call `run` (or `spawn`) to submit the root and process events until the
/// root is terminal; the finished tree is returned.
pub struct TreeDriver {
    tree: JobTree,
    lifecycle: Lifecycle,
    rx: mpsc::UnboundedReceiver<JobEvent>,
    tx: mpsc::UnboundedSender<JobEvent>,
    progress_tx: broadcast::Sender<JobProgress>,
}

impl TreeDriver {
    pub fn new(
        tree: JobTree,
        registry: Arc<BehaviorRegistry>,
        clock: Arc<dyn Clock>,
        config: &EngineConfig,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (progress_tx, _) = broadcast::channel(config.progress_buffer.max(1));
        let provider = Arc::new(QueueProvider::new(tx.clone()));
        let lifecycle = Lifecycle::new(registry, provider, clock, config.deadlines);
        Self {
            tree,
            lifecycle,
            rx,
            tx,
            progress_tx,
        }
    }

    pub fn handle(&self) -> DriverHandle {
        DriverHandle { tx: self.tx.clone() }
    }

    /// Subscribe to per-event progress snapshots.
    pub fn subscribe(&self) -> broadcast::Receiver<JobProgress> {
        self.progress_tx.subscribe()
    }

    pub fn tree(&self) -> &JobTree {
        &self.tree
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Spawn `run` on the tokio runtime.
    pub fn spawn(self) -> JoinHandle<JobTree> {
        tokio::spawn(self.run())
    }

    /// Submit the root, then handle events until the root is terminal.
    /// Events already queued at that point are drained before returning.
    pub async fn run(mut self) -> JobTree {
        let root = self.tree.root_id();
        tracing::info!(root_id = %root, kind = %self.tree.root().kind(), "Job tree started");
        if let Err(e) = self.lifecycle.submit(&mut self.tree, root) {
            tracing::warn!(job_id = %root, error = %e, "Root submission failed");
        }
        self.publish(root);

        while !self.tree.root().is_terminal() {
            // `self.tx` keeps the queue open, so `None` is unreachable here.
            let Some(event) = self.rx.recv().await else {
                break;
            };
            self.dispatch(event);
        }

        while let Ok(event) = self.rx.try_recv() {
            self.dispatch(event);
        }
        self.tree
    }

    /// Handle one event, log any error it returns and publish progress for
    /// the event's job and every job the event created or moved.
    pub fn dispatch(&mut self, event: JobEvent) {
        let job = event.job();
        let before: Vec<JobState> = self.tree.iter().map(JobNode::state).collect();
        let result = match event {
            JobEvent::Start(id) => self.lifecycle.start(&mut self.tree, id),
            JobEvent::ChildComplete(event) => self.lifecycle.on_child_complete(&mut self.tree, event),
            JobEvent::ExternalResponse(response) => {
                self.lifecycle.on_external_response(&mut self.tree, response)
            }
            JobEvent::Timeout { job, kind, deadline } => {
                self.lifecycle.on_timeout(&mut self.tree, job, kind, deadline)
            }
            JobEvent::Cancel(id) => self.lifecycle.cancel(&mut self.tree, id),
            JobEvent::CheckDeadlines => {
                self.check_deadlines();
                Ok(())
            }
        };

        if let Err(e) = result {
            tracing::warn!(job_id = ?job, error = %e, "Job event failed");
        }
        let touched: Vec<JobId> = self
            .tree
            .iter()
            .enumerate()
            .filter(|(i, node)| before.get(*i) != Some(&node.state()) || Some(node.id()) == job)
            .map(|(_, node)| node.id())
            .collect();
        for id in touched {
            self.publish(id);
        }
    }

    fn check_deadlines(&mut self) {
        let now = self.lifecycle.now();
        let overdue = self.tree.overdue_jobs(now, self.lifecycle.config());
        for entry in overdue {
            tracing::debug!(job_id = %entry.job, kind = %entry.kind, deadline = %entry.deadline, "Deadline elapsed");
            if let Err(e) = self
                .lifecycle
                .on_timeout(&mut self.tree, entry.job, entry.kind, entry.deadline)
            {
                tracing::warn!(job_id = %entry.job, error = %e, "Timeout handling failed");
            }
        }
    }

    fn publish(&mut self, id: JobId) {
        let now = self.lifecycle.now();
        if let Some(node) = self.tree.get_mut(id) {
            node.refresh_percent_complete(now);
            // No receivers is fine.
            let _ = self.progress_tx.send(node.progress(now));
        }
    }
}
