// crates/core/src/jobs/provider.rs
//! Collaborators the engine hands control back to.

use super::types::{ChildCompletion, JobId};

/// The driver side of the lifecycle protocol.
///
/// The engine calls these to return control to whatever schedules the tree;
/// it never recurses across tree levels itself.
///
/// Implementations include:
/// - `QueueProvider`: enqueues onto a tree driver's event queue
/// - test recorders that collect calls for inspection
pub trait Provider: Send + Sync {
    /// The job is RUNNABLE and should be started when the driver sees fit.
    fn request_start(&self, job: JobId);

    /// A child reached a terminal state; deliver `event` to its parent's
    /// child-completion entry point. `event.error` carries the cause on
    /// failure.
    fn pass_control_to_parent_on_child_complete(&self, event: ChildCompletion);
}

/// The client request a job tree serves. Completed exactly once by the root.
pub trait Request: Send + Sync {
    fn complete(&self, success: bool);
}
