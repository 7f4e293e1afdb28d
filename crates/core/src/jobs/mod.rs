// crates/core/src/jobs/mod.rs
//! Hierarchical job engine.
//!
//! Provides:
//! - `JobTree`: arena of `JobNode`s linked by `JobId`
//! - `Lifecycle`: the entry points that move jobs through `JobState`
//! - `JobBehavior` / `BehaviorRegistry`: per-kind logic
//! - `TreeDriver`: single-consumer event loop with progress broadcast

pub mod behavior;
pub mod deadline;
pub mod driver;
pub mod lifecycle;
pub mod node;
pub mod provider;
pub mod state;
pub mod tree;
pub mod types;

pub use behavior::{fail_on_child_error, BehaviorRegistry, JobBehavior};
pub use deadline::{DeadlineConfig, DeadlineKind, Deadlines};
pub use driver::{DriverHandle, JobEvent, QueueProvider, TreeDriver};
pub use lifecycle::Lifecycle;
pub use node::JobNode;
pub use provider::{Provider, Request};
pub use state::{JobOutcome, JobState};
pub use tree::{JobTree, OverdueJob};
pub use types::{
    ChildCompletion, ExecutionResult, ExternalResponse, JobId, JobKind, JobProgress, JobSpec, ParamValue,
    Parameters, ResourceHandle, TimeoutAction, DEFAULT_PRIORITY,
};
