// crates/core/src/jobs/types.rs
//! Types shared across the job engine.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::state::JobState;
use crate::error::JobError;

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a job. Unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(u64);

impl JobId {
    pub(crate) fn next() -> Self {
        Self(NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tag naming a concrete job behavior (e.g. `"ask_question"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct JobKind(&'static str);

impl JobKind {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Default scheduling priority.
pub const DEFAULT_PRIORITY: u32 = 5;

/// A typed job parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ParamValue {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Json(serde_json::Value),
}

impl ParamValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<serde_json::Value> for ParamValue {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

/// Job parameters keyed by name.
pub type Parameters = HashMap<String, ParamValue>;

/// Opaque handle to a resource held by a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceHandle(pub String);

/// Description of a job to create. Behaviors return these to spawn children;
/// the tree turns them into nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub kind: JobKind,
    pub parameters: Parameters,
    pub priority: u32,
    /// Overall time limit measured from start. Zero means unlimited.
    pub time_limit: Duration,
    pub iterations: u32,
}

impl JobSpec {
    pub fn new(kind: JobKind) -> Self {
        Self {
            kind,
            parameters: Parameters::new(),
            priority: DEFAULT_PRIORITY,
            time_limit: Duration::ZERO,
            iterations: 0,
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = limit;
        self
    }

    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations;
        self
    }
}

/// What a behavior asks the engine to do after start, a child completion,
/// an external response, or a retrying timeout.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionResult {
    pub success: bool,
    /// Children to attach and submit, in order.
    pub children: Vec<JobSpec>,
    /// Keep running and wait for an external response instead of completing.
    pub awaiting_response: bool,
}

impl ExecutionResult {
    /// Nothing left to do; the job completes once no children are active.
    pub fn done() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn spawn(children: Vec<JobSpec>) -> Self {
        Self {
            success: true,
            children,
            awaiting_response: false,
        }
    }

    pub fn awaiting_response() -> Self {
        Self {
            success: true,
            children: Vec::new(),
            awaiting_response: true,
        }
    }

    pub fn failed() -> Self {
        Self::default()
    }
}

/// What a behavior wants done about an elapsed execution deadline.
#[derive(Debug, Clone, PartialEq)]
pub enum TimeoutAction {
    /// Re-arm the execution deadline `now + duration`.
    Extend(Duration),
    /// Spawn replacement children and keep waiting.
    Retry(Vec<JobSpec>),
    /// Accept what has been produced so far and complete successfully.
    Complete,
}

/// Child-completion event delivered to a parent.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildCompletion {
    pub parent: JobId,
    pub child: JobId,
    pub success: bool,
    pub error: Option<JobError>,
}

impl ChildCompletion {
    pub fn success(parent: JobId, child: JobId) -> Self {
        Self {
            parent,
            child,
            success: true,
            error: None,
        }
    }

    pub fn failure(parent: JobId, child: JobId, error: JobError) -> Self {
        Self {
            parent,
            child,
            success: false,
            error: Some(error),
        }
    }
}

/// Asynchronous response from an external service, keyed to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalResponse {
    pub job: JobId,
    pub payload: serde_json::Value,
}

/// Progress snapshot of a single job, broadcast by the tree driver.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub job_id: JobId,
    pub parent_id: Option<JobId>,
    pub kind: String,
    pub state: JobState,
    pub percent_complete: f64,
    pub elapsed_secs: f64,
    pub iteration_count: u32,
    pub original_iteration_count: u32,
    pub marked_for_cancellation: bool,
    pub timestamp: String,
}
