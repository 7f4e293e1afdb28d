// Shared harness for the jobtree-core integration tests.
//
// Drives a tree synchronously: the provider records events and `pump`
// delivers them one at a time, the way a tree driver would.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use jobtree_core::{
    BehaviorRegistry, ChildCompletion, DeadlineConfig, JobEvent, JobId, JobSpec, JobState, JobTree, Lifecycle,
    ManualClock, Provider, Request,
};

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 5, 12, 0, 0).unwrap()
}

#[derive(Default)]
pub struct RecordingProvider {
    events: Mutex<VecDeque<JobEvent>>,
}

impl RecordingProvider {
    pub fn pop(&self) -> Option<JobEvent> {
        self.events.lock().unwrap().pop_front()
    }
}

impl Provider for RecordingProvider {
    fn request_start(&self, job: JobId) {
        self.events.lock().unwrap().push_back(JobEvent::Start(job));
    }

    fn pass_control_to_parent_on_child_complete(&self, event: ChildCompletion) {
        self.events.lock().unwrap().push_back(JobEvent::ChildComplete(event));
    }
}

/// Records every `complete` call.
#[derive(Default)]
pub struct RecordingRequest {
    outcomes: Mutex<Vec<bool>>,
}

impl RecordingRequest {
    pub fn outcomes(&self) -> Vec<bool> {
        self.outcomes.lock().unwrap().clone()
    }
}

impl Request for RecordingRequest {
    fn complete(&self, success: bool) {
        self.outcomes.lock().unwrap().push(success);
    }
}

/// Counts resource releases per job.
#[derive(Default)]
pub struct ReleaseLog {
    released: Mutex<Vec<JobId>>,
    pub count: AtomicUsize,
}

impl ReleaseLog {
    pub fn record(&self, job: JobId) {
        self.released.lock().unwrap().push(job);
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn released(&self) -> Vec<JobId> {
        self.released.lock().unwrap().clone()
    }
}

pub struct Harness {
    pub lifecycle: Lifecycle,
    pub provider: Arc<RecordingProvider>,
    pub clock: Arc<ManualClock>,
    pub request: Arc<RecordingRequest>,
    pub tree: JobTree,
    pub errors: Vec<jobtree_core::JobError>,
}

impl Harness {
    pub fn new(registry: BehaviorRegistry, root: JobSpec) -> Self {
        let provider = Arc::new(RecordingProvider::default());
        let clock = Arc::new(ManualClock::new(t0()));
        let request = Arc::new(RecordingRequest::default());
        let lifecycle = Lifecycle::new(
            Arc::new(registry),
            provider.clone(),
            clock.clone(),
            DeadlineConfig::default(),
        );
        let tree = JobTree::new(root, Some(request.clone()), t0());
        Self {
            lifecycle,
            provider,
            clock,
            request,
            tree,
            errors: Vec::new(),
        }
    }

    pub fn root(&self) -> JobId {
        self.tree.root_id()
    }

    pub fn state(&self, id: JobId) -> JobState {
        self.tree.get(id).map(|n| n.state()).unwrap()
    }

    /// Submit the root and deliver events until the queue is empty.
    pub fn run(&mut self) {
        let root = self.root();
        if let Err(e) = self.lifecycle.submit(&mut self.tree, root) {
            self.errors.push(e);
        }
        self.pump();
    }

    pub fn pump(&mut self) {
        while let Some(event) = self.provider.pop() {
            let result = match event {
                JobEvent::Start(id) => self.lifecycle.start(&mut self.tree, id),
                JobEvent::ChildComplete(e) => self.lifecycle.on_child_complete(&mut self.tree, e),
                other => panic!("provider emitted {other:?}"),
            };
            if let Err(e) = result {
                self.errors.push(e);
            }
        }
    }

    pub fn respond(&mut self, job: JobId, payload: serde_json::Value) {
        let response = jobtree_core::ExternalResponse { job, payload };
        if let Err(e) = self.lifecycle.on_external_response(&mut self.tree, response) {
            self.errors.push(e);
        }
        self.pump();
    }

    pub fn cancel(&mut self, job: JobId) {
        if let Err(e) = self.lifecycle.cancel(&mut self.tree, job) {
            self.errors.push(e);
        }
        self.pump();
    }
}
