// End-to-end job tree scenarios driven through the lifecycle entry points.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{Harness, ReleaseLog};
use jobtree_core::{
    fail_on_child_error, BehaviorRegistry, ChildCompletion, DeadlineKind, ExecutionResult, ExternalResponse,
    JobBehavior, JobError, JobKind, JobNode, JobSpec, JobState, TimeoutAction,
};
use pretty_assertions::assert_eq;

const FAN_OUT: JobKind = JobKind::new("fan_out");
const WORKER: JobKind = JobKind::new("worker");
const HOARDER: JobKind = JobKind::new("hoarder");
const STUBBORN: JobKind = JobKind::new("stubborn");

/// Spawns three workers; the first one fails on start when `fail_first`.
struct FanOut {
    fail_first: bool,
    absorb_failures: bool,
    seen_errors: Arc<Mutex<Vec<JobError>>>,
    releases: Arc<ReleaseLog>,
}

impl JobBehavior for FanOut {
    fn kind(&self) -> JobKind {
        FAN_OUT
    }

    fn start(&self, _job: &mut JobNode) -> Result<ExecutionResult, JobError> {
        let workers = (0..3)
            .map(|i| JobSpec::new(WORKER).with_parameter("fail", self.fail_first && i == 0))
            .collect();
        Ok(ExecutionResult::spawn(workers))
    }

    fn on_child_complete(
        &self,
        _job: &mut JobNode,
        _child: &JobNode,
        event: &ChildCompletion,
    ) -> Result<ExecutionResult, JobError> {
        if let Some(error) = &event.error {
            self.seen_errors.lock().unwrap().push(error.clone());
        }
        if !self.absorb_failures {
            fail_on_child_error(event)?;
        }
        Ok(ExecutionResult::done())
    }

    fn release_resources(&self, job: &JobNode) {
        self.releases.record(job.id());
    }
}

/// Waits for an answer unless told to fail.
struct Worker {
    releases: Arc<ReleaseLog>,
}

impl JobBehavior for Worker {
    fn kind(&self) -> JobKind {
        WORKER
    }

    fn start(&self, job: &mut JobNode) -> Result<ExecutionResult, JobError> {
        if job.parameter("fail").and_then(|v| v.as_bool()) == Some(true) {
            return Err(JobError::failed(job.id(), "model endpoint unavailable"));
        }
        Ok(ExecutionResult::awaiting_response())
    }

    fn on_external_response(
        &self,
        job: &mut JobNode,
        response: &ExternalResponse,
    ) -> Result<ExecutionResult, JobError> {
        if response.payload == serde_json::json!("fail") {
            return Err(JobError::failed(job.id(), "answer rejected"));
        }
        Ok(ExecutionResult::done())
    }

    fn release_resources(&self, job: &JobNode) {
        self.releases.record(job.id());
    }
}

/// Keeps going past its time limit, by retrying with `batch` workers or by
/// extending its deadline by `extend`.
struct Stubborn {
    batch: usize,
    extend: Duration,
}

impl JobBehavior for Stubborn {
    fn kind(&self) -> JobKind {
        STUBBORN
    }

    fn start(&self, _job: &mut JobNode) -> Result<ExecutionResult, JobError> {
        Ok(ExecutionResult::awaiting_response())
    }

    fn on_timeout(
        &self,
        _job: &mut JobNode,
        _kind: DeadlineKind,
        _deadline: chrono::DateTime<chrono::Utc>,
    ) -> Result<TimeoutAction, JobError> {
        if self.extend.is_zero() {
            Ok(TimeoutAction::Retry(vec![JobSpec::new(WORKER); self.batch]))
        } else {
            Ok(TimeoutAction::Extend(self.extend))
        }
    }
}

/// Never obtains its resources.
struct Hoarder;

impl JobBehavior for Hoarder {
    fn kind(&self) -> JobKind {
        HOARDER
    }

    fn allocate_resources(&self, _job: &mut JobNode) -> Result<bool, JobError> {
        Ok(false)
    }

    fn start(&self, _job: &mut JobNode) -> Result<ExecutionResult, JobError> {
        Ok(ExecutionResult::done())
    }
}

struct Setup {
    harness: Harness,
    seen_errors: Arc<Mutex<Vec<JobError>>>,
    releases: Arc<ReleaseLog>,
}

fn setup(fail_first: bool, absorb_failures: bool) -> Setup {
    let seen_errors = Arc::new(Mutex::new(Vec::new()));
    let releases = Arc::new(ReleaseLog::default());
    let registry = BehaviorRegistry::new()
        .with(FanOut {
            fail_first,
            absorb_failures,
            seen_errors: seen_errors.clone(),
            releases: releases.clone(),
        })
        .with(Worker {
            releases: releases.clone(),
        })
        .with(Hoarder);
    Setup {
        harness: Harness::new(registry, JobSpec::new(FAN_OUT)),
        seen_errors,
        releases,
    }
}

#[test]
fn test_failed_child_fails_parent_by_default() {
    let Setup { mut harness, releases, .. } = setup(true, false);
    harness.run();

    let root = harness.root();
    let children = harness.tree.children(root).to_vec();
    assert_eq!(children.len(), 3);
    assert_eq!(harness.state(root), JobState::CompletedError);
    assert_eq!(harness.state(children[0]), JobState::CompletedError);
    // Siblings still waiting when the parent failed are cancelled.
    assert_eq!(harness.state(children[1]), JobState::Cancelled);
    assert_eq!(harness.state(children[2]), JobState::Cancelled);
    assert_eq!(harness.request.outcomes(), vec![false]);
    assert_eq!(releases.count.load(std::sync::atomic::Ordering::SeqCst), 4);
    assert!(harness
        .errors
        .iter()
        .any(|e| matches!(e, JobError::ChildFailure { child, .. } if *child == children[0])));
}

#[test]
fn test_absorbing_parent_succeeds_after_all_children_report() {
    let Setup {
        mut harness,
        seen_errors,
        ..
    } = setup(true, true);
    harness.run();

    let root = harness.root();
    let children = harness.tree.children(root).to_vec();
    assert_eq!(harness.state(root), JobState::WaitingForSubjob);
    assert_eq!(harness.tree.active_children(root), vec![children[1], children[2]]);

    harness.respond(children[1], serde_json::json!("B"));
    assert_eq!(harness.state(root), JobState::WaitingForSubjob);
    assert!(harness.request.outcomes().is_empty());

    harness.respond(children[2], serde_json::json!("C"));
    assert_eq!(harness.state(root), JobState::CompletedSuccess);
    assert_eq!(harness.request.outcomes(), vec![true]);

    let seen = seen_errors.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(matches!(seen[0], JobError::Failed { .. }));
}

#[test]
fn test_cancel_cascade_releases_each_node_once() {
    let Setup { mut harness, releases, .. } = setup(false, false);
    harness.run();
    let root = harness.root();
    assert_eq!(harness.tree.all_active_descendants(root).len(), 3);

    harness.cancel(root);
    assert!(harness.tree.iter().all(|n| n.state() == JobState::Cancelled));
    assert!(harness.tree.iter().all(|n| n.completed_at().is_some()));
    assert_eq!(releases.count.load(std::sync::atomic::Ordering::SeqCst), 4);

    // Children are released before their parent.
    let released = releases.released();
    assert_eq!(released.last(), Some(&root));

    harness.cancel(root);
    assert_eq!(releases.count.load(std::sync::atomic::Ordering::SeqCst), 4);
    assert_eq!(harness.request.outcomes(), vec![false]);
    assert!(harness.errors.is_empty());
}

#[test]
fn test_cancelling_a_child_reports_cancelled_to_parent() {
    let Setup {
        mut harness,
        seen_errors,
        ..
    } = setup(false, true);
    harness.run();
    let root = harness.root();
    let children = harness.tree.children(root).to_vec();

    harness.cancel(children[1]);
    assert_eq!(harness.state(children[1]), JobState::Cancelled);
    assert_eq!(harness.state(root), JobState::WaitingForSubjob);
    assert_eq!(
        seen_errors.lock().unwrap().as_slice(),
        &[JobError::Cancelled { job: children[1] }]
    );
    assert!(harness.request.outcomes().is_empty());
}

#[test]
fn test_late_child_completion_is_ignored() {
    let Setup { mut harness, .. } = setup(false, false);
    harness.run();
    let root = harness.root();
    let child = harness.tree.children(root)[0];
    harness.cancel(root);

    let late = ChildCompletion::success(root, child);
    harness.lifecycle.on_child_complete(&mut harness.tree, late).unwrap();
    assert_eq!(harness.state(root), JobState::Cancelled);
    assert_eq!(harness.request.outcomes(), vec![false]);
}

#[test]
fn test_child_completion_from_stranger_is_rejected() {
    let Setup { mut harness, .. } = setup(false, false);
    harness.run();
    let root = harness.root();
    let child = harness.tree.children(root)[0];

    let bogus = ChildCompletion::success(child, root);
    let err = harness.lifecycle.on_child_complete(&mut harness.tree, bogus).unwrap_err();
    assert_eq!(err, JobError::NotAChild { parent: child, child: root });
}

#[test]
fn test_time_limit_reported_as_overdue() {
    let registry = BehaviorRegistry::new().with(Worker {
        releases: Arc::new(ReleaseLog::default()),
    });
    let mut harness = Harness::new(
        registry,
        JobSpec::new(WORKER).with_time_limit(Duration::from_millis(5_000)),
    );
    harness.run();
    let root = harness.root();
    let config = *harness.lifecycle.config();

    let now = harness.clock.advance(Duration::from_millis(4_000));
    assert!(harness.tree.overdue_jobs(now, &config).is_empty());
    assert!(!harness.tree.root().has_time_limit_expired_at(now));

    let now = harness.clock.advance(Duration::from_millis(2_000));
    assert!(harness.tree.root().has_time_limit_expired_at(now));
    let overdue = harness.tree.overdue_jobs(now, &config);
    assert_eq!(overdue.len(), 1);
    assert_eq!(overdue[0].kind, DeadlineKind::TimeLimit);

    let err = harness
        .lifecycle
        .on_timeout(&mut harness.tree, root, overdue[0].kind, overdue[0].deadline)
        .unwrap_err();
    assert!(matches!(err, JobError::Timeout { .. }));
    assert_eq!(harness.request.outcomes(), vec![false]);
}

#[test]
fn test_allocation_ceiling_fires_despite_soft_resets() {
    let mut harness = Harness::new(BehaviorRegistry::new().with(Hoarder), JobSpec::new(HOARDER));
    harness.run();
    let root = harness.root();
    let config = *harness.lifecycle.config();
    assert_eq!(harness.state(root), JobState::NeedsResources);

    let mut handled = Vec::new();
    for _ in 0..10 {
        let now = harness.clock.advance(Duration::from_secs(60));
        for overdue in harness.tree.overdue_jobs(now, &config) {
            handled.push(overdue.kind);
            let _ = harness
                .lifecycle
                .on_timeout(&mut harness.tree, overdue.job, overdue.kind, overdue.deadline);
        }
    }

    assert_eq!(
        handled,
        vec![DeadlineKind::Allocation, DeadlineKind::AllocationCeiling]
    );
    assert_eq!(harness.state(root), JobState::CompletedError);
    assert_eq!(harness.request.outcomes(), vec![false]);
}

#[test]
fn test_third_child_failure_fails_parent_after_two_successes() {
    let Setup {
        mut harness,
        seen_errors,
        ..
    } = setup(false, false);
    harness.run();
    let root = harness.root();
    let children = harness.tree.children(root).to_vec();

    harness.respond(children[0], serde_json::json!("A"));
    harness.respond(children[1], serde_json::json!("B"));
    assert_eq!(harness.state(root), JobState::WaitingForSubjob);
    assert_eq!(harness.tree.active_children(root), vec![children[2]]);
    assert!(harness.request.outcomes().is_empty());

    harness.respond(children[2], serde_json::json!("fail"));
    assert_eq!(harness.state(children[0]), JobState::CompletedSuccess);
    assert_eq!(harness.state(children[1]), JobState::CompletedSuccess);
    assert_eq!(harness.state(children[2]), JobState::CompletedError);
    assert_eq!(harness.state(root), JobState::CompletedError);
    assert_eq!(harness.request.outcomes(), vec![false]);
    assert!(seen_errors.lock().unwrap().is_empty());
    assert!(harness
        .errors
        .iter()
        .any(|e| matches!(e, JobError::ChildFailure { child, .. } if *child == children[2])));
}

fn stubborn_harness(batch: usize, extend: Duration) -> Harness {
    let registry = BehaviorRegistry::new().with(Stubborn { batch, extend }).with(Worker {
        releases: Arc::new(ReleaseLog::default()),
    });
    Harness::new(
        registry,
        JobSpec::new(STUBBORN).with_time_limit(Duration::from_millis(5_000)),
    )
}

/// Hand every overdue job to the lifecycle and return what was reported.
fn poll(harness: &mut Harness) -> Vec<DeadlineKind> {
    let now = harness.lifecycle.now();
    let config = *harness.lifecycle.config();
    let overdue = harness.tree.overdue_jobs(now, &config);
    for job in &overdue {
        if let Err(e) = harness
            .lifecycle
            .on_timeout(&mut harness.tree, job.job, job.kind, job.deadline)
        {
            harness.errors.push(e);
        }
    }
    harness.pump();
    overdue.into_iter().map(|o| o.kind).collect()
}

#[test]
fn test_time_limit_retry_fires_once() {
    let mut harness = stubborn_harness(1, Duration::ZERO);
    harness.run();
    let root = harness.root();

    harness.clock.advance(Duration::from_millis(6_000));
    assert_eq!(poll(&mut harness), vec![DeadlineKind::TimeLimit]);
    assert_eq!(harness.state(root), JobState::WaitingForSubjob);
    assert_eq!(harness.tree.len(), 2);

    assert!(poll(&mut harness).is_empty());
    harness.clock.advance(Duration::from_millis(1_000));
    assert!(poll(&mut harness).is_empty());
    assert_eq!(harness.tree.len(), 2);
    assert!(!harness.tree.root().has_time_limit_expired_at(harness.lifecycle.now()));
    assert!(harness.errors.is_empty());
}

#[test]
fn test_time_limit_extend_pushes_limit_out() {
    let mut harness = stubborn_harness(0, Duration::from_millis(2_000));
    harness.run();
    let root = harness.root();

    harness.clock.advance(Duration::from_millis(6_000));
    assert_eq!(poll(&mut harness), vec![DeadlineKind::TimeLimit]);
    assert_eq!(harness.tree.root().time_limit(), Duration::from_millis(8_000));

    assert!(poll(&mut harness).is_empty());
    harness.clock.advance(Duration::from_millis(1_000));
    assert!(poll(&mut harness).is_empty());

    harness.clock.advance(Duration::from_millis(2_000));
    assert_eq!(poll(&mut harness), vec![DeadlineKind::TimeLimit]);
    assert_eq!(harness.state(root), JobState::Runnable);
}

#[test]
fn test_empty_timeout_retry_fails_job() {
    let mut harness = stubborn_harness(0, Duration::ZERO);
    harness.run();
    let root = harness.root();

    harness.clock.advance(Duration::from_millis(6_000));
    assert_eq!(poll(&mut harness), vec![DeadlineKind::TimeLimit]);
    assert_eq!(harness.state(root), JobState::CompletedError);
    assert_eq!(harness.request.outcomes(), vec![false]);
    assert!(matches!(harness.errors.as_slice(), [JobError::Timeout { .. }]));
}
