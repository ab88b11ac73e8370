//! Orchestrator behaviour against an in-memory repository and a scripted runner.

use std::collections::VecDeque;
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cadence_core::SchedulerConfig;
use cadence_recurrence::{Frequency, RecurrenceRule};
use cadence_runner::{ExecutionRunner, RunCompletion, RunHandle};
use cadence_scheduler::{
    JobRequest, Orchestrator, PayloadSource, RunError, RunEvent, SchedulerError,
    TIMEOUT_EXIT_CODE,
};
use cadence_store::{
    InstanceStatus, Job, JobId, JobInstance, JobRepository, JobStatus, MemoryRepository,
    StoreError,
};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Scripted runner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum Step {
    Exit { code: i32, stdout: &'static str },
    /// Never completes on its own; reports `killed` once terminated.
    Hang,
}

fn ok(stdout: &'static str) -> Step {
    Step::Exit { code: 0, stdout }
}

fn fail(code: i32) -> Step {
    Step::Exit { code, stdout: "" }
}

struct ScriptedRunner {
    plan: Mutex<VecDeque<Step>>,
    fallback: Step,
    calls: AtomicUsize,
    payloads: Mutex<Vec<Value>>,
}

impl ScriptedRunner {
    fn new(plan: Vec<Step>, fallback: Step) -> Self {
        Self {
            plan: Mutex::new(plan.into()),
            fallback,
            calls: AtomicUsize::new(0),
            payloads: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionRunner for ScriptedRunner {
    async fn run(
        &self,
        _script: &Path,
        payload: &Value,
        _timeout: Duration,
    ) -> cadence_runner::Result<RunHandle> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.payloads.lock().unwrap().push(payload.clone());
        let step = self.plan.lock().unwrap().pop_front().unwrap_or(self.fallback);

        let (tx, rx) = oneshot::channel();
        let terminator = CancellationToken::new();
        let stdout = match step {
            Step::Exit { code, stdout } => {
                let _ = tx.send(RunCompletion::exited(code));
                stdout
            }
            Step::Hang => {
                let cancel = terminator.clone();
                tokio::spawn(async move {
                    cancel.cancelled().await;
                    let _ = tx.send(RunCompletion::killed());
                });
                ""
            }
        };

        Ok(RunHandle {
            stdout: Box::pin(Cursor::new(stdout.as_bytes().to_vec())),
            stderr: Box::pin(Cursor::new(Vec::new())),
            completion: rx,
            terminator,
        })
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    repo: Arc<MemoryRepository>,
    runner: Arc<ScriptedRunner>,
    orchestrator: Orchestrator,
    config: SchedulerConfig,
    scripts: tempfile::TempDir,
}

fn harness(plan: Vec<Step>, fallback: Step) -> Harness {
    harness_with(plan, fallback, |_| {})
}

fn harness_with(
    plan: Vec<Step>,
    fallback: Step,
    tweak: impl FnOnce(&mut SchedulerConfig),
) -> Harness {
    let scripts = tempfile::tempdir().unwrap();
    std::fs::write(scripts.path().join("job.sh"), "#!/bin/sh\n").unwrap();

    let mut config = SchedulerConfig {
        scripts_dir: Some(scripts.path().to_string_lossy().into_owned()),
        lookahead_secs: 30,
        drain_grace_ms: 200,
        ..SchedulerConfig::default()
    };
    tweak(&mut config);

    let repo = Arc::new(MemoryRepository::new());
    let runner = Arc::new(ScriptedRunner::new(plan, fallback));
    let orchestrator = Orchestrator::new(repo.clone(), runner.clone(), config.clone());
    Harness {
        repo,
        runner,
        orchestrator,
        config,
        scripts,
    }
}

/// Minute rule whose first occurrence is `offset` from now.
fn rule_at(offset: chrono::Duration) -> RecurrenceRule {
    RecurrenceRule::new(Frequency::Minute, Utc::now() + offset)
}

fn request(rule: RecurrenceRule) -> JobRequest {
    JobRequest::new("test job", rule, "job.sh")
}

async fn wait_for_job(repo: &MemoryRepository, id: &JobId, pred: impl Fn(&Job) -> bool) -> Job {
    for _ in 0..250 {
        if let Some(job) = repo.get_job(id).await.unwrap() {
            if pred(&job) {
                return job;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {id} never reached the expected state");
}

/// Wait up to two seconds for exactly `count` instances in `status`.
async fn wait_for_instances(
    repo: &MemoryRepository,
    id: &JobId,
    status: InstanceStatus,
    count: usize,
) -> Vec<JobInstance> {
    for _ in 0..100 {
        let found = repo.instances_with_status(id, status).await.unwrap();
        if found.len() == count {
            return found;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {id} never had {count} {status} instance(s)");
}

async fn next_event(rx: &mut broadcast::Receiver<RunEvent>) -> RunEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no event within 5s")
        .unwrap()
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

#[tokio::test]
async fn add_job_applies_defaults_and_resolves_script() {
    let h = harness(vec![], ok(""));
    let job = h
        .orchestrator
        .add_job(request(rule_at(chrono::Duration::hours(1))).with_id("nightly"))
        .await
        .unwrap();

    assert_eq!(job.id, JobId::from("nightly"));
    assert_eq!(job.status, JobStatus::Active);
    assert_eq!(job.timeout_ms, h.config.default_timeout_secs * 1000);
    assert_eq!(
        job.max_consecutive_failures,
        h.config.default_max_consecutive_failures
    );
    assert_eq!(job.script, h.scripts.path().join("job.sh"));
    assert!(h.orchestrator.job_exists(&job.id).await.unwrap());
    assert!(!h.orchestrator.job_exists(&JobId::from("other")).await.unwrap());
}

#[tokio::test]
async fn invalid_request_reports_every_error() {
    let h = harness(vec![], ok(""));
    let bad = JobRequest::new("", rule_at(chrono::Duration::zero()).with_interval(0), "job.sh");

    match h.orchestrator.add_job(bad).await {
        Err(SchedulerError::InvalidRequest { errors }) => assert_eq!(errors.len(), 2, "{errors:?}"),
        other => panic!("expected InvalidRequest, got {other:?}"),
    }
    assert!(h.repo.get_jobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn missing_script_is_rejected() {
    let h = harness(vec![], ok(""));
    let err = h
        .orchestrator
        .add_job(JobRequest::new("x", rule_at(chrono::Duration::zero()), "absent.sh"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "SCRIPT_NOT_FOUND");
}

#[tokio::test]
async fn duplicate_id_surfaces_repository_error() {
    let h = harness(vec![], ok(""));
    let rule = rule_at(chrono::Duration::hours(1));
    h.orchestrator
        .add_job(request(rule.clone()).with_id("dup"))
        .await
        .unwrap();
    let err = h
        .orchestrator
        .add_job(request(rule).with_id("dup"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::Repository(StoreError::DuplicateJob { .. })
    ));
}

#[tokio::test]
async fn start_and_stop_guard_their_state() {
    let h = harness(vec![], ok(""));
    assert!(!h.orchestrator.is_running());
    h.orchestrator.start().unwrap();
    assert!(matches!(
        h.orchestrator.start(),
        Err(SchedulerError::AlreadyRunning)
    ));
    assert!(h.orchestrator.is_running());

    h.orchestrator.stop().await.unwrap();
    assert!(matches!(
        h.orchestrator.stop().await,
        Err(SchedulerError::NotRunning)
    ));
}

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn repeated_ticks_schedule_each_occurrence_once() {
    let h = harness(vec![], ok(""));
    let job = h
        .orchestrator
        .add_job(request(rule_at(chrono::Duration::seconds(20))))
        .await
        .unwrap();

    let now = Utc::now();
    h.orchestrator.tick_at(now).await.unwrap();
    h.orchestrator.tick_at(now).await.unwrap();

    let scheduled = h
        .repo
        .instances_with_status(&job.id, InstanceStatus::Scheduled)
        .await
        .unwrap();
    assert_eq!(scheduled.len(), 1);
    assert_eq!(scheduled[0].occurrence_index, 0);
    assert_eq!(h.runner.calls(), 0);
}

#[tokio::test]
async fn rule_without_occurrences_finishes_on_first_tick() {
    let h = harness(vec![], ok(""));
    let anchor = Utc::now() + chrono::Duration::hours(1);
    let rule = RecurrenceRule::new(Frequency::Minute, anchor)
        .with_boundary(anchor - chrono::Duration::minutes(1));
    let job = h.orchestrator.add_job(request(rule)).await.unwrap();

    h.orchestrator.tick().await.unwrap();

    let job = h.repo.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Finished);
    assert_eq!(h.runner.calls(), 0);
}

#[tokio::test]
async fn successful_last_run_notifies_and_finishes_job() {
    let h = harness(vec![ok("hello\n")], ok(""));
    let mut events = h.orchestrator.subscribe();
    let job = h
        .orchestrator
        .add_job(request(rule_at(chrono::Duration::zero()).with_cap(1)))
        .await
        .unwrap();

    h.orchestrator.tick().await.unwrap();

    let started = next_event(&mut events).await;
    let RunEvent::Started { instance, stdout, .. } = started else {
        panic!("expected Started first, got {}", started.kind());
    };
    assert_eq!(instance.status, InstanceStatus::Running);
    assert_eq!(stdout.read_to_end().await, "hello\n");

    let finished = next_event(&mut events).await;
    let RunEvent::Finished { instance: done } = finished else {
        panic!("expected Finished, got {}", finished.kind());
    };
    assert_eq!(done.id, instance.id);
    assert_eq!(done.exit_code, Some(0));
    assert_eq!(done.stdout, "hello\n");
    assert!(done.ended_at >= done.started_at);

    let job = wait_for_job(&h.repo, &job.id, |j| j.status == JobStatus::Finished).await;
    assert_eq!(job.total_runs, 1);
    assert_eq!(job.successful_runs, 1);
    assert_eq!(job.last_completed, done.ended_at);

    let stored = h.repo.get_instance(&done.id).await.unwrap().unwrap();
    assert_eq!(stored.status, InstanceStatus::Succeeded);
}

// ---------------------------------------------------------------------------
// Retry / disable
// ---------------------------------------------------------------------------

#[tokio::test]
async fn consecutive_failures_disable_the_job() {
    let h = harness(vec![], fail(1));
    let job = h
        .orchestrator
        .add_job(request(rule_at(chrono::Duration::zero())).with_max_consecutive_failures(3))
        .await
        .unwrap();

    h.orchestrator.tick().await.unwrap();

    let job = wait_for_job(&h.repo, &job.id, |j| j.status == JobStatus::Disabled).await;
    assert_eq!(h.runner.calls(), 3);
    assert_eq!(job.total_runs, 3);
    assert_eq!(job.successful_runs, 0);

    // All three attempts re-ran the same instance.
    let errored = h
        .repo
        .instances_with_status(&job.id, InstanceStatus::Errored)
        .await
        .unwrap();
    assert_eq!(errored.len(), 1);
    assert_eq!(errored[0].exit_code, Some(1));
    assert_eq!(errored[0].error.as_deref(), Some("script exited with code 1"));
}

#[tokio::test]
async fn success_resets_the_failure_counter() {
    let h = harness(vec![fail(2), fail(2), ok("recovered")], ok(""));
    let job = h
        .orchestrator
        .add_job(request(rule_at(chrono::Duration::zero())).with_max_consecutive_failures(3))
        .await
        .unwrap();

    h.orchestrator.tick().await.unwrap();

    let job = wait_for_job(&h.repo, &job.id, |j| j.successful_runs == 1).await;
    assert_eq!(job.status, JobStatus::Active);
    assert_eq!(job.consecutive_failures, 0);
    assert_eq!(job.total_runs, 3);
    assert_eq!(h.runner.calls(), 3);
}

#[tokio::test]
async fn zero_threshold_never_disables_or_retries() {
    let h = harness(vec![], fail(1));
    let job = h
        .orchestrator
        .add_job(request(rule_at(chrono::Duration::zero())).with_max_consecutive_failures(0))
        .await
        .unwrap();

    h.orchestrator.tick().await.unwrap();

    let job = wait_for_job(&h.repo, &job.id, |j| j.total_runs == 1).await;
    assert_eq!(job.status, JobStatus::Active);
    assert_eq!(job.consecutive_failures, 1);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.runner.calls(), 1);
}

#[tokio::test]
async fn deadline_kills_the_run_and_records_timeout() {
    let h = harness(vec![], Step::Hang);
    let mut events = h.orchestrator.subscribe();
    let job = h
        .orchestrator
        .add_job(
            request(rule_at(chrono::Duration::zero()))
                .with_timeout(Duration::from_millis(100))
                .with_max_consecutive_failures(1),
        )
        .await
        .unwrap();

    h.orchestrator.tick().await.unwrap();

    assert!(matches!(next_event(&mut events).await, RunEvent::Started { .. }));
    let RunEvent::TimedOut { instance } = next_event(&mut events).await else {
        panic!("expected TimedOut");
    };
    assert_eq!(instance.status, InstanceStatus::TimedOut);
    assert_eq!(instance.exit_code, Some(TIMEOUT_EXIT_CODE));
    assert_eq!(instance.error.as_deref(), Some("run timed out after 100 ms"));

    wait_for_job(&h.repo, &job.id, |j| j.status == JobStatus::Disabled).await;
    assert_eq!(h.runner.calls(), 1);
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn timer_for_inactive_job_cancels_its_instance() {
    let h = harness_with(vec![], ok(""), |c| c.cancel_on_disable = false);
    let job = h
        .orchestrator
        .add_job(request(rule_at(chrono::Duration::milliseconds(300))))
        .await
        .unwrap();

    h.orchestrator.tick().await.unwrap();

    let mut disabled = h.repo.get_job(&job.id).await.unwrap().unwrap();
    disabled.status = JobStatus::Disabled;
    h.repo.save_job(&disabled).await.unwrap();

    wait_for_instances(&h.repo, &job.id, InstanceStatus::Canceled, 1).await;
    assert_eq!(h.runner.calls(), 0);
}

#[tokio::test]
async fn disabling_cancels_pending_timers_at_once() {
    let h = harness(vec![], fail(1));
    // Occurrences at now-55s and now+5s: the first fires at once, the
    // second waits on its timer.
    let job = h
        .orchestrator
        .add_job(
            request(rule_at(chrono::Duration::seconds(-55))).with_max_consecutive_failures(1),
        )
        .await
        .unwrap();

    h.orchestrator.tick().await.unwrap();

    wait_for_job(&h.repo, &job.id, |j| j.status == JobStatus::Disabled).await;
    // Well before the second timer would have fired on its own.
    let canceled = wait_for_instances(&h.repo, &job.id, InstanceStatus::Canceled, 1).await;
    assert_eq!(canceled[0].occurrence_index, 1);
    assert_eq!(h.runner.calls(), 1);
}

#[tokio::test]
async fn removing_a_job_drops_it_and_its_instances() {
    let h = harness(vec![], ok(""));
    let job = h
        .orchestrator
        .add_job(request(rule_at(chrono::Duration::milliseconds(300))))
        .await
        .unwrap();
    h.orchestrator.tick().await.unwrap();

    h.orchestrator.remove_job(&job.id).await.unwrap();
    assert!(!h.orchestrator.job_exists(&job.id).await.unwrap());

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(h.runner.calls(), 0);
    assert!(matches!(
        h.orchestrator.remove_job(&job.id).await,
        Err(SchedulerError::JobNotFound { .. })
    ));
}

#[tokio::test]
async fn restart_re_arms_orphaned_instances() {
    let h = harness(vec![], ok("done"));
    let job = h
        .orchestrator
        .add_job(request(rule_at(chrono::Duration::milliseconds(800)).with_cap(1)))
        .await
        .unwrap();

    h.orchestrator.tick().await.unwrap();
    h.orchestrator.start().unwrap();
    h.orchestrator.stop().await.unwrap();

    let orphans = h
        .repo
        .instances_with_status(&job.id, InstanceStatus::Scheduled)
        .await
        .unwrap();
    assert_eq!(orphans.len(), 1);

    // A fresh orchestrator over the same repository picks the instance up.
    let second = Orchestrator::new(h.repo.clone(), h.runner.clone(), h.config.clone());
    second.tick().await.unwrap();

    let job = wait_for_job(&h.repo, &job.id, |j| j.status == JobStatus::Finished).await;
    assert_eq!(job.successful_runs, 1);
    assert_eq!(h.runner.calls(), 1);
    let succeeded = h
        .repo
        .instances_with_status(&job.id, InstanceStatus::Succeeded)
        .await
        .unwrap();
    assert_eq!(succeeded.len(), 1);
    assert_eq!(succeeded[0].id, orphans[0].id);
}

#[tokio::test]
async fn restart_does_not_rerun_an_occurrence_still_in_flight() {
    let h = harness(vec![], Step::Hang);
    let job = h
        .orchestrator
        .add_job(
            request(rule_at(chrono::Duration::zero()).with_cap(2))
                .with_timeout(Duration::from_secs(30)),
        )
        .await
        .unwrap();

    h.orchestrator.tick().await.unwrap();
    let running = wait_for_instances(&h.repo, &job.id, InstanceStatus::Running, 1).await;
    assert_eq!(running[0].occurrence_index, 0);

    // Dropping the cached calculator makes the next tick resume from the
    // job record, which has not moved past the in-flight occurrence.
    h.orchestrator.start().unwrap();
    h.orchestrator.stop().await.unwrap();
    h.orchestrator.tick().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.runner.calls(), 1);
    let scheduled = h
        .repo
        .instances_with_status(&job.id, InstanceStatus::Scheduled)
        .await
        .unwrap();
    assert!(scheduled.is_empty(), "{scheduled:?}");
    let running = h
        .repo
        .instances_with_status(&job.id, InstanceStatus::Running)
        .await
        .unwrap();
    assert_eq!(running.len(), 1);
}

async fn wait_until_untracked(orchestrator: &Orchestrator) {
    for _ in 0..100 {
        if orchestrator.tracked_jobs() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("orchestrator still tracks {} job(s)", orchestrator.tracked_jobs());
}

#[tokio::test]
async fn finished_and_disabled_jobs_release_their_state() {
    let h = harness(vec![ok("")], fail(1));
    let finished = h
        .orchestrator
        .add_job(request(rule_at(chrono::Duration::zero()).with_cap(1)))
        .await
        .unwrap();
    h.orchestrator.tick().await.unwrap();
    wait_for_job(&h.repo, &finished.id, |j| j.status == JobStatus::Finished).await;
    wait_until_untracked(&h.orchestrator).await;

    let disabled = h
        .orchestrator
        .add_job(request(rule_at(chrono::Duration::zero())).with_max_consecutive_failures(1))
        .await
        .unwrap();
    h.orchestrator.tick().await.unwrap();
    wait_for_job(&h.repo, &disabled.id, |j| j.status == JobStatus::Disabled).await;
    wait_until_untracked(&h.orchestrator).await;

    // Terminal jobs are skipped by later ticks and stay untracked.
    h.orchestrator.tick().await.unwrap();
    assert_eq!(h.orchestrator.tracked_jobs(), 0);
    assert_eq!(h.runner.calls(), 2);
}

#[tokio::test]
async fn run_ending_after_removal_leaves_no_state_behind() {
    let h = harness(vec![], Step::Hang);
    let job = h
        .orchestrator
        .add_job(
            request(rule_at(chrono::Duration::zero())).with_timeout(Duration::from_millis(150)),
        )
        .await
        .unwrap();

    h.orchestrator.tick().await.unwrap();
    wait_for_instances(&h.repo, &job.id, InstanceStatus::Running, 1).await;

    h.orchestrator.remove_job(&job.id).await.unwrap();
    assert_eq!(h.orchestrator.tracked_jobs(), 0);

    // Let the deadline kill the run and its bookkeeping finish.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(h.orchestrator.tracked_jobs(), 0);
    assert!(!h.orchestrator.job_exists(&job.id).await.unwrap());
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[tokio::test]
async fn payload_factory_runs_fresh_for_every_attempt() {
    let h = harness(vec![fail(1), ok("")], ok(""));
    let attempts = Arc::new(AtomicU64::new(0));
    let counter = attempts.clone();
    let job = h
        .orchestrator
        .add_job(
            request(rule_at(chrono::Duration::zero()))
                .with_max_consecutive_failures(3)
                .with_payload(PayloadSource::from_fn(move || {
                    Ok(json!({ "attempt": counter.fetch_add(1, Ordering::SeqCst) }))
                })),
        )
        .await
        .unwrap();

    h.orchestrator.tick().await.unwrap();
    wait_for_job(&h.repo, &job.id, |j| j.successful_runs == 1).await;

    let payloads = h.runner.payloads.lock().unwrap().clone();
    assert_eq!(payloads, vec![json!({"attempt": 0}), json!({"attempt": 1})]);
}

#[tokio::test]
async fn static_payload_reaches_the_runner() {
    let h = harness(vec![], ok(""));
    let job = h
        .orchestrator
        .add_job(
            request(rule_at(chrono::Duration::zero()).with_cap(1))
                .with_payload(json!({"region": "eu"})),
        )
        .await
        .unwrap();
    assert_eq!(job.payload, json!({"region": "eu"}));

    h.orchestrator.tick().await.unwrap();
    wait_for_job(&h.repo, &job.id, |j| j.status == JobStatus::Finished).await;
    assert_eq!(
        h.runner.payloads.lock().unwrap().as_slice(),
        &[json!({"region": "eu"})]
    );
}

#[tokio::test]
async fn failing_payload_factory_fails_the_run_without_launching() {
    let h = harness(vec![], ok(""));
    let mut events = h.orchestrator.subscribe();
    let job = h
        .orchestrator
        .add_job(
            request(rule_at(chrono::Duration::zero()))
                .with_max_consecutive_failures(1)
                .with_payload(PayloadSource::from_fn(|| Err("vault sealed".into()))),
        )
        .await
        .unwrap();

    h.orchestrator.tick().await.unwrap();

    let RunEvent::Failed { error, .. } = next_event(&mut events).await else {
        panic!("expected Failed");
    };
    assert_eq!(error, RunError::Payload("vault sealed".into()));
    wait_for_job(&h.repo, &job.id, |j| j.status == JobStatus::Disabled).await;
    assert_eq!(h.runner.calls(), 0);
}
