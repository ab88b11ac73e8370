//! The job orchestrator: poll loop, per-occurrence timers, run execution and
//! the retry / disable / finish state machine.
//!
//! # Flow
//!
//! ```text
//! poll tick ──► calculator.peek(lookahead) ──► add scheduled instance ──► arm timer
//!                                                                            │
//!            ┌───────────────────────────────────────────────────────────────┘
//!            ▼
//!        timer fire ──► job still active? ──no──► instance canceled
//!                              │yes
//!                              ▼
//!            run ──► tee output ──► Started ──► completion | timeout
//!                                                   │
//!            Finished / Failed / TimedOut ◄─────────┘
//!                              │
//!                              ▼
//!        bookkeeping ──► failure below threshold? ──yes──► run again
//! ```
//!
//! Each job owns one `JobSlot` behind an async mutex. The slot holds the
//! job's calculator and its in-process timers, and every read-modify-write of
//! the job record happens while holding it.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use cadence_core::SchedulerConfig;
use cadence_recurrence::RecurrenceCalculator;
use cadence_runner::{tee, ExecutionRunner, RunCompletion, RunHandle};
use cadence_store::{
    InstanceId, InstanceStatus, Job, JobId, JobInstance, JobRepository, JobStatus, NewInstance,
    NewJob, StoreError,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{broadcast, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    error::{Result, RunError, SchedulerError},
    events::{RunEvent, EVENT_CHANNEL_CAPACITY},
    payload::PayloadSource,
    validate::{JobRequest, RequestValidator, StructuralValidator, MAX_TIMEOUT},
};

/// Exit code recorded on an instance killed at its deadline.
pub const TIMEOUT_EXIT_CODE: i32 = -1;

/// Per-job state owned by the orchestrator.
#[derive(Default)]
struct JobSlot {
    /// Built lazily from the job record; dropped when the job stops being active.
    calculator: Option<RecurrenceCalculator>,
    /// Scheduled instances whose timer has not fired yet.
    timers: HashMap<InstanceId, AbortHandle>,
    /// Instances between timer fire and the end of their last retry.
    running: HashSet<InstanceId>,
    /// The job left `Active`; the slot is dropped once it is idle.
    retired: bool,
}

impl JobSlot {
    fn calculator_for(&mut self, job: &Job) -> Result<&mut RecurrenceCalculator> {
        let calculator = match self.calculator.take() {
            Some(calculator) => calculator,
            None => {
                debug!(
                    job_id = %job.id,
                    successful_runs = job.successful_runs,
                    last_completed = ?job.last_completed,
                    "calculator rebuilt"
                );
                RecurrenceCalculator::resume(
                    job.rule.clone(),
                    job.successful_runs,
                    job.last_completed,
                )?
            }
        };
        Ok(self.calculator.insert(calculator))
    }

    /// No timer armed and nothing running, ignoring `except`.
    fn is_idle_except(&self, except: Option<&InstanceId>) -> bool {
        self.timers.is_empty() && self.running.iter().all(|id| Some(id) == except)
    }
}

struct PollLoop {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Inner {
    repo: Arc<dyn JobRepository>,
    runner: Arc<dyn ExecutionRunner>,
    validator: Arc<dyn RequestValidator>,
    config: SchedulerConfig,
    poll_interval: Duration,
    lookahead: chrono::Duration,
    events: broadcast::Sender<RunEvent>,
    slots: DashMap<JobId, Arc<tokio::sync::Mutex<JobSlot>>>,
    payloads: DashMap<JobId, PayloadSource>,
    poll_loop: Mutex<Option<PollLoop>>,
}

/// Schedules and runs recurring jobs. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        repo: Arc<dyn JobRepository>,
        runner: Arc<dyn ExecutionRunner>,
        config: SchedulerConfig,
    ) -> Self {
        Self::with_validator(repo, runner, config, Arc::new(StructuralValidator))
    }

    pub fn with_validator(
        repo: Arc<dyn JobRepository>,
        runner: Arc<dyn ExecutionRunner>,
        config: SchedulerConfig,
        validator: Arc<dyn RequestValidator>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let lookahead = chrono::Duration::from_std(Duration::from_secs(config.lookahead_secs))
            .unwrap_or(chrono::Duration::MAX);
        Self {
            inner: Arc::new(Inner {
                repo,
                runner,
                validator,
                poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
                lookahead,
                config,
                events,
                slots: DashMap::new(),
                payloads: DashMap::new(),
                poll_loop: Mutex::new(None),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start the poll loop. Fails with `AlreadyRunning` if it is running.
    pub fn start(&self) -> Result<()> {
        let mut state = self.poll_loop();
        if state.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }

        let (shutdown, rx) = watch::channel(false);
        let this = self.clone();
        let handle = tokio::spawn(async move { this.run_loop(rx).await });
        *state = Some(PollLoop { shutdown, handle });

        info!(
            poll_interval_secs = self.inner.poll_interval.as_secs(),
            lookahead_secs = self.inner.config.lookahead_secs,
            "orchestrator started"
        );
        Ok(())
    }

    /// Stop the poll loop and abort every pending timer.
    ///
    /// Runs already in progress finish normally. Scheduled instances stay in
    /// the repository and are re-armed by the next start.
    pub async fn stop(&self) -> Result<()> {
        let Some(PollLoop { shutdown, handle }) = self.poll_loop().take() else {
            return Err(SchedulerError::NotRunning);
        };

        let _ = shutdown.send(true);
        if let Err(e) = handle.await {
            warn!(error = %e, "poll loop ended abnormally");
        }

        let slots: Vec<_> = self
            .inner
            .slots
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut aborted = 0;
        for slot in slots {
            let mut slot = slot.lock().await;
            for (_, timer) in slot.timers.drain() {
                timer.abort();
                aborted += 1;
            }
            slot.calculator = None;
        }

        info!(aborted_timers = aborted, "orchestrator stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.poll_loop().is_some()
    }

    /// Receive run notifications from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.inner.events.subscribe()
    }

    fn poll_loop(&self) -> MutexGuard<'_, Option<PollLoop>> {
        self.inner
            .poll_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_loop(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.inner.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "poll tick failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("poll loop exited");
    }

    // -----------------------------------------------------------------------
    // Job management
    // -----------------------------------------------------------------------

    /// Validate and persist a new job.
    ///
    /// Timeout and failure threshold fall back to the configured defaults. The
    /// payload source stays registered in this process for the job's runs.
    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn add_job(&self, request: JobRequest) -> Result<Job> {
        let report = self.inner.validator.validate(&request);
        if !report.valid {
            return Err(SchedulerError::InvalidRequest {
                errors: report.errors,
            });
        }

        let script = self.resolve_script(&request.script);
        match tokio::fs::metadata(&script).await {
            Ok(meta) if meta.is_file() => {}
            _ => return Err(SchedulerError::ScriptNotFound { path: script }),
        }

        let config = &self.inner.config;
        let timeout = request
            .timeout
            .unwrap_or(Duration::from_secs(config.default_timeout_secs))
            .min(MAX_TIMEOUT);
        let job = self
            .inner
            .repo
            .create_job(NewJob {
                id: request.id,
                name: request.name,
                rule: request.rule,
                script,
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                max_consecutive_failures: request
                    .max_consecutive_failures
                    .unwrap_or(config.default_max_consecutive_failures),
                payload: request.payload.stored_value(),
            })
            .await?;

        self.inner.payloads.insert(job.id.clone(), request.payload);
        info!(job_id = %job.id, script = %job.script.display(), "job added");
        Ok(job)
    }

    /// Delete a job and its instances, aborting its pending timers.
    #[instrument(skip(self), fields(job_id = %id))]
    pub async fn remove_job(&self, id: &JobId) -> Result<()> {
        if self.inner.repo.get_job(id).await?.is_none() {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }

        let slot = self.slot(id);
        {
            let mut slot = slot.lock().await;
            if self.inner.config.cancel_on_disable {
                self.cancel_pending(id, &mut slot, false).await?;
            }
            slot.calculator = None;
            self.inner.repo.remove_job(id).await.map_err(|e| match e {
                StoreError::JobNotFound { id } => SchedulerError::JobNotFound { id },
                other => SchedulerError::Repository(other),
            })?;
        }

        self.inner.slots.remove(id);
        self.inner.payloads.remove(id);
        info!("job removed");
        Ok(())
    }

    pub async fn job_exists(&self, id: &JobId) -> Result<bool> {
        Ok(self.inner.repo.get_job(id).await?.is_some())
    }

    fn resolve_script(&self, script: &str) -> PathBuf {
        let path = Path::new(script);
        match &self.inner.config.scripts_dir {
            Some(dir) if path.is_relative() => Path::new(dir).join(path),
            _ => path.to_path_buf(),
        }
    }

    /// Slot for a job that is being scheduled, created on first use.
    fn slot(&self, id: &JobId) -> Arc<tokio::sync::Mutex<JobSlot>> {
        Arc::clone(self.inner.slots.entry(id.clone()).or_default().value())
    }

    /// Slot for a job that may have been removed meanwhile.
    fn existing_slot(&self, id: &JobId) -> Option<Arc<tokio::sync::Mutex<JobSlot>>> {
        self.inner
            .slots
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Drop `slot` from the map if it is still the one registered for `id`.
    fn release_slot(&self, id: &JobId, slot: &Arc<tokio::sync::Mutex<JobSlot>>) {
        if self
            .inner
            .slots
            .remove_if(id, |_, current| Arc::ptr_eq(current, slot))
            .is_some()
        {
            debug!(job_id = %id, "job slot released");
        }
    }

    /// Number of jobs holding in-process scheduling state.
    pub fn tracked_jobs(&self) -> usize {
        self.inner.slots.len()
    }

    // -----------------------------------------------------------------------
    // Poll tick
    // -----------------------------------------------------------------------

    /// Run one poll tick against the current time.
    pub async fn tick(&self) -> Result<()> {
        self.tick_at(Utc::now()).await
    }

    /// Materialise every occurrence due within the look-ahead span of `now`.
    ///
    /// Only listing the jobs can fail the tick; a failure scheduling one job
    /// is logged and the others are still scheduled.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<()> {
        let jobs = self.inner.repo.get_jobs().await?;
        for job in jobs.into_iter().filter(Job::is_active) {
            if let Err(e) = self.schedule_job(&job.id, now).await {
                error!(job_id = %job.id, error = %e, "failed to schedule job");
            }
        }
        Ok(())
    }

    async fn schedule_job(&self, job_id: &JobId, now: DateTime<Utc>) -> Result<()> {
        let handle = self.slot(job_id);
        let mut slot = handle.lock().await;

        // Re-read under the slot lock; the listing may predate a concurrent run.
        let Some(mut job) = self.inner.repo.get_job(job_id).await? else {
            return Ok(());
        };
        if !job.is_active() {
            slot.calculator = None;
            slot.retired = true;
            if slot.is_idle_except(None) {
                self.release_slot(job_id, &handle);
            }
            return Ok(());
        }

        let (due, exhausted) = {
            let calculator = slot.calculator_for(&job)?;
            let mut due = Vec::new();
            while calculator.peek_at(now, Some(self.inner.lookahead)) {
                due.push(calculator.advance()?);
            }
            (due, !calculator.peek_at(now, None))
        };

        if !due.is_empty() {
            let mut scheduled: HashMap<u64, JobInstance> = self
                .inner
                .repo
                .instances_with_status(job_id, InstanceStatus::Scheduled)
                .await?
                .into_iter()
                .map(|instance| (instance.occurrence_index, instance))
                .collect();
            // A run in flight has not moved the resume point yet, so a rebuilt
            // calculator emits its occurrence again.
            let running: HashSet<u64> = self
                .inner
                .repo
                .instances_with_status(job_id, InstanceStatus::Running)
                .await?
                .into_iter()
                .map(|instance| instance.occurrence_index)
                .collect();

            for occurrence in due {
                if running.contains(&occurrence.index) {
                    debug!(job_id = %job_id, index = occurrence.index, "occurrence already running");
                    continue;
                }
                if let Some(existing) = scheduled.remove(&occurrence.index) {
                    if slot.timers.contains_key(&existing.id) {
                        debug!(job_id = %job_id, index = occurrence.index, "instance already scheduled");
                    } else {
                        warn!(
                            job_id = %job_id,
                            instance_id = %existing.id,
                            index = occurrence.index,
                            "re-arming orphaned scheduled instance"
                        );
                        self.arm(&mut slot, existing, now);
                    }
                    continue;
                }

                let instance = self
                    .inner
                    .repo
                    .add_instance(
                        job_id,
                        NewInstance {
                            scheduled_at: occurrence.timestamp,
                            occurrence_index: occurrence.index,
                            timeout_ms: job.timeout_ms,
                        },
                    )
                    .await?;
                self.arm(&mut slot, instance, now);
            }
        }

        if exhausted && slot.is_idle_except(None) {
            job.status = JobStatus::Finished;
            self.inner.repo.save_job(&job).await?;
            slot.calculator = None;
            slot.retired = true;
            self.release_slot(job_id, &handle);
            info!(job_id = %job_id, total_runs = job.total_runs, "job finished");
        }
        Ok(())
    }

    fn arm(&self, slot: &mut JobSlot, instance: JobInstance, now: DateTime<Utc>) {
        let delay = (instance.scheduled_at - now).to_std().unwrap_or(Duration::ZERO);
        let this = self.clone();
        let job_id = instance.job_id.clone();
        let instance_id = instance.id.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = this.fire(&job_id, &instance_id).await {
                error!(job_id = %job_id, instance_id = %instance_id, error = %e, "run failed");
            }
        });

        debug!(
            job_id = %instance.job_id,
            instance_id = %instance.id,
            index = instance.occurrence_index,
            delay_ms = delay.as_millis() as u64,
            "timer armed"
        );
        slot.timers.insert(instance.id, handle.abort_handle());
    }

    /// Abort every pending timer of a job. With `persist`, the affected
    /// instances are recorded as canceled.
    async fn cancel_pending(&self, job_id: &JobId, slot: &mut JobSlot, persist: bool) -> Result<()> {
        let timers: Vec<_> = slot.timers.drain().collect();
        if timers.is_empty() {
            return Ok(());
        }

        for (instance_id, timer) in &timers {
            timer.abort();
            if !persist {
                continue;
            }
            if let Some(mut instance) = self.inner.repo.get_instance(instance_id).await? {
                if instance.status == InstanceStatus::Scheduled {
                    instance.status = InstanceStatus::Canceled;
                    instance.ended_at = Some(Utc::now());
                    self.inner.repo.save_instance(&instance).await?;
                }
            }
        }
        info!(job_id = %job_id, canceled = timers.len(), "pending timers canceled");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Timer fire and execution
    // -----------------------------------------------------------------------

    async fn fire(&self, job_id: &JobId, instance_id: &InstanceId) -> Result<()> {
        let Some(handle) = self.existing_slot(job_id) else {
            debug!(job_id = %job_id, instance_id = %instance_id, "job slot gone before fire");
            return Ok(());
        };
        {
            let mut slot = handle.lock().await;
            if slot.timers.remove(instance_id).is_none() {
                debug!(job_id = %job_id, instance_id = %instance_id, "timer no longer tracked");
                return Ok(());
            }
            slot.running.insert(instance_id.clone());
        }

        let result = self.launch(job_id, instance_id).await;

        let mut slot = handle.lock().await;
        slot.running.remove(instance_id);
        if slot.retired && slot.is_idle_except(None) {
            self.release_slot(job_id, &handle);
        }
        result
    }

    async fn retire(&self, job_id: &JobId) {
        if let Some(slot) = self.existing_slot(job_id) {
            let mut slot = slot.lock().await;
            slot.calculator = None;
            slot.retired = true;
        }
    }

    async fn launch(&self, job_id: &JobId, instance_id: &InstanceId) -> Result<()> {
        let Some(mut instance) = self.inner.repo.get_instance(instance_id).await? else {
            debug!(job_id = %job_id, instance_id = %instance_id, "instance vanished before fire");
            return Ok(());
        };

        let job = match self.inner.repo.get_job(job_id).await? {
            Some(job) if job.is_active() => job,
            Some(job) => {
                warn!(
                    job_id = %job_id,
                    instance_id = %instance_id,
                    status = %job.status,
                    "job no longer active, canceling instance"
                );
                instance.status = InstanceStatus::Canceled;
                instance.ended_at = Some(Utc::now());
                self.inner.repo.save_instance(&instance).await?;
                self.retire(job_id).await;
                return Ok(());
            }
            None => {
                warn!(job_id = %job_id, instance_id = %instance_id, "job removed, dropping instance");
                return Ok(());
            }
        };

        self.run_instance(job, instance).await
    }

    /// Execute `instance`, then keep re-running it while bookkeeping asks for
    /// an immediate retry.
    async fn run_instance(&self, mut job: Job, mut instance: JobInstance) -> Result<()> {
        loop {
            let (status, failure) = match self.execute(&job, &mut instance).await {
                Ok(status) => (status, None),
                Err(e) => (InstanceStatus::Errored, Some(e)),
            };

            let retry = self.record_outcome(&job.id, &instance, status).await;
            if let Some(e) = failure {
                return Err(e);
            }

            match retry? {
                Some(updated) => {
                    debug!(
                        job_id = %updated.id,
                        instance_id = %instance.id,
                        consecutive_failures = updated.consecutive_failures,
                        "retrying immediately"
                    );
                    job = updated;
                    tokio::task::yield_now().await;
                }
                None => return Ok(()),
            }
        }
    }

    /// One attempt: launch, stream, await completion or deadline, persist.
    async fn execute(&self, job: &Job, instance: &mut JobInstance) -> Result<InstanceStatus> {
        instance.status = InstanceStatus::Running;
        instance.started_at = Some(Utc::now());
        instance.ended_at = None;
        instance.exit_code = None;
        instance.error = None;
        instance.stdout.clear();
        instance.stderr.clear();
        *instance = self.inner.repo.save_instance(instance).await?;

        info!(
            job_id = %job.id,
            instance_id = %instance.id,
            index = instance.occurrence_index,
            "instance started"
        );

        let payload = match self.resolve_payload(job).await {
            Ok(payload) => payload,
            Err(e) => return self.conclude(instance, InstanceStatus::Errored, Some(e)).await,
        };

        let timeout = instance.timeout();
        let handle = match self.inner.runner.run(&job.script, &payload, timeout).await {
            Ok(handle) => handle,
            Err(e) => {
                let error = RunError::Launch(e.to_string());
                return self.conclude(instance, InstanceStatus::Errored, Some(error)).await;
            }
        };

        let RunHandle {
            stdout,
            stderr,
            mut completion,
            terminator,
        } = handle;
        let capacity = self.inner.config.output_buffer_bytes;
        let (live_stdout, capture_stdout) = tee(stdout, capacity);
        let (live_stderr, capture_stderr) = tee(stderr, capacity);

        self.emit(RunEvent::Started {
            instance: instance.clone(),
            stdout: live_stdout,
            stderr: live_stderr,
        });

        let grace = Duration::from_millis(self.inner.config.drain_grace_ms);
        let completion = tokio::select! {
            result = &mut completion => result.ok(),
            _ = tokio::time::sleep(timeout) => {
                terminator.cancel();
                if tokio::time::timeout(grace, &mut completion).await.is_err() {
                    warn!(instance_id = %instance.id, "runner did not confirm termination");
                }
                Some(RunCompletion::timed_out())
            }
        };

        instance.stdout = capture_stdout.collect(grace).await.text;
        instance.stderr = capture_stderr.collect(grace).await.text;

        let (status, error) = classify(completion, instance);
        self.conclude(instance, status, error).await
    }

    /// Stamp the end of a run, persist it and notify subscribers.
    async fn conclude(
        &self,
        instance: &mut JobInstance,
        status: InstanceStatus,
        error: Option<RunError>,
    ) -> Result<InstanceStatus> {
        instance.status = status;
        instance.ended_at = Some(Utc::now());
        instance.error = error.as_ref().map(ToString::to_string);
        *instance = self.inner.repo.save_instance(instance).await?;

        let elapsed_ms = instance.duration().map(|d| d.num_milliseconds());
        match status {
            InstanceStatus::Succeeded => {
                info!(instance_id = %instance.id, ?elapsed_ms, outcome = %status, "instance ended");
            }
            _ => {
                warn!(
                    instance_id = %instance.id,
                    ?elapsed_ms,
                    outcome = %status,
                    exit_code = ?instance.exit_code,
                    error = ?instance.error,
                    "instance ended"
                );
            }
        }

        let instance = instance.clone();
        self.emit(match (status, error) {
            (InstanceStatus::Succeeded, _) => RunEvent::Finished { instance },
            (InstanceStatus::TimedOut, _) => RunEvent::TimedOut { instance },
            (_, error) => RunEvent::Failed {
                error: error.unwrap_or_else(|| RunError::Execution {
                    exit_code: instance.exit_code,
                    message: format!("run ended as {status}"),
                }),
                instance,
            },
        });
        Ok(status)
    }

    async fn resolve_payload(&self, job: &Job) -> std::result::Result<serde_json::Value, RunError> {
        let source = self
            .inner
            .payloads
            .get(&job.id)
            .map(|entry| entry.value().clone());
        match source {
            Some(source) => source.resolve().await,
            None => Ok(job.payload.clone()),
        }
    }

    fn emit(&self, event: RunEvent) {
        if self.inner.events.send(event).is_err() {
            debug!("no run event subscribers");
        }
    }

    // -----------------------------------------------------------------------
    // Bookkeeping
    // -----------------------------------------------------------------------

    /// Update the job's counters and status after one attempt.
    ///
    /// Returns the saved job when the same instance should run again at once.
    /// A failure threshold of 0 counts failures but never disables the job and
    /// never retries; the job waits for its next occurrence instead.
    async fn record_outcome(
        &self,
        job_id: &JobId,
        instance: &JobInstance,
        status: InstanceStatus,
    ) -> Result<Option<Job>> {
        let Some(slot) = self.existing_slot(job_id) else {
            debug!(job_id = %job_id, "job removed while running");
            return Ok(None);
        };
        let mut slot = slot.lock().await;

        let Some(mut job) = self.inner.repo.get_job(job_id).await? else {
            debug!(job_id = %job_id, "job removed while running");
            return Ok(None);
        };
        let was_active = job.is_active();
        let mut retry = false;

        job.total_runs += 1;
        if status == InstanceStatus::Succeeded {
            job.successful_runs += 1;
            job.consecutive_failures = 0;
            job.last_completed = instance.ended_at;

            if was_active {
                let exhausted = !slot.calculator_for(&job)?.peek_at(Utc::now(), None);
                if exhausted && slot.is_idle_except(Some(&instance.id)) {
                    job.status = JobStatus::Finished;
                    info!(job_id = %job_id, total_runs = job.total_runs, "job finished");
                }
            }
        } else if was_active {
            let max = job.max_consecutive_failures;
            if max > 0 && job.consecutive_failures + 1 >= max {
                job.status = JobStatus::Disabled;
                warn!(
                    job_id = %job_id,
                    consecutive_failures = job.consecutive_failures + 1,
                    "job disabled after repeated failures"
                );
            } else {
                job.consecutive_failures += 1;
                retry = max > 0;
            }
        }

        let job = self.inner.repo.save_job(&job).await?;

        if was_active && job.status.is_terminal() {
            slot.calculator = None;
            slot.retired = true;
            if job.status == JobStatus::Disabled && self.inner.config.cancel_on_disable {
                self.cancel_pending(job_id, &mut slot, true).await?;
            }
        }

        Ok(retry.then_some(job))
    }
}

/// Map the runner's completion (or its absence) onto an instance outcome,
/// filling in the exit code.
fn classify(
    completion: Option<RunCompletion>,
    instance: &mut JobInstance,
) -> (InstanceStatus, Option<RunError>) {
    use cadence_runner::CompletionStatus;

    let Some(completion) = completion else {
        return (
            InstanceStatus::Errored,
            Some(RunError::Execution {
                exit_code: None,
                message: "runner ended without reporting completion".to_string(),
            }),
        );
    };

    if completion.status == CompletionStatus::TimedOut {
        instance.exit_code = Some(TIMEOUT_EXIT_CODE);
        return (
            InstanceStatus::TimedOut,
            Some(RunError::Timeout {
                after_ms: instance.timeout_ms,
            }),
        );
    }

    instance.exit_code = completion.exit_code;
    if completion.is_success() {
        return (InstanceStatus::Succeeded, None);
    }

    let message = completion.error.unwrap_or_else(|| match completion.exit_code {
        Some(code) => format!("script exited with code {code}"),
        None => "script was terminated".to_string(),
    });
    (
        InstanceStatus::Errored,
        Some(RunError::Execution {
            exit_code: completion.exit_code,
            message,
        }),
    )
}
