//! Job and job-instance records.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use cadence_recurrence::RecurrenceRule;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Opaque identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a fresh random job ID (UUIDv4).
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Opaque identifier for a job instance.
///
/// UUIDv7 so instances sort by creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

/// Lifecycle of a job. `Disabled` and `Finished` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Active,
    /// Stopped after too many consecutive failures.
    Disabled,
    /// Every occurrence of the rule has run.
    Finished,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Active)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Active => "active",
            JobStatus::Disabled => "disabled",
            JobStatus::Finished => "finished",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(JobStatus::Active),
            "disabled" => Ok(JobStatus::Disabled),
            "finished" => Ok(JobStatus::Finished),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// InstanceStatus
// ---------------------------------------------------------------------------

/// Lifecycle of one run slot: scheduled → running → terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Scheduled,
    Running,
    Succeeded,
    Errored,
    TimedOut,
    Canceled,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, InstanceStatus::Scheduled | InstanceStatus::Running)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceStatus::Scheduled => "scheduled",
            InstanceStatus::Running => "running",
            InstanceStatus::Succeeded => "succeeded",
            InstanceStatus::Errored => "errored",
            InstanceStatus::TimedOut => "timed_out",
            InstanceStatus::Canceled => "canceled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(InstanceStatus::Scheduled),
            "running" => Ok(InstanceStatus::Running),
            "succeeded" => Ok(InstanceStatus::Succeeded),
            "errored" => Ok(InstanceStatus::Errored),
            "timed_out" => Ok(InstanceStatus::TimedOut),
            "canceled" => Ok(InstanceStatus::Canceled),
            other => Err(format!("unknown instance status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A persisted recurring job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Human-readable label.
    pub name: String,
    pub rule: RecurrenceRule,
    /// Resolved path of the script to execute.
    pub script: PathBuf,
    pub timeout_ms: u64,
    pub total_runs: u64,
    pub successful_runs: u64,
    pub consecutive_failures: u32,
    /// `0` disables the failure threshold.
    pub max_consecutive_failures: u32,
    pub status: JobStatus,
    /// End time of the most recent successful run.
    pub last_completed: Option<DateTime<Utc>>,
    /// Static payload used when no in-process payload source is registered.
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn is_active(&self) -> bool {
        self.status == JobStatus::Active
    }
}

/// Fields a caller supplies to create a job; counters start at zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    /// Caller-chosen ID, or `None` to generate one.
    pub id: Option<JobId>,
    pub name: String,
    pub rule: RecurrenceRule,
    pub script: PathBuf,
    pub timeout_ms: u64,
    pub max_consecutive_failures: u32,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl NewJob {
    /// Build the initial record for this request.
    pub fn into_job(self, now: DateTime<Utc>) -> Job {
        Job {
            id: self.id.unwrap_or_default(),
            name: self.name,
            rule: self.rule,
            script: self.script,
            timeout_ms: self.timeout_ms,
            total_runs: 0,
            successful_runs: 0,
            consecutive_failures: 0,
            max_consecutive_failures: self.max_consecutive_failures,
            status: JobStatus::Active,
            last_completed: None,
            payload: self.payload,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// JobInstance
// ---------------------------------------------------------------------------

/// One materialised occurrence of a job and the record of its execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInstance {
    pub id: InstanceId,
    pub job_id: JobId,
    pub scheduled_at: DateTime<Utc>,
    /// Absolute ordinal of the occurrence this instance runs.
    pub occurrence_index: u64,
    pub status: InstanceStatus,
    pub timeout_ms: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Execution or timeout error message, if the run failed.
    pub error: Option<String>,
}

impl JobInstance {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Wall-clock run time, once both ends are known.
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.ended_at? - self.started_at?)
    }
}

/// Fields needed to materialise an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewInstance {
    pub scheduled_at: DateTime<Utc>,
    pub occurrence_index: u64,
    pub timeout_ms: u64,
}

impl NewInstance {
    pub fn into_instance(self, job_id: JobId) -> JobInstance {
        JobInstance {
            id: InstanceId::new(),
            job_id,
            scheduled_at: self.scheduled_at,
            occurrence_index: self.occurrence_index,
            status: InstanceStatus::Scheduled,
            timeout_ms: self.timeout_ms,
            started_at: None,
            ended_at: None,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: None,
        }
    }
}
