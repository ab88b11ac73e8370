use std::path::PathBuf;

use cadence_recurrence::RecurrenceError;
use cadence_store::StoreError;
use thiserror::Error;

/// Errors returned to callers of the orchestrator.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The job request failed validation; every problem found is listed.
    #[error("Invalid job request: {}", errors.join("; "))]
    InvalidRequest { errors: Vec<String> },

    #[error("Invalid rule: {0}")]
    InvalidRule(#[from] RecurrenceError),

    #[error("Script not found: {}", path.display())]
    ScriptNotFound { path: PathBuf },

    /// Persistence failure. Always propagated, never swallowed.
    #[error("Repository error: {0}")]
    Repository(#[from] StoreError),

    #[error("Orchestrator is already running")]
    AlreadyRunning,

    #[error("Orchestrator is not running")]
    NotRunning,

    #[error("Job not found: {id}")]
    JobNotFound { id: String },
}

impl SchedulerError {
    /// Short machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::InvalidRequest { .. } => "INVALID_REQUEST",
            SchedulerError::InvalidRule(_) => "INVALID_RULE",
            SchedulerError::ScriptNotFound { .. } => "SCRIPT_NOT_FOUND",
            SchedulerError::Repository(_) => "REPOSITORY_ERROR",
            SchedulerError::AlreadyRunning => "ALREADY_RUNNING",
            SchedulerError::NotRunning => "NOT_RUNNING",
            SchedulerError::JobNotFound { .. } => "JOB_NOT_FOUND",
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Why a single run did not succeed.
///
/// Carried in [`RunEvent::Failed`](crate::RunEvent::Failed) and persisted on
/// the instance as its `error` text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    /// Non-zero exit or termination by signal.
    #[error("{message}")]
    Execution {
        exit_code: Option<i32>,
        message: String,
    },

    #[error("run timed out after {after_ms} ms")]
    Timeout { after_ms: u64 },

    /// The payload factory failed; the script was never launched.
    #[error("payload error: {0}")]
    Payload(String),

    /// The runner could not start the script.
    #[error("launch error: {0}")]
    Launch(String),
}
