//! Run notifications.
//!
//! Every event for one instance is sent from the task that runs it, so a
//! subscriber always sees `Started` before the matching terminal event.

use cadence_runner::LiveOutput;
use cadence_store::JobInstance;

use crate::error::RunError;

/// Capacity of the broadcast channel behind [`Orchestrator::subscribe`](crate::Orchestrator::subscribe).
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum RunEvent {
    /// The script was launched. The live outputs stream while it runs.
    Started {
        instance: JobInstance,
        stdout: LiveOutput,
        stderr: LiveOutput,
    },
    /// Exited with code 0.
    Finished { instance: JobInstance },
    Failed {
        instance: JobInstance,
        error: RunError,
    },
    /// Killed at its deadline.
    TimedOut { instance: JobInstance },
}

impl RunEvent {
    pub fn instance(&self) -> &JobInstance {
        match self {
            RunEvent::Started { instance, .. }
            | RunEvent::Finished { instance }
            | RunEvent::Failed { instance, .. }
            | RunEvent::TimedOut { instance } => instance,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RunEvent::Started { .. } => "run.started",
            RunEvent::Finished { .. } => "run.finished",
            RunEvent::Failed { .. } => "run.failed",
            RunEvent::TimedOut { .. } => "run.timed_out",
        }
    }

    /// `true` for everything except `Started`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunEvent::Started { .. })
    }
}
