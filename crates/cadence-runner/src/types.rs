//! Shared data types for cadence-runner.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use tokio::io::AsyncRead;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// A live byte stream from a running script.
pub type OutputStream = Pin<Box<dyn AsyncRead + Send>>;

// ---------------------------------------------------------------------------
// CompletionStatus
// ---------------------------------------------------------------------------

/// How an execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    /// The script exited on its own; see `exit_code`.
    Exited,
    /// Terminated on request through [`RunHandle::terminate`].
    Killed,
    /// The runner's own deadline expired and the script was killed.
    TimedOut,
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompletionStatus::Exited => "exited",
            CompletionStatus::Killed => "killed",
            CompletionStatus::TimedOut => "timed_out",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// RunCompletion
// ---------------------------------------------------------------------------

/// Final result of one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCompletion {
    pub status: CompletionStatus,
    /// `None` when the process was ended by a signal.
    pub exit_code: Option<i32>,
    /// Error surfaced by the runner itself (wait failure, signal, …).
    pub error: Option<String>,
}

impl RunCompletion {
    pub fn exited(exit_code: i32) -> Self {
        Self {
            status: CompletionStatus::Exited,
            exit_code: Some(exit_code),
            error: None,
        }
    }

    pub fn killed() -> Self {
        Self {
            status: CompletionStatus::Killed,
            exit_code: None,
            error: None,
        }
    }

    pub fn timed_out() -> Self {
        Self {
            status: CompletionStatus::TimedOut,
            exit_code: None,
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// `true` only for a clean exit with code 0.
    pub fn is_success(&self) -> bool {
        self.status == CompletionStatus::Exited && self.exit_code == Some(0)
    }
}

// ---------------------------------------------------------------------------
// RunHandle
// ---------------------------------------------------------------------------

/// Everything a caller receives from a launched execution.
///
/// The two streams must be drained or the child may block on a full pipe.
pub struct RunHandle {
    pub stdout: OutputStream,
    pub stderr: OutputStream,
    /// Resolves once the execution has ended, however it ended.
    pub completion: oneshot::Receiver<RunCompletion>,
    /// Cancel to force termination.
    pub terminator: CancellationToken,
}

impl RunHandle {
    /// Ask the runner to kill the execution. Idempotent.
    pub fn terminate(&self) {
        self.terminator.cancel();
    }
}

impl fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunHandle")
            .field("terminated", &self.terminator.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_clean_zero_exit_is_success() {
        assert!(RunCompletion::exited(0).is_success());
        assert!(!RunCompletion::exited(1).is_success());
        assert!(!RunCompletion::killed().is_success());
        assert!(!RunCompletion::timed_out().is_success());
    }

    #[test]
    fn status_serialises_snake_case() {
        let json = serde_json::to_string(&CompletionStatus::TimedOut).unwrap();
        assert_eq!(json, r#""timed_out""#);
        assert_eq!(CompletionStatus::TimedOut.to_string(), "timed_out");
    }
}
