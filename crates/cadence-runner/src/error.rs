//! Error types for the cadence-runner crate.

use thiserror::Error;

/// Failures that prevent a script from being launched at all.
///
/// A script that starts and then fails is not an error here; it is reported
/// through its [`RunCompletion`](crate::types::RunCompletion).
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Child-process spawn failed (missing file, not executable, …).
    #[error("Spawn error: {0}")]
    Spawn(String),

    /// Underlying I/O failure while wiring the child's pipes.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The payload could not be encoded for the child.
    #[error("Payload encoding error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, RunnerError>;
