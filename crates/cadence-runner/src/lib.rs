//! cadence-runner: isolated, time-bounded script execution.
//!
//! - [`runner::ExecutionRunner`]: the seam the scheduler launches runs through.
//! - [`process::ProcessRunner`]: child-process implementation with SIGKILL on
//!   deadline or request.
//! - [`output::tee`]: bounded fan-out of a stream into a live consumer and a
//!   persisted capture.

pub mod error;
pub mod output;
pub mod process;
pub mod runner;
pub mod types;

pub use error::{Result, RunnerError};
pub use output::{tee, Capture, CapturedOutput, LiveOutput, OutputBuffer};
pub use process::{ProcessRunner, PAYLOAD_ENV};
pub use runner::ExecutionRunner;
pub use types::{CompletionStatus, OutputStream, RunCompletion, RunHandle};
