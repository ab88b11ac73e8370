//! `cadence-scheduler`: the job orchestrator.
//!
//! [`Orchestrator`] polls every active job's recurrence calculator, turns
//! occurrences that fall inside the look-ahead span into scheduled instances
//! with deadline timers, runs each instance through an
//! [`ExecutionRunner`](cadence_runner::ExecutionRunner) with a hard timeout,
//! and applies the retry / disable / finish rules after every run.
//!
//! Outcomes are published as [`RunEvent`]s on a broadcast channel.

pub mod engine;
pub mod error;
pub mod events;
pub mod payload;
pub mod validate;

pub use engine::{Orchestrator, TIMEOUT_EXIT_CODE};
pub use error::{Result, RunError, SchedulerError};
pub use events::{RunEvent, EVENT_CHANNEL_CAPACITY};
pub use payload::{PayloadError, PayloadSource};
pub use validate::{
    JobRequest, RequestValidator, StructuralValidator, ValidationReport, MAX_TIMEOUT,
};
