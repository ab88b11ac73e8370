//! `cadence-core`: configuration shared by every cadence crate.

pub mod config;
pub mod error;

pub use config::{
    CadenceConfig, DatabaseConfig, DurabilityConfig, JobDefinition, RunnerConfig, SchedulerConfig,
};
pub use error::{CoreError, Result};
