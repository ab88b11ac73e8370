//! Job submission requests and their validation.

use std::time::Duration;

use cadence_core::JobDefinition;
use cadence_recurrence::RecurrenceRule;
use cadence_store::JobId;

use crate::payload::PayloadSource;

/// Largest timeout a repository can store: milliseconds as a signed 64-bit
/// integer.
pub const MAX_TIMEOUT: Duration = Duration::from_millis(i64::MAX as u64);

/// Everything needed to submit a new job.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub id: Option<JobId>,
    pub name: String,
    pub rule: RecurrenceRule,
    /// Script path, absolute or relative to the configured scripts directory.
    pub script: String,
    /// Defaults to the scheduler's `default_timeout_secs`.
    pub timeout: Option<Duration>,
    /// Defaults to the scheduler's `default_max_consecutive_failures`.
    pub max_consecutive_failures: Option<u32>,
    pub payload: PayloadSource,
}

impl JobRequest {
    pub fn new(name: impl Into<String>, rule: RecurrenceRule, script: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            rule,
            script: script.into(),
            timeout: None,
            max_consecutive_failures: None,
            payload: PayloadSource::default(),
        }
    }

    pub fn with_id(mut self, id: impl Into<JobId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_consecutive_failures(mut self, max: u32) -> Self {
        self.max_consecutive_failures = Some(max);
        self
    }

    pub fn with_payload(mut self, payload: impl Into<PayloadSource>) -> Self {
        self.payload = payload.into();
        self
    }
}

impl From<&JobDefinition> for JobRequest {
    fn from(def: &JobDefinition) -> Self {
        Self {
            id: Some(JobId::from(def.id.as_str())),
            name: def.name.clone().unwrap_or_else(|| def.id.clone()),
            rule: def.rule.clone(),
            script: def.script.clone(),
            timeout: def.timeout_secs.map(Duration::from_secs),
            max_consecutive_failures: def.max_consecutive_failures,
            payload: PayloadSource::Static(def.payload.clone()),
        }
    }
}

/// Result of validating a [`JobRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn from_errors(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}

/// Checks the shape of a job request before it is accepted.
pub trait RequestValidator: Send + Sync {
    fn validate(&self, request: &JobRequest) -> ValidationReport;
}

/// Field and rule checks that need no I/O. Collects every problem instead
/// of stopping at the first.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuralValidator;

impl RequestValidator for StructuralValidator {
    fn validate(&self, request: &JobRequest) -> ValidationReport {
        let mut errors = Vec::new();

        if request.id.as_ref().is_some_and(|id| id.as_str().trim().is_empty()) {
            errors.push("id must not be empty".to_string());
        }
        if request.name.trim().is_empty() {
            errors.push("name must not be empty".to_string());
        }
        if request.script.trim().is_empty() {
            errors.push("script must not be empty".to_string());
        }
        if request.timeout.is_some_and(|t| t.is_zero()) {
            errors.push("timeout must be positive".to_string());
        }
        if request.timeout.is_some_and(|t| t > MAX_TIMEOUT) {
            errors.push(format!(
                "timeout must not exceed {} ms",
                MAX_TIMEOUT.as_millis()
            ));
        }
        if let Err(e) = request.rule.validate() {
            errors.push(format!("rule: {e}"));
        }

        ValidationReport::from_errors(errors)
    }
}
