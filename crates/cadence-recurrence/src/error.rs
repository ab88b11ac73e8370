use thiserror::Error;

/// Errors raised by rule validation and cursor consumption.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecurrenceError {
    /// The rule is incoherent (zero interval, missing weekdays, day out of range, …).
    #[error("Invalid recurrence rule: {0}")]
    InvalidRule(String),

    /// `advance` was called with no occurrence remaining. Callers must `peek` first.
    #[error("Recurrence exhausted: no occurrence remaining")]
    Exhausted,
}

pub type Result<T> = std::result::Result<T, RecurrenceError>;
