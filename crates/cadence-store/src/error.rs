use thiserror::Error;

/// Errors raised by job repositories.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A rule, payload or snapshot could not be (de)serialised.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error("Job instance not found: {id}")]
    InstanceNotFound { id: String },

    /// A job with the requested ID already exists.
    #[error("Duplicate job: {id}")]
    DuplicateJob { id: String },
}

impl StoreError {
    /// Short machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Database(_) => "DATABASE_ERROR",
            StoreError::Serialization(_) => "SERIALIZATION_ERROR",
            StoreError::Io(_) => "IO_ERROR",
            StoreError::JobNotFound { .. } => "JOB_NOT_FOUND",
            StoreError::InstanceNotFound { .. } => "INSTANCE_NOT_FOUND",
            StoreError::DuplicateJob { .. } => "DUPLICATE_JOB",
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
