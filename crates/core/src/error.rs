//! Tracker error model.

use thiserror::Error;

/// Result type used across the tracker.
pub type TrackerResult<T> = Result<T, TrackerError>;

/// Classification of a [`TrackerError`].
///
/// Callers decide what to do with a failure (retry it, fail a job, pick an
/// HTTP status) by matching on this kind rather than on error values.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    Conflict,
    TransactionFailure,
    ExceededNumberOfRetries,
    Storage,
    Queue,
    InvalidPayload,
}

impl ErrorKind {
    /// Client-side errors are never retried.
    pub fn is_client_error(self) -> bool {
        matches!(
            self,
            ErrorKind::NotFound | ErrorKind::AlreadyExists | ErrorKind::Conflict
        )
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TrackerError {
    /// A referenced row (or its parent) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A row with the same key already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The request conflicts with the current state of the target.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Serialization failure or deadlock reported by storage.
    #[error("transaction failure: {0}")]
    TransactionFailure(String),

    /// The in-process retry budget for transaction failures ran out.
    #[error("exceeded number of retries ({retries})")]
    ExceededNumberOfRetries { retries: u32 },

    /// Unclassified storage failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Broker failure while publishing or consuming jobs.
    #[error("queue error: {0}")]
    Queue(String),

    /// A job payload could not be decoded or encoded.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl TrackerError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn transaction_failure(msg: impl Into<String>) -> Self {
        Self::TransactionFailure(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn queue(msg: impl Into<String>) -> Self {
        Self::Queue(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TrackerError::NotFound(_) => ErrorKind::NotFound,
            TrackerError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            TrackerError::Conflict(_) => ErrorKind::Conflict,
            TrackerError::TransactionFailure(_) => ErrorKind::TransactionFailure,
            TrackerError::ExceededNumberOfRetries { .. } => ErrorKind::ExceededNumberOfRetries,
            TrackerError::Storage(_) => ErrorKind::Storage,
            TrackerError::Queue(_) => ErrorKind::Queue,
            TrackerError::InvalidPayload(_) => ErrorKind::InvalidPayload,
        }
    }
}

impl From<serde_json::Error> for TrackerError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidPayload(err.to_string())
    }
}
