//! Error types for the store, the execution substrate and the engine.
//!
//! Attempt-level failures (non-zero exits, error traces, timeouts) are not
//! errors: they are recorded as [`AttemptOutcome`](crate::job::AttemptOutcome)s.
//! The types here describe infrastructure problems and broken invariants.

use crate::job::{ConnectionId, JobId};

/// Errors produced by [`JobStore`](crate::store::JobStore) operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    /// The write would violate a lifecycle rule, e.g. a second live attempt.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("connection {connection_id} already has active job {job_id}")]
    AlreadyRunning {
        connection_id: ConnectionId,
        job_id: JobId,
    },

    /// Storage could not be reached. Callers may retry with backoff.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store backend error: {0}")]
    Backend(String),

    /// A persisted row could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Errors from an [`ExecutionSubstrate`](crate::substrate::ExecutionSubstrate).
#[derive(Debug, thiserror::Error)]
pub enum SubstrateError {
    #[error("failed to start unit {unit_id}: {reason}")]
    Start { unit_id: String, reason: String },

    #[error("unknown unit {0}")]
    UnknownUnit(String),

    /// The output stream was already attached or never existed.
    #[error("output of unit {0} is not available")]
    OutputUnavailable(String),

    #[error("{command} failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Top-level engine error.
#[derive(Debug, thiserror::Error)]
pub enum FerryError {
    /// Infrastructure stayed unavailable after retrying. Never counted
    /// against a job's attempt budget; the job can be resumed later.
    #[error("transient infrastructure failure: {0}")]
    Transient(String),

    /// A lifecycle invariant was broken. Fatal to the orchestrator instance.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("connection {connection_id} already has active job {job_id}")]
    AlreadyRunning {
        connection_id: ConnectionId,
        job_id: JobId,
    },

    #[error("store: {0}")]
    Store(StoreError),

    #[error("substrate: {0}")]
    Substrate(#[from] SubstrateError),

    #[error("dispatcher is shutting down")]
    ShuttingDown,
}

impl From<StoreError> for FerryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => FerryError::Transient(msg),
            StoreError::NotFound(what) => FerryError::NotFound(what),
            StoreError::AlreadyRunning {
                connection_id,
                job_id,
            } => FerryError::AlreadyRunning {
                connection_id,
                job_id,
            },
            StoreError::InvalidState(msg) => FerryError::InvariantViolation(msg),
            other => FerryError::Store(other),
        }
    }
}

/// Convenience alias used throughout the engine.
pub type FerryResult<T> = std::result::Result<T, FerryError>;

/// Result alias for store implementations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_maps_to_transient() {
        let err = FerryError::from(StoreError::Unavailable("pool timed out".into()));
        assert!(matches!(err, FerryError::Transient(ref msg) if msg == "pool timed out"));
    }

    #[test]
    fn invalid_state_maps_to_invariant_violation() {
        let err = FerryError::from(StoreError::InvalidState("attempt 0 still running".into()));
        assert!(matches!(err, FerryError::InvariantViolation(_)));
        assert!(err.to_string().contains("attempt 0 still running"));
    }

    #[test]
    fn only_unavailable_is_transient() {
        assert!(StoreError::Unavailable("x".into()).is_transient());
        assert!(!StoreError::Backend("x".into()).is_transient());
        assert!(!StoreError::NotFound("x".into()).is_transient());
    }

    #[test]
    fn substrate_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = FerryError::from(SubstrateError::from(io_err));
        assert!(err.to_string().contains("no such file"));
    }
}
