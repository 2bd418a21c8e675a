//! Crate-level error types for the store, command execution, and projections.

use uuid::Uuid;

use crate::store::ExpectedVersion;

/// Error returned by [`EventStore`](crate::EventStore) operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Optimistic concurrency check failed: another writer appended to the
    /// stream between the caller's read and this append.
    ///
    /// This is an expected outcome, not a fault. Callers reload state,
    /// re-decide, and re-append; the executor does this automatically with
    /// a bounded retry count.
    #[error("version conflict on stream {stream_id}: expected {expected:?}, actual {actual}")]
    Conflict {
        /// The stream the append targeted.
        stream_id: Uuid,
        /// The version the writer expected the stream to be at.
        expected: ExpectedVersion,
        /// The stream's actual current version.
        actual: u64,
    },

    /// Underlying storage I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted event record could not be parsed. Indicates a
    /// data-integrity bug, not a business outcome, so it is fatal.
    #[error("corrupt event record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// `true` for the expected, retryable concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Error returned when executing a command against an aggregate fails.
///
/// Generic over `R`, the aggregate's enumerable rejection type. Validation
/// failures and business-rule violations both arrive as `Rejected`; they are
/// never retried automatically. `Conflict` and `Store` are infrastructure
/// outcomes, surfaced only after the executor's retry policy is exhausted.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError<R: std::error::Error + Send + Sync + 'static> {
    /// The decider refused the command. No events were written.
    #[error(transparent)]
    Rejected(R),

    /// Optimistic concurrency retries exhausted: every attempt lost the
    /// race against a concurrent writer on the same stream.
    #[error("optimistic concurrency conflict: retries exhausted")]
    Conflict,

    /// The event store failed after I/O retries were exhausted.
    #[error("event store failure: {0}")]
    Store(#[from] StoreError),
}

/// Error returned by projection catch-up and rebuild.
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    /// Reading the global log failed.
    #[error("event store failure: {0}")]
    Store(#[from] StoreError),

    /// Persisting or loading the projection checkpoint failed.
    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The projection is not registered with the store.
    #[error("projection '{0}' not registered")]
    NotRegistered(&'static str),

    /// A registered runner's state did not downcast to the requested type.
    #[error("projection '{0}' type mismatch")]
    TypeMismatch(&'static str),
}
