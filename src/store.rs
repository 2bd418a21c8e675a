//! The event store contract: durable, ordered, append-only streams with
//! optimistic concurrency.
//!
//! The engine does not prescribe a storage engine, only this contract. Two
//! backends ship with the crate: [`MemoryStore`](crate::MemoryStore) for
//! tests and ephemeral use, and [`JsonlStore`](crate::JsonlStore) for
//! durable single-node deployments.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::event::{ProposedEvent, StoredEvent};

/// Expected stream version for optimistic concurrency on append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Accept any current stream version (no concurrency check).
    Any,
    /// The stream must not exist yet (first write).
    NoStream,
    /// The stream must be at exactly this version (= event count).
    Exact(u64),
}

impl ExpectedVersion {
    /// Whether a stream currently at `actual` satisfies this expectation.
    pub fn matches(self, actual: u64) -> bool {
        match self {
            Self::Any => true,
            Self::NoStream => actual == 0,
            Self::Exact(v) => actual == v,
        }
    }
}

/// Result of a successful append.
#[derive(Debug, Clone)]
pub struct AppendReceipt {
    /// The stream's version after the append (= total event count).
    pub new_version: u64,
    /// The appended events with store-assigned versions, positions, and
    /// timestamps, in append order.
    pub events: Vec<StoredEvent>,
}

/// Durable, ordered, append-only storage of events per stream, with
/// optimistic concurrency control.
///
/// # Contract
///
/// - A stream's version is the count of events appended to it; each append
///   increases it by exactly the batch size, with no gaps and no
///   reordering. Streams are created implicitly on first append and never
///   deleted.
/// - `append` is atomic per batch: all events in one call succeed or fail
///   together, and the version check happens under the same exclusion as
///   the write. Two concurrent appends to the same stream with the same
///   `ExpectedVersion::Exact` value must resolve with exactly one winner;
///   the loser receives [`StoreError::Conflict`].
/// - Appends to different streams never contend beyond the store's internal
///   critical section; there is no per-stream lock held across calls.
/// - `read_all_from` yields global append order; per-stream order is
///   preserved within it. This is the ordering contract multi-stream
///   projections rely on.
#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// Append a batch of events to a stream.
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`] if the stream's current version does not
    /// satisfy `expected`; [`StoreError::Io`] on storage failure.
    async fn append(
        &self,
        stream_id: Uuid,
        expected: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> Result<AppendReceipt, StoreError>;

    /// Read a stream's events in append order, skipping the first
    /// `from_version` events.
    ///
    /// Reading a nonexistent stream yields an empty vector, not an error.
    async fn read_stream(
        &self,
        stream_id: Uuid,
        from_version: u64,
    ) -> Result<Vec<StoredEvent>, StoreError>;

    /// Read all events across streams in global append order, starting at
    /// the given global position.
    async fn read_all_from(&self, position: u64) -> Result<Vec<StoredEvent>, StoreError>;

    /// The stream's current version (0 for a nonexistent stream).
    async fn stream_version(&self, stream_id: Uuid) -> Result<u64, StoreError>;
}

/// Assign versions, positions, and a timestamp to a proposed batch.
///
/// Called by backends under their write lock, after the version check has
/// passed. `current_version` is the stream version before the batch;
/// `next_position` is the next free global position.
pub(crate) fn seal_batch(
    stream_id: Uuid,
    current_version: u64,
    next_position: u64,
    events: Vec<ProposedEvent>,
) -> Vec<StoredEvent> {
    let recorded_at = crate::event::now_millis();
    events
        .into_iter()
        .enumerate()
        .map(|(i, proposed)| StoredEvent {
            event_id: proposed.event_id,
            stream_id,
            stream_version: current_version + i as u64 + 1,
            global_position: next_position + i as u64,
            event_type: proposed.event_type,
            payload: proposed.payload,
            metadata: proposed.metadata,
            recorded_at,
        })
        .collect()
}
