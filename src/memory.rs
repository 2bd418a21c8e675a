//! In-memory event store backend.
//!
//! The reference implementation of the [`EventStore`] concurrency contract.
//! A single mutex guards the version check and the write, making each append
//! batch atomic. Useful for tests and ephemeral processes; nothing survives
//! a restart.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::event::{ProposedEvent, StoredEvent};
use crate::store::{AppendReceipt, EventStore, ExpectedVersion, seal_batch};

#[derive(Default)]
struct MemoryInner {
    /// Per-stream event lists, in append order.
    streams: HashMap<Uuid, Vec<StoredEvent>>,
    /// Global append-order log across all streams.
    all: Vec<StoredEvent>,
}

/// In-memory [`EventStore`].
///
/// # Examples
///
/// ```
/// use foldstream::MemoryStore;
/// let store = MemoryStore::new();
/// ```
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn append(
        &self,
        stream_id: Uuid,
        expected: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> Result<AppendReceipt, StoreError> {
        // Lock poisoning means another writer panicked mid-append; the log
        // can no longer be trusted, so treat it as an invariant violation.
        let mut inner = self.inner.lock().expect("event log mutex poisoned");

        let current = inner
            .streams
            .get(&stream_id)
            .map(|s| s.len() as u64)
            .unwrap_or(0);
        if !expected.matches(current) {
            return Err(StoreError::Conflict {
                stream_id,
                expected,
                actual: current,
            });
        }

        let sealed = seal_batch(stream_id, current, inner.all.len() as u64, events);
        let stream = inner.streams.entry(stream_id).or_default();
        stream.extend(sealed.iter().cloned());
        let new_version = stream.len() as u64;
        inner.all.extend(sealed.iter().cloned());

        Ok(AppendReceipt {
            new_version,
            events: sealed,
        })
    }

    async fn read_stream(
        &self,
        stream_id: Uuid,
        from_version: u64,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let inner = self.inner.lock().expect("event log mutex poisoned");
        Ok(inner
            .streams
            .get(&stream_id)
            .map(|events| events.iter().skip(from_version as usize).cloned().collect())
            .unwrap_or_default())
    }

    async fn read_all_from(&self, position: u64) -> Result<Vec<StoredEvent>, StoreError> {
        let inner = self.inner.lock().expect("event log mutex poisoned");
        Ok(inner.all.iter().skip(position as usize).cloned().collect())
    }

    async fn stream_version(&self, stream_id: Uuid) -> Result<u64, StoreError> {
        let inner = self.inner.lock().expect("event log mutex poisoned");
        Ok(inner
            .streams
            .get(&stream_id)
            .map(|s| s.len() as u64)
            .unwrap_or(0))
    }
}
