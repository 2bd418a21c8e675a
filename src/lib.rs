//! An embedded event-sourcing engine: pure decide/evolve aggregate cores
//! behind an append-only event log with optimistic concurrency.
//!
//! The design splits strictly into a functional core and an imperative
//! shell. Aggregates implement [`Aggregate`]: a pure `decide` that turns a
//! command into domain events (or a typed rejection) and a pure `evolve`
//! that folds events into state. All I/O lives in [`AggregateStore`], which
//! loads state, runs the decider, and appends the result guarded by the
//! stream version it loaded; a lost race against a concurrent writer is
//! replayed a bounded number of times.
//!
//! Read models are [`Projection`]s folded from the global log, always
//! rebuildable from scratch. [`MemoryStore`] and [`JsonlStore`] are the two
//! bundled [`EventStore`] backends.
//!
//! # Example
//!
//! ```
//! use foldstream::{Aggregate, AggregateStore, CommandContext, MemoryStore};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Default, Serialize, Deserialize)]
//! struct Counter {
//!     value: u64,
//! }
//!
//! #[derive(Debug, Clone)]
//! enum CounterCommand {
//!     Increment,
//! }
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! #[serde(tag = "type", content = "data")]
//! enum CounterEvent {
//!     Incremented,
//! }
//!
//! #[derive(Debug, thiserror::Error)]
//! enum CounterRejection {}
//!
//! impl Aggregate for Counter {
//!     const AGGREGATE_TYPE: &'static str = "counter";
//!     type Command = CounterCommand;
//!     type DomainEvent = CounterEvent;
//!     type Rejection = CounterRejection;
//!
//!     fn decide(&self, cmd: Self::Command) -> Result<Vec<Self::DomainEvent>, Self::Rejection> {
//!         match cmd {
//!             CounterCommand::Increment => Ok(vec![CounterEvent::Incremented]),
//!         }
//!     }
//!
//!     fn evolve(mut self, event: &Self::DomainEvent) -> Self {
//!         match event {
//!             CounterEvent::Incremented => self.value += 1,
//!         }
//!         self
//!     }
//! }
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let store = AggregateStore::builder()
//!     .store(MemoryStore::new())
//!     .open()
//!     .await?;
//!
//! store
//!     .execute::<Counter>("c-1", CounterCommand::Increment, CommandContext::default())
//!     .await?;
//!
//! let counter: Counter = store.state("c-1").await?;
//! assert_eq!(counter.value, 1);
//! # Ok(())
//! # }
//! ```

pub mod aggregate;
pub mod command;
pub mod error;
pub mod event;
pub mod executor;
pub mod memory;
pub mod projection;
pub mod snapshot;
pub mod storage;
pub mod store;

pub use aggregate::{Aggregate, fold, fold_stored};
pub use command::CommandContext;
pub use error::{ExecuteError, ProjectionError, StoreError};
pub use event::{
    EventMetadata, ProposedEvent, StoredEvent, decode_domain_event, encode_domain_event,
    stream_uuid,
};
pub use executor::{
    AggregateStore, AggregateStoreBuilder, CommandOutcome, EventHandler, RetryPolicy,
};
pub use memory::MemoryStore;
pub use projection::{ConsistencyMode, Projection, ProjectionCheckpoint, ProjectionRunner};
pub use snapshot::{Snapshot, SnapshotStore};
pub use storage::{JsonlStore, StreamLayout};
pub use store::{AppendReceipt, EventStore, ExpectedVersion};
