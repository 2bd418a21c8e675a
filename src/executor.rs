//! The imperative shell: loads state, runs the pure decider, and appends
//! the resulting events with optimistic concurrency.
//!
//! All I/O orchestration lives here. Nothing is persisted before the
//! append, so a command future dropped mid-flight has no side effect; once
//! the append commits, the events are permanent facts and the remaining
//! steps (snapshot refresh, projection apply, handler publish) are
//! best-effort and healed by catch-up.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::Instrument;
use uuid::Uuid;

use crate::aggregate::{Aggregate, fold, fold_stored};
use crate::command::CommandContext;
use crate::error::{ExecuteError, ProjectionError, StoreError};
use crate::event::{ProposedEvent, StoredEvent, encode_domain_event, stream_uuid};
use crate::projection::{ConsistencyMode, ErasedProjection, Projection, ProjectionRunner};
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::store::{AppendReceipt, EventStore, ExpectedVersion};

/// Bounds on the executor's automatic retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// How many times a lost optimistic-concurrency race is replayed
    /// (reload, re-decide, re-append) before surfacing
    /// [`ExecuteError::Conflict`].
    pub max_conflict_retries: u32,
    /// How many times a failed append I/O is retried before surfacing
    /// [`ExecuteError::Store`].
    pub max_io_retries: u32,
    /// Base delay for exponential backoff between I/O retries.
    pub io_backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_conflict_retries: 3,
            max_io_retries: 2,
            io_backoff_base: Duration::from_millis(50),
        }
    }
}

/// Side-effect subscriber notified after events commit.
///
/// Handlers run after the append has succeeded; a handler failure is logged
/// and never fails the command. Handlers must tolerate unknown event types.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        event: &StoredEvent,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Result of a successfully processed command.
#[derive(Debug, Clone)]
pub enum CommandOutcome<E> {
    /// Events were appended; `version` is the stream version afterwards.
    Committed { events: Vec<E>, version: u64 },
    /// The decider accepted the command but produced no events; nothing
    /// was written.
    NoOp,
}

impl<E> CommandOutcome<E> {
    /// `true` when the command produced no events.
    pub fn is_noop(&self) -> bool {
        matches!(self, Self::NoOp)
    }

    /// The committed events (empty for a no-op).
    pub fn committed_events(&self) -> &[E] {
        match self {
            Self::Committed { events, .. } => events,
            Self::NoOp => &[],
        }
    }
}

type RunnerFactory = Box<dyn FnOnce(Option<&Path>) -> Box<dyn ErasedProjection> + Send>;

/// Builder for [`AggregateStore`]. The event store is required; everything
/// else is optional.
///
/// # Examples
///
/// ```no_run
/// # use foldstream::{AggregateStore, MemoryStore};
/// # async fn build() -> Result<(), foldstream::ProjectionError> {
/// let store = AggregateStore::builder()
///     .store(MemoryStore::new())
///     .open()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct AggregateStoreBuilder {
    store: Option<Arc<dyn EventStore>>,
    snapshot_dir: Option<PathBuf>,
    checkpoint_dir: Option<PathBuf>,
    retry: RetryPolicy,
    projections: Vec<RunnerFactory>,
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl AggregateStoreBuilder {
    fn new() -> Self {
        Self {
            store: None,
            snapshot_dir: None,
            checkpoint_dir: None,
            retry: RetryPolicy::default(),
            projections: Vec::new(),
            handlers: Vec::new(),
        }
    }

    /// Set the event store backend.
    pub fn store(mut self, store: impl EventStore) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    /// Set a shared event store backend.
    pub fn shared_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Enable per-instance snapshots under this directory.
    pub fn snapshot_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.snapshot_dir = Some(dir.into());
        self
    }

    /// Persist projection checkpoints under this directory. Without it,
    /// registered projections are in-memory only.
    pub fn checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    /// Override the default retry bounds.
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Register a projection. Its runner is constructed (resuming from a
    /// checkpoint if one exists) and caught up when [`open`] runs.
    ///
    /// [`open`]: AggregateStoreBuilder::open
    pub fn projection<P: Projection>(mut self) -> Self {
        self.projections.push(Box::new(|dir| match dir {
            Some(dir) => Box::new(ProjectionRunner::<P>::with_checkpoint_dir(dir)),
            None => Box::new(ProjectionRunner::<P>::new()),
        }));
        self
    }

    /// Register a side-effect handler.
    pub fn handler(mut self, handler: impl EventHandler) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Finish the builder, catching every registered projection up to the
    /// end of the log.
    ///
    /// Immediate-mode projections rely on this initial catch-up: after it,
    /// they only ever see events inline, so their cursor never gaps.
    pub async fn open(self) -> Result<AggregateStore, ProjectionError> {
        let store = self.store.ok_or_else(|| {
            ProjectionError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "an event store is required",
            ))
        })?;

        let mut projections = HashMap::new();
        for factory in self.projections {
            let mut runner = factory(self.checkpoint_dir.as_deref());
            runner.catch_up(store.as_ref()).await?;
            projections.insert(runner.name(), runner);
        }

        Ok(AggregateStore {
            store,
            snapshots: self.snapshot_dir.map(SnapshotStore::new),
            retry: self.retry,
            projections: Mutex::new(projections),
            handlers: self.handlers,
        })
    }
}

/// Entry point for command execution and projection access.
///
/// Holds the event store behind a trait object, an optional snapshot
/// store, the registered projections, and the side-effect handlers.
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct AggregateStore {
    store: Arc<dyn EventStore>,
    snapshots: Option<SnapshotStore>,
    retry: RetryPolicy,
    projections: Mutex<HashMap<&'static str, Box<dyn ErasedProjection>>>,
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl AggregateStore {
    /// Start building an `AggregateStore`.
    pub fn builder() -> AggregateStoreBuilder {
        AggregateStoreBuilder::new()
    }

    /// The underlying event store.
    pub fn event_store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Execute a command against an aggregate instance.
    ///
    /// Loads current state (snapshot-accelerated when configured), runs the
    /// pure decider, and appends the produced events with the loaded
    /// version as the optimistic-concurrency guard. A lost race reloads
    /// and replays the whole cycle up to
    /// [`RetryPolicy::max_conflict_retries`] times.
    ///
    /// # Errors
    ///
    /// - [`ExecuteError::Rejected`] — the decider refused the command;
    ///   nothing was written.
    /// - [`ExecuteError::Conflict`] — every retry lost the concurrency
    ///   race.
    /// - [`ExecuteError::Store`] — the store failed after I/O retries.
    pub async fn execute<A: Aggregate>(
        &self,
        instance_id: &str,
        cmd: A::Command,
        ctx: CommandContext,
    ) -> Result<CommandOutcome<A::DomainEvent>, ExecuteError<A::Rejection>>
    where
        A::Command: Clone,
    {
        let span = tracing::info_span!(
            "execute",
            aggregate = A::AGGREGATE_TYPE,
            instance = instance_id
        );
        self.execute_inner::<A>(instance_id, cmd, ctx)
            .instrument(span)
            .await
    }

    async fn execute_inner<A: Aggregate>(
        &self,
        instance_id: &str,
        cmd: A::Command,
        ctx: CommandContext,
    ) -> Result<CommandOutcome<A::DomainEvent>, ExecuteError<A::Rejection>>
    where
        A::Command: Clone,
    {
        let stream_id = stream_uuid(A::AGGREGATE_TYPE, instance_id);
        let mut conflicts = 0u32;

        loop {
            let (state, version) = self
                .load::<A>(stream_id, instance_id)
                .await
                .map_err(ExecuteError::Store)?;

            let events = state
                .decide(cmd.clone())
                .map_err(ExecuteError::Rejected)?;
            if events.is_empty() {
                tracing::debug!(version, "command accepted with no events");
                return Ok(CommandOutcome::NoOp);
            }

            let proposed = events
                .iter()
                .map(|e| encode_domain_event::<A>(e, &ctx, instance_id))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| {
                    ExecuteError::Store(StoreError::Corrupt(format!(
                        "event serialization failed: {e}"
                    )))
                })?;

            match self
                .append_with_io_retry(stream_id, ExpectedVersion::Exact(version), proposed)
                .await
            {
                Ok(receipt) => {
                    tracing::info!(
                        count = receipt.events.len(),
                        version = receipt.new_version,
                        "events committed"
                    );
                    self.refresh_snapshot::<A>(instance_id, state, &events, &receipt);
                    self.publish(&receipt.events).await;
                    return Ok(CommandOutcome::Committed {
                        events,
                        version: receipt.new_version,
                    });
                }
                Err(StoreError::Conflict { actual, .. }) => {
                    conflicts += 1;
                    if conflicts > self.retry.max_conflict_retries {
                        tracing::warn!(
                            attempts = conflicts,
                            "concurrency conflict retries exhausted"
                        );
                        return Err(ExecuteError::Conflict);
                    }
                    tracing::debug!(
                        expected = version,
                        actual,
                        attempt = conflicts,
                        "append lost concurrency race, reloading"
                    );
                }
                Err(e) => return Err(ExecuteError::Store(e)),
            }
        }
    }

    /// Read and fold an aggregate's current state without writing.
    pub async fn state<A: Aggregate>(&self, instance_id: &str) -> Result<A, StoreError> {
        let stream_id = stream_uuid(A::AGGREGATE_TYPE, instance_id);
        let (state, _) = self.load::<A>(stream_id, instance_id).await?;
        Ok(state)
    }

    /// A cloned copy of a registered projection's current read model.
    ///
    /// # Errors
    ///
    /// [`ProjectionError::NotRegistered`] if `P` was never registered with
    /// the builder; [`ProjectionError::TypeMismatch`] if another projection
    /// type is registered under the same name.
    pub async fn projection_state<P: Projection>(&self) -> Result<P, ProjectionError> {
        let projections = self.projections.lock().await;
        let runner = projections
            .get(P::NAME)
            .ok_or(ProjectionError::NotRegistered(P::NAME))?;
        runner
            .state_any()
            .downcast_ref::<P>()
            .cloned()
            .ok_or(ProjectionError::TypeMismatch(P::NAME))
    }

    /// Apply all log events after a projection's cursor and persist its
    /// checkpoint. Returns the number of events applied.
    pub async fn catch_up_projection<P: Projection>(&self) -> Result<usize, ProjectionError> {
        let mut projections = self.projections.lock().await;
        let runner = projections
            .get_mut(P::NAME)
            .ok_or(ProjectionError::NotRegistered(P::NAME))?;
        runner.catch_up(self.store.as_ref()).await
    }

    /// Discard a projection's state and replay the full log from position
    /// zero.
    pub async fn rebuild_projection<P: Projection>(&self) -> Result<(), ProjectionError> {
        let mut projections = self.projections.lock().await;
        let runner = projections
            .get_mut(P::NAME)
            .ok_or(ProjectionError::NotRegistered(P::NAME))?;
        runner.rebuild(self.store.as_ref()).await
    }

    async fn load<A: Aggregate>(
        &self,
        stream_id: Uuid,
        instance_id: &str,
    ) -> Result<(A, u64), StoreError> {
        if let Some(snapshots) = &self.snapshots {
            if let Some(snapshot) = snapshots.load::<A>(instance_id) {
                let current = self.store.stream_version(stream_id).await?;
                if snapshot.stream_version <= current {
                    let tail = self
                        .store
                        .read_stream(stream_id, snapshot.stream_version)
                        .await?;
                    let version = snapshot.stream_version + tail.len() as u64;
                    return Ok((fold_stored(snapshot.state, &tail), version));
                }
                // A snapshot ahead of the log means the log was replaced or
                // truncated out of band. The log wins.
                tracing::warn!(
                    %stream_id,
                    snapshot_version = snapshot.stream_version,
                    log_version = current,
                    "snapshot is ahead of the event log, ignoring it"
                );
            }
        }

        let events = self.store.read_stream(stream_id, 0).await?;
        let version = events.len() as u64;
        Ok((fold_stored(A::default(), &events), version))
    }

    async fn append_with_io_retry(
        &self,
        stream_id: Uuid,
        expected: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> Result<AppendReceipt, StoreError> {
        let mut attempt = 0u32;
        loop {
            match self.store.append(stream_id, expected, events.clone()).await {
                Err(StoreError::Io(e)) if attempt < self.retry.max_io_retries => {
                    attempt += 1;
                    let delay = self.retry.io_backoff_base * 2u32.pow(attempt - 1);
                    tracing::warn!(
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "append I/O failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    /// Refresh the instance snapshot after a commit. Snapshot failures are
    /// logged and swallowed; the command already succeeded.
    fn refresh_snapshot<A: Aggregate>(
        &self,
        instance_id: &str,
        state: A,
        events: &[A::DomainEvent],
        receipt: &AppendReceipt,
    ) {
        let Some(snapshots) = &self.snapshots else {
            return;
        };
        let snapshot = Snapshot {
            state: fold(state, events.iter()),
            stream_version: receipt.new_version,
        };
        if let Err(e) = snapshots.save::<A>(instance_id, &snapshot) {
            tracing::warn!(
                aggregate = A::AGGREGATE_TYPE,
                instance = instance_id,
                error = %e,
                "snapshot save failed"
            );
        }
    }

    /// Apply committed events to immediate-mode projections and publish
    /// them to side-effect handlers. Failures here never fail the command.
    async fn publish(&self, events: &[StoredEvent]) {
        {
            let mut projections = self.projections.lock().await;
            for runner in projections.values_mut() {
                if runner.consistency() != ConsistencyMode::Immediate {
                    continue;
                }
                for event in events {
                    runner.apply_event(event);
                }
                if let Err(e) = runner.save() {
                    tracing::error!(
                        projection = runner.name(),
                        error = %e,
                        "projection checkpoint save failed"
                    );
                }
            }
        }

        for handler in &self.handlers {
            for event in events {
                if let Err(e) = handler.handle(event).await {
                    tracing::error!(
                        event_type = %event.event_type,
                        event_id = %event.event_id,
                        error = %e,
                        "event handler failed"
                    );
                }
            }
        }
    }
}
