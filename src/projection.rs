//! Projections: derived read models folded from the global event log.
//!
//! A projection is a pure state machine over [`StoredEvent`]s, typically
//! spanning multiple streams. Each runner tracks a cursor into the global
//! log and can always be rebuilt from scratch, so projection state is
//! disposable; the event log remains the source of truth.

use std::any::Any;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::ProjectionError;
use crate::event::StoredEvent;
use crate::store::EventStore;

/// When a projection observes committed events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyMode {
    /// Applied inline by the executor after each successful commit.
    ///
    /// This is a declared update mode, not a transaction: the events are
    /// already durable when the projection sees them, and a crash between
    /// commit and apply is healed by the next catch-up.
    Immediate,
    /// Applied on demand via catch-up. The default; the only legal mode for
    /// deployments where projections run in a separate process.
    Eventual,
}

/// A derived read model folded from stored events.
///
/// `apply` must be pure state transformation (no I/O) and must tolerate
/// event types it does not recognize by leaving state unchanged; new event
/// types will flow through old projections.
pub trait Projection:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Unique projection name; also the checkpoint directory name.
    const NAME: &'static str;

    /// When this projection observes committed events.
    const CONSISTENCY: ConsistencyMode = ConsistencyMode::Eventual;

    /// Fold one stored event into the read model.
    fn apply(&mut self, event: &StoredEvent);
}

/// Projection state plus its cursor into the global log, as persisted to
/// the checkpoint file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionCheckpoint<P> {
    /// Next global position to read (= number of log events applied).
    pub position: u64,
    /// The folded read model.
    pub state: P,
}

/// Drives a single [`Projection`]: applies events in global order, tracks
/// the cursor, and optionally persists a checkpoint to disk.
///
/// The checkpoint file at `<dir>/<NAME>/checkpoint.json` is replaced
/// atomically (temp file + rename). An unreadable checkpoint is discarded
/// with a warning and the projection restarts from position zero, which is
/// always safe because rebuild is a supported recovery path.
pub struct ProjectionRunner<P: Projection> {
    state: P,
    position: u64,
    checkpoint_dir: Option<PathBuf>,
}

impl<P: Projection> Default for ProjectionRunner<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Projection> ProjectionRunner<P> {
    /// An in-memory runner with no checkpoint persistence.
    pub fn new() -> Self {
        Self {
            state: P::default(),
            position: 0,
            checkpoint_dir: None,
        }
    }

    /// A runner that persists its checkpoint under `dir`, resuming from an
    /// existing checkpoint if one is present and readable.
    pub fn with_checkpoint_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let path = dir.join(P::NAME).join("checkpoint.json");
        let (state, position) = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<ProjectionCheckpoint<P>>(&bytes) {
                Ok(cp) => (cp.state, cp.position),
                Err(e) => {
                    tracing::warn!(
                        projection = P::NAME,
                        path = %path.display(),
                        error = %e,
                        "corrupt checkpoint discarded, restarting from position 0"
                    );
                    (P::default(), 0)
                }
            },
            Err(_) => (P::default(), 0),
        };
        Self {
            state,
            position,
            checkpoint_dir: Some(dir),
        }
    }

    /// The current read model.
    pub fn state(&self) -> &P {
        &self.state
    }

    /// Next global position this runner will read.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Apply the event exactly at the cursor and advance it by one.
    ///
    /// Events at positions already covered are skipped, so redelivery
    /// after a crash cannot double-apply. Events past the cursor are also
    /// skipped *without* moving it: that gap means another writer
    /// committed to the log in between, and the next [`catch_up`] must
    /// still read the missed range.
    ///
    /// [`catch_up`]: ProjectionRunner::catch_up
    pub fn apply_event(&mut self, event: &StoredEvent) {
        if event.global_position != self.position {
            return;
        }
        self.state.apply(event);
        self.position = event.global_position + 1;
    }

    /// Read everything after the cursor from the global log, apply it, and
    /// persist the checkpoint. Returns the number of events applied.
    pub async fn catch_up(&mut self, store: &dyn EventStore) -> Result<usize, ProjectionError> {
        let events = store.read_all_from(self.position).await?;
        let applied = events.len();
        for event in &events {
            self.apply_event(event);
        }
        self.save()?;
        tracing::debug!(projection = P::NAME, applied, position = self.position, "caught up");
        Ok(applied)
    }

    /// Discard all state and replay the full log from position zero.
    pub async fn rebuild(&mut self, store: &dyn EventStore) -> Result<(), ProjectionError> {
        tracing::info!(projection = P::NAME, "rebuilding from position 0");
        self.state = P::default();
        self.position = 0;
        self.catch_up(store).await?;
        Ok(())
    }

    /// Persist the checkpoint, atomically replacing any previous one.
    /// A no-op for runners without a checkpoint directory.
    pub fn save(&self) -> Result<(), ProjectionError> {
        let Some(dir) = &self.checkpoint_dir else {
            return Ok(());
        };
        let proj_dir = dir.join(P::NAME);
        std::fs::create_dir_all(&proj_dir)?;

        let checkpoint = ProjectionCheckpoint {
            position: self.position,
            state: self.state.clone(),
        };
        let json = serde_json::to_vec_pretty(&checkpoint).map_err(std::io::Error::other)?;
        let tmp = proj_dir.join("checkpoint.json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, proj_dir.join("checkpoint.json"))?;
        Ok(())
    }
}

/// Object-safe view over [`ProjectionRunner`] so the executor can hold a
/// heterogeneous registry of projections.
#[async_trait]
pub(crate) trait ErasedProjection: Send + Sync {
    fn name(&self) -> &'static str;
    fn consistency(&self) -> ConsistencyMode;
    fn apply_event(&mut self, event: &StoredEvent);
    fn save(&self) -> Result<(), ProjectionError>;
    fn state_any(&self) -> &dyn Any;
    async fn catch_up(&mut self, store: &dyn EventStore) -> Result<usize, ProjectionError>;
    async fn rebuild(&mut self, store: &dyn EventStore) -> Result<(), ProjectionError>;
}

#[async_trait]
impl<P: Projection> ErasedProjection for ProjectionRunner<P> {
    fn name(&self) -> &'static str {
        P::NAME
    }

    fn consistency(&self) -> ConsistencyMode {
        P::CONSISTENCY
    }

    fn apply_event(&mut self, event: &StoredEvent) {
        ProjectionRunner::apply_event(self, event);
    }

    fn save(&self) -> Result<(), ProjectionError> {
        ProjectionRunner::save(self)
    }

    fn state_any(&self) -> &dyn Any {
        &self.state
    }

    async fn catch_up(&mut self, store: &dyn EventStore) -> Result<usize, ProjectionError> {
        ProjectionRunner::catch_up(self, store).await
    }

    async fn rebuild(&mut self, store: &dyn EventStore) -> Result<(), ProjectionError> {
        ProjectionRunner::rebuild(self, store).await
    }
}
