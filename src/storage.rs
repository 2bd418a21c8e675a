//! Durable file-backed event store and the on-disk directory layout.
//!
//! Events live in a single append-only JSONL file (one logical table, one
//! JSON line per event), which keeps the persisted layout trivially
//! auditable and replayable. Snapshots and projection checkpoints get their
//! own directories beside it.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::event::{ProposedEvent, StoredEvent};
use crate::store::{AppendReceipt, EventStore, ExpectedVersion, seal_batch};

/// Manages the on-disk directory layout for an event store.
///
/// The layout follows this structure:
/// ```text
/// <base_dir>/
///     events.jsonl        -- the global append-only event log
///     snapshots/
///         <aggregate_type>/<instance_id>/snapshot.json
///     projections/
///         <projection_name>/checkpoint.json
/// ```
///
/// `StreamLayout` is cheap to clone (it wraps a single `PathBuf`) and
/// provides path helpers for the other components.
#[derive(Debug, Clone)]
pub struct StreamLayout {
    base_dir: PathBuf,
}

impl StreamLayout {
    /// Create a new `StreamLayout` rooted at the given base directory.
    ///
    /// The directory does not need to exist yet; it is created when
    /// [`ensure`](StreamLayout::ensure) is called.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Returns the root directory of this layout.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Returns the path to the global event log file.
    pub fn events_path(&self) -> PathBuf {
        self.base_dir.join("events.jsonl")
    }

    /// Returns the path to the snapshots directory.
    pub fn snapshots_dir(&self) -> PathBuf {
        self.base_dir.join("snapshots")
    }

    /// Returns the path to the projection checkpoints directory.
    pub fn projections_dir(&self) -> PathBuf {
        self.base_dir.join("projections")
    }

    /// Creates the base directory if it does not exist. Idempotent.
    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base_dir)
    }
}

#[derive(Debug)]
struct JsonlInner {
    /// Append handle to `events.jsonl`.
    file: File,
    /// Current version (= event count) per stream.
    versions: HashMap<Uuid, u64>,
    /// In-memory mirror of the log, in global append order. Reads are
    /// served from here; the file is the durable source rebuilt on open.
    all: Vec<StoredEvent>,
}

/// Durable [`EventStore`] backed by a single JSONL file.
///
/// Appends serialize each event as one JSON line and fsync before
/// returning. The whole file is replayed on [`open`](JsonlStore::open) to
/// rebuild the per-stream version index, so events written by a previous
/// process are visible to the next one.
///
/// # Examples
///
/// ```no_run
/// use foldstream::JsonlStore;
///
/// let store = JsonlStore::open("/var/lib/myapp/es")?;
/// # Ok::<(), foldstream::StoreError>(())
/// ```
#[derive(Debug)]
pub struct JsonlStore {
    layout: StreamLayout,
    inner: Mutex<JsonlInner>,
}

impl JsonlStore {
    /// Open (or create) a store rooted at `base_dir`, replaying any
    /// existing log to rebuild the version index.
    ///
    /// # Errors
    ///
    /// [`StoreError::Io`] if the directory or log file cannot be accessed;
    /// [`StoreError::Corrupt`] if an existing log line fails to parse --
    /// a data-integrity failure that must not be silently skipped.
    pub fn open(base_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let layout = StreamLayout::new(base_dir);
        layout.ensure()?;
        let path = layout.events_path();

        let mut versions: HashMap<Uuid, u64> = HashMap::new();
        let mut all = Vec::new();
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for (n, line) in reader.lines().enumerate() {
                let line = line?;
                if line.is_empty() {
                    continue;
                }
                let event: StoredEvent = serde_json::from_str(&line).map_err(|e| {
                    StoreError::Corrupt(format!(
                        "{}:{}: {e}",
                        path.display(),
                        n + 1
                    ))
                })?;
                *versions.entry(event.stream_id).or_default() += 1;
                all.push(event);
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        tracing::debug!(
            path = %path.display(),
            events = all.len(),
            streams = versions.len(),
            "event log opened"
        );

        Ok(Self {
            layout,
            inner: Mutex::new(JsonlInner {
                file,
                versions,
                all,
            }),
        })
    }

    /// Returns the on-disk layout this store was opened with.
    pub fn layout(&self) -> &StreamLayout {
        &self.layout
    }
}

#[async_trait]
impl EventStore for JsonlStore {
    async fn append(
        &self,
        stream_id: Uuid,
        expected: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> Result<AppendReceipt, StoreError> {
        let mut inner = self.inner.lock().expect("event log mutex poisoned");

        let current = inner.versions.get(&stream_id).copied().unwrap_or(0);
        if !expected.matches(current) {
            return Err(StoreError::Conflict {
                stream_id,
                expected,
                actual: current,
            });
        }

        let sealed = seal_batch(stream_id, current, inner.all.len() as u64, events);

        // Write all lines, then fsync once for the batch. If any write
        // fails the in-memory index is left untouched, so a partial line
        // at the file tail will surface as Corrupt on the next open
        // rather than as silent divergence.
        let mut buf = Vec::new();
        for event in &sealed {
            serde_json::to_writer(&mut buf, event)
                .map_err(|e| StoreError::Io(std::io::Error::other(e)))?;
            buf.push(b'\n');
        }
        inner.file.write_all(&buf)?;
        inner.file.sync_data()?;

        let new_version = current + sealed.len() as u64;
        inner.versions.insert(stream_id, new_version);
        inner.all.extend(sealed.iter().cloned());

        tracing::debug!(
            %stream_id,
            count = sealed.len(),
            new_version,
            "events appended"
        );

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
            .all
            .iter()
            .filter(|e| e.stream_id == stream_id)
            .skip(from_version as usize)
            .cloned()
            .collect())
    }

    async fn read_all_from(&self, position: u64) -> Result<Vec<StoredEvent>, StoreError> {
        let inner = self.inner.lock().expect("event log mutex poisoned");
        Ok(inner.all.iter().skip(position as usize).cloned().collect())
    }

    async fn stream_version(&self, stream_id: Uuid) -> Result<u64, StoreError> {
        let inner = self.inner.lock().expect("event log mutex poisoned");
        Ok(inner.versions.get(&stream_id).copied().unwrap_or(0))
    }
}
