//! Aggregate snapshot persistence.
//!
//! Snapshots are a pure optimization for the executor's load path: state at
//! a known stream version, so a command only replays the events after that
//! version instead of the whole stream. The event log stays the source of
//! truth; a missing, stale, or corrupt snapshot is recovered from by full
//! replay, never by failing the command.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::aggregate::Aggregate;

/// Aggregate state captured at a specific stream version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot<A> {
    /// The folded aggregate state.
    pub state: A,
    /// The stream version the state was folded up to.
    pub stream_version: u64,
}

/// File-backed snapshot storage, one JSON file per aggregate instance.
///
/// Files live at `<dir>/<aggregate_type>/<instance_id>/snapshot.json` and
/// are replaced atomically (write to a temp file, then rename), so a crash
/// mid-save leaves the previous snapshot intact.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// Create a store rooted at the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn instance_dir(&self, aggregate_type: &str, instance_id: &str) -> PathBuf {
        self.dir.join(aggregate_type).join(instance_id)
    }

    fn snapshot_path(&self, aggregate_type: &str, instance_id: &str) -> PathBuf {
        self.instance_dir(aggregate_type, instance_id)
            .join("snapshot.json")
    }

    /// Load the snapshot for an aggregate instance, if one exists.
    ///
    /// A missing file yields `None`. A file that cannot be read or parsed
    /// also yields `None` after logging a warning; the caller falls back to
    /// replaying the full stream.
    pub fn load<A: Aggregate>(&self, instance_id: &str) -> Option<Snapshot<A>> {
        let path = self.snapshot_path(A::AGGREGATE_TYPE, instance_id);
        if !path.exists() {
            return None;
        }
        match read_snapshot(&path) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "unreadable snapshot ignored, falling back to full replay"
                );
                None
            }
        }
    }

    /// Persist a snapshot for an aggregate instance, atomically replacing
    /// any previous one.
    pub fn save<A: Aggregate>(
        &self,
        instance_id: &str,
        snapshot: &Snapshot<A>,
    ) -> std::io::Result<()> {
        let dir = self.instance_dir(A::AGGREGATE_TYPE, instance_id);
        std::fs::create_dir_all(&dir)?;

        let tmp = dir.join("snapshot.json.tmp");
        let json = serde_json::to_vec_pretty(snapshot).map_err(std::io::Error::other)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, dir.join("snapshot.json"))?;
        Ok(())
    }
}

fn read_snapshot<A: Aggregate>(path: &Path) -> std::io::Result<Snapshot<A>> {
    let bytes = std::fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(std::io::Error::other)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::aggregate::test_fixtures::{Account, AccountStatus};

    fn active(email: &str) -> Account {
        Account {
            status: AccountStatus::Active,
            email: Some(email.to_string()),
            display_name: None,
        }
    }

    #[test]
    fn save_then_load_roundtrips() {
        let tmp = TempDir::new().expect("temp dir");
        let store = SnapshotStore::new(tmp.path());

        store
            .save::<Account>(
                "u-1",
                &Snapshot {
                    state: active("a@x.com"),
                    stream_version: 3,
                },
            )
            .expect("save should succeed");

        let loaded = store
            .load::<Account>("u-1")
            .expect("snapshot should be present");
        assert_eq!(loaded.stream_version, 3);
        assert_eq!(loaded.state.email.as_deref(), Some("a@x.com"));
    }

    #[test]
    fn load_missing_snapshot_is_none() {
        let tmp = TempDir::new().expect("temp dir");
        let store = SnapshotStore::new(tmp.path());
        assert!(store.load::<Account>("ghost").is_none());
    }

    #[test]
    fn save_replaces_previous_snapshot() {
        let tmp = TempDir::new().expect("temp dir");
        let store = SnapshotStore::new(tmp.path());

        store
            .save::<Account>(
                "u-1",
                &Snapshot {
                    state: active("a@x.com"),
                    stream_version: 1,
                },
            )
            .expect("first save should succeed");
        let inactive = Account {
            status: AccountStatus::Inactive,
            ..active("a@x.com")
        };
        store
            .save::<Account>(
                "u-1",
                &Snapshot {
                    state: inactive,
                    stream_version: 2,
                },
            )
            .expect("second save should succeed");

        let loaded = store
            .load::<Account>("u-1")
            .expect("snapshot should be present");
        assert_eq!(loaded.stream_version, 2);
        assert_eq!(loaded.state.status, AccountStatus::Inactive);
    }

    #[test]
    fn corrupt_snapshot_is_ignored() {
        let tmp = TempDir::new().expect("temp dir");
        let store = SnapshotStore::new(tmp.path());

        let dir = tmp.path().join("account").join("u-1");
        std::fs::create_dir_all(&dir).expect("create dirs");
        std::fs::write(dir.join("snapshot.json"), b"{ not json").expect("write garbage");

        assert!(
            store.load::<Account>("u-1").is_none(),
            "corrupt snapshot must fall back to full replay"
        );
    }

    #[test]
    fn instances_do_not_collide() {
        let tmp = TempDir::new().expect("temp dir");
        let store = SnapshotStore::new(tmp.path());

        store
            .save::<Account>(
                "u-1",
                &Snapshot {
                    state: active("a@x.com"),
                    stream_version: 1,
                },
            )
            .expect("save u-1 should succeed");
        store
            .save::<Account>(
                "u-2",
                &Snapshot {
                    state: active("b@x.com"),
                    stream_version: 5,
                },
            )
            .expect("save u-2 should succeed");

        let one = store.load::<Account>("u-1").expect("u-1 present");
        let two = store.load::<Account>("u-2").expect("u-2 present");
        assert_eq!(one.state.email.as_deref(), Some("a@x.com"));
        assert_eq!(two.stream_version, 5);
    }
}
