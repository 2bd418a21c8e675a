//! End-to-end tests driving the engine through its public API with a
//! realistic account domain: register, update profile, deactivate.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use foldstream::{
    Aggregate, AggregateStore, CommandContext, CommandOutcome, ExecuteError, JsonlStore,
    MemoryStore, Projection, StoredEvent,
};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

mod account {
    use super::*;

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub enum Status {
        #[default]
        NotExists,
        Active,
        Inactive,
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub struct Account {
        pub status: Status,
        pub email: Option<String>,
        pub display_name: Option<String>,
    }

    #[derive(Debug, Clone)]
    pub enum Command {
        Register { email: String },
        UpdateProfile { display_name: String },
        Deactivate,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    pub enum Event {
        Registered { email: String },
        ProfileUpdated { display_name: String },
        Deactivated,
    }

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum Rejection {
        #[error("email must not be empty")]
        EmptyEmail,
        #[error("account already exists")]
        AlreadyExists,
        #[error("account must be active")]
        NotActive,
    }

    impl Aggregate for Account {
        const AGGREGATE_TYPE: &'static str = "account";
        type Command = Command;
        type DomainEvent = Event;
        type Rejection = Rejection;

        fn decide(&self, cmd: Self::Command) -> Result<Vec<Self::DomainEvent>, Self::Rejection> {
            match cmd {
                Command::Register { email } => {
                    if email.is_empty() {
                        return Err(Rejection::EmptyEmail);
                    }
                    if self.status != Status::NotExists {
                        return Err(Rejection::AlreadyExists);
                    }
                    Ok(vec![Event::Registered { email }])
                }
                Command::UpdateProfile { display_name } => {
                    if self.status != Status::Active {
                        return Err(Rejection::NotActive);
                    }
                    Ok(vec![Event::ProfileUpdated { display_name }])
                }
                Command::Deactivate => match self.status {
                    Status::NotExists => Err(Rejection::NotActive),
                    Status::Active => Ok(vec![Event::Deactivated]),
                    Status::Inactive => Ok(vec![]),
                },
            }
        }

        fn evolve(mut self, event: &Self::DomainEvent) -> Self {
            match event {
                Event::Registered { email } => {
                    self.status = Status::Active;
                    self.email = Some(email.clone());
                }
                Event::ProfileUpdated { display_name } => {
                    self.display_name = Some(display_name.clone());
                }
                Event::Deactivated => {
                    self.status = Status::Inactive;
                }
            }
            self
        }
    }

    /// Directory of active accounts, keyed by instance id so emails can
    /// repeat across accounts. Folded from the whole log.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub struct Directory {
        pub active: std::collections::BTreeMap<String, String>,
    }

    impl Projection for Directory {
        const NAME: &'static str = "account-directory";

        fn apply(&mut self, event: &StoredEvent) {
            let instance = &event.metadata.instance_id;
            match event.event_type.as_str() {
                "Registered" => {
                    if let Some(email) = event.payload["email"].as_str() {
                        self.active.insert(instance.clone(), email.to_string());
                    }
                }
                "Deactivated" => {
                    self.active.remove(instance);
                }
                _ => {}
            }
        }
    }
}

use account::{Account, Command, Event, Rejection, Status};

async fn open_memory() -> AggregateStore {
    AggregateStore::builder()
        .store(MemoryStore::new())
        .open()
        .await
        .expect("open should succeed")
}

fn register(email: &str) -> Command {
    Command::Register {
        email: email.into(),
    }
}

#[tokio::test]
async fn register_then_duplicate_register() {
    init_tracing();
    let store = open_memory().await;

    let outcome = store
        .execute::<Account>("u-1", register("a@x.com"), CommandContext::default())
        .await
        .expect("first register should commit");
    match outcome {
        CommandOutcome::Committed { events, version } => {
            assert_eq!(version, 1);
            assert_eq!(
                events,
                vec![Event::Registered {
                    email: "a@x.com".into()
                }]
            );
        }
        CommandOutcome::NoOp => panic!("first register must commit"),
    }

    let err = store
        .execute::<Account>("u-1", register("b@x.com"), CommandContext::default())
        .await
        .expect_err("second register must be rejected");
    assert!(matches!(err, ExecuteError::Rejected(Rejection::AlreadyExists)));
}

#[tokio::test]
async fn update_profile_on_inactive_account_is_rejected() {
    init_tracing();
    let store = open_memory().await;

    store
        .execute::<Account>("u-1", register("a@x.com"), CommandContext::default())
        .await
        .expect("register should commit");
    store
        .execute::<Account>("u-1", Command::Deactivate, CommandContext::default())
        .await
        .expect("deactivate should commit");

    let err = store
        .execute::<Account>(
            "u-1",
            Command::UpdateProfile {
                display_name: "Ada".into(),
            },
            CommandContext::default(),
        )
        .await
        .expect_err("update on inactive account must be rejected");
    assert!(matches!(err, ExecuteError::Rejected(Rejection::NotActive)));
}

#[tokio::test]
async fn deactivate_twice_is_a_noop_second_time() {
    init_tracing();
    let store = open_memory().await;

    store
        .execute::<Account>("u-1", register("a@x.com"), CommandContext::default())
        .await
        .expect("register should commit");
    store
        .execute::<Account>("u-1", Command::Deactivate, CommandContext::default())
        .await
        .expect("first deactivate should commit");

    let outcome = store
        .execute::<Account>("u-1", Command::Deactivate, CommandContext::default())
        .await
        .expect("second deactivate should succeed");
    assert!(outcome.is_noop(), "repeat deactivate must not write");

    let state = store
        .state::<Account>("u-1")
        .await
        .expect("state should load");
    assert_eq!(state.status, Status::Inactive);
}

#[tokio::test]
async fn concurrent_updates_both_commit_via_retry() {
    init_tracing();
    let store = Arc::new(open_memory().await);

    store
        .execute::<Account>("u-1", register("a@x.com"), CommandContext::default())
        .await
        .expect("register should commit");

    let a = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            store
                .execute::<Account>(
                    "u-1",
                    Command::UpdateProfile {
                        display_name: "Ada".into(),
                    },
                    CommandContext::default(),
                )
                .await
        })
    };
    let b = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            store
                .execute::<Account>(
                    "u-1",
                    Command::UpdateProfile {
                        display_name: "Grace".into(),
                    },
                    CommandContext::default(),
                )
                .await
        })
    };

    a.await
        .expect("task a should not panic")
        .expect("update a should eventually commit");
    b.await
        .expect("task b should not panic")
        .expect("update b should eventually commit");

    // Both updates landed; the log is the arbiter of their order.
    let events = store
        .event_store()
        .read_stream(foldstream::stream_uuid("account", "u-1"), 0)
        .await
        .expect("read should succeed");
    assert_eq!(events.len(), 3);
    assert_eq!(events[1].event_type, "ProfileUpdated");
    assert_eq!(events[2].event_type, "ProfileUpdated");
}

#[tokio::test]
async fn projection_rebuild_matches_incremental_state() {
    init_tracing();
    let store = AggregateStore::builder()
        .store(MemoryStore::new())
        .projection::<account::Directory>()
        .open()
        .await
        .expect("open should succeed");

    for (id, email) in [("u-1", "a@x.com"), ("u-2", "b@x.com"), ("u-3", "c@x.com")] {
        store
            .execute::<Account>(id, register(email), CommandContext::default())
            .await
            .expect("register should commit");
        store
            .catch_up_projection::<account::Directory>()
            .await
            .expect("catch_up should succeed");
    }

    let incremental = store
        .projection_state::<account::Directory>()
        .await
        .expect("projection should be registered");

    store
        .rebuild_projection::<account::Directory>()
        .await
        .expect("rebuild should succeed");
    let rebuilt = store
        .projection_state::<account::Directory>()
        .await
        .expect("projection should be registered");

    assert_eq!(rebuilt, incremental, "rebuild must equal incremental maintenance");
    assert_eq!(rebuilt.active.len(), 3);
}

#[tokio::test]
async fn events_and_state_survive_process_restart() {
    init_tracing();
    let tmp = TempDir::new().expect("temp dir");

    {
        let store = AggregateStore::builder()
            .store(JsonlStore::open(tmp.path()).expect("open log"))
            .open()
            .await
            .expect("open should succeed");
        store
            .execute::<Account>("u-1", register("a@x.com"), CommandContext::default())
            .await
            .expect("register should commit");
        store
            .execute::<Account>(
                "u-1",
                Command::UpdateProfile {
                    display_name: "Ada".into(),
                },
                CommandContext::default(),
            )
            .await
            .expect("update should commit");
    }

    // A fresh process over the same directory sees the same history and
    // keeps the concurrency guard intact.
    let store = AggregateStore::builder()
        .store(JsonlStore::open(tmp.path()).expect("reopen log"))
        .open()
        .await
        .expect("open should succeed");

    let state = store
        .state::<Account>("u-1")
        .await
        .expect("state should load");
    assert_eq!(state.status, Status::Active);
    assert_eq!(state.display_name.as_deref(), Some("Ada"));

    let outcome = store
        .execute::<Account>("u-1", Command::Deactivate, CommandContext::default())
        .await
        .expect("deactivate should commit after restart");
    match outcome {
        CommandOutcome::Committed { version, .. } => assert_eq!(version, 3),
        CommandOutcome::NoOp => panic!("deactivate must commit"),
    }
}

#[tokio::test]
async fn snapshot_accelerated_load_matches_full_replay() {
    init_tracing();
    let tmp = TempDir::new().expect("temp dir");
    let layout = JsonlStore::open(tmp.path())
        .expect("open log")
        .layout()
        .clone();

    {
        let store = AggregateStore::builder()
            .store(JsonlStore::open(tmp.path()).expect("open log"))
            .snapshot_dir(layout.snapshots_dir())
            .open()
            .await
            .expect("open should succeed");
        store
            .execute::<Account>("u-1", register("a@x.com"), CommandContext::default())
            .await
            .expect("register should commit");
        store
            .execute::<Account>(
                "u-1",
                Command::UpdateProfile {
                    display_name: "Ada".into(),
                },
                CommandContext::default(),
            )
            .await
            .expect("update should commit");
    }

    let with_snapshots = AggregateStore::builder()
        .store(JsonlStore::open(tmp.path()).expect("reopen log"))
        .snapshot_dir(layout.snapshots_dir())
        .open()
        .await
        .expect("open should succeed");
    let without_snapshots = AggregateStore::builder()
        .store(JsonlStore::open(tmp.path()).expect("reopen log"))
        .open()
        .await
        .expect("open should succeed");

    let fast = with_snapshots
        .state::<Account>("u-1")
        .await
        .expect("snapshot-accelerated state should load");
    let slow = without_snapshots
        .state::<Account>("u-1")
        .await
        .expect("full-replay state should load");
    assert_eq!(fast, slow, "snapshots are an optimization, never a semantic change");
}

#[tokio::test]
async fn projection_checkpoint_resumes_after_restart() {
    init_tracing();
    let tmp = TempDir::new().expect("temp dir");
    let log_dir = tmp.path().join("log");
    let checkpoint_dir = tmp.path().join("projections");

    {
        let store = AggregateStore::builder()
            .store(JsonlStore::open(&log_dir).expect("open log"))
            .checkpoint_dir(&checkpoint_dir)
            .projection::<account::Directory>()
            .open()
            .await
            .expect("open should succeed");
        store
            .execute::<Account>("u-1", register("a@x.com"), CommandContext::default())
            .await
            .expect("register should commit");
        store
            .catch_up_projection::<account::Directory>()
            .await
            .expect("catch_up should succeed");
    }

    let store = AggregateStore::builder()
        .store(JsonlStore::open(&log_dir).expect("reopen log"))
        .checkpoint_dir(&checkpoint_dir)
        .projection::<account::Directory>()
        .open()
        .await
        .expect("open should succeed");

    // Nothing new happened, so catching up from the checkpoint reads zero
    // events but the state is already there.
    let applied = store
        .catch_up_projection::<account::Directory>()
        .await
        .expect("catch_up should succeed");
    assert_eq!(applied, 0, "checkpoint must prevent re-reading the log");

    let directory = store
        .projection_state::<account::Directory>()
        .await
        .expect("projection should be registered");
    assert_eq!(directory.active.get("u-1").map(String::as_str), Some("a@x.com"));
}
