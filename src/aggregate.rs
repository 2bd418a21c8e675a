//! Aggregate trait (the pure decide/evolve core) and fold helpers.

use serde::{Serialize, de::DeserializeOwned};

use crate::event::{StoredEvent, decode_domain_event};

/// A domain aggregate whose state is derived from its event history.
///
/// The implementing type itself serves as the aggregate's state; the
/// `Default` value is the "nonexistent" state before any event has been
/// recorded. State is built by folding domain events through
/// [`evolve`](Aggregate::evolve).
///
/// # Associated Types
///
/// - `Command`: the set of commands this aggregate can handle.
/// - `DomainEvent`: the set of events this aggregate can produce and apply.
/// - `Rejection`: the enumerable reasons a command can be refused, covering
///   both input validation failures and business-rule violations.
///
/// # Contract
///
/// - [`decide`](Aggregate::decide) must be a pure decision function: no I/O,
///   no side effects, no wall-clock reads that influence control flow. It
///   validates a command against the current state and returns zero or more
///   events. `Ok(vec![])` is a legal outcome meaning "already satisfied,
///   nothing to record" and is distinct from a rejection.
/// - [`evolve`](Aggregate::evolve) must be a pure, total function. It takes
///   ownership of the current state and a reference to a domain event,
///   returning the next state. Folding the same ordered event list twice
///   always yields the same state.
/// - Illegal status transitions must be rejected, never silently accepted.
pub trait Aggregate:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Identifies this aggregate type (e.g. "account"). Used to derive
    /// stream IDs and snapshot paths.
    const AGGREGATE_TYPE: &'static str;

    /// The set of commands this aggregate can handle.
    type Command: Send + 'static;

    /// The set of events this aggregate can produce and apply.
    ///
    /// Must use adjacently tagged serde (`#[serde(tag = "type", content = "data")]`)
    /// so the event type tag and payload can be stored separately.
    type DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone + 'static;

    /// Enumerable command rejection reasons.
    type Rejection: std::error::Error + Send + Sync + 'static;

    /// Validate a command against the current state and produce events.
    ///
    /// Returns `Ok(vec![])` if the command is a no-op.
    /// Returns `Err` to reject the command.
    fn decide(&self, cmd: Self::Command) -> Result<Vec<Self::DomainEvent>, Self::Rejection>;

    /// Apply a single event to produce the next state.
    fn evolve(self, event: &Self::DomainEvent) -> Self;
}

/// Left-fold an ordered sequence of domain events into a final state.
///
/// `fold(initial, e1 ++ e2)` always equals `fold(fold(initial, e1), e2)`,
/// which is what lets snapshots and incremental catch-up substitute for a
/// full replay.
pub fn fold<'a, A, I>(initial: A, events: I) -> A
where
    A: Aggregate,
    I: IntoIterator<Item = &'a A::DomainEvent>,
    A::DomainEvent: 'a,
{
    events
        .into_iter()
        .fold(initial, |state, event| state.evolve(event))
}

/// Fold raw stored events into aggregate state.
///
/// Each event's payload is decoded via [`decode_domain_event`]; unknown or
/// malformed event types leave the state unchanged. This is the single
/// unknown-event policy for the whole engine.
pub fn fold_stored<A: Aggregate>(initial: A, events: &[StoredEvent]) -> A {
    events.iter().fold(initial, |state, stored| {
        match decode_domain_event::<A>(stored) {
            Some(event) => state.evolve(&event),
            None => state,
        }
    })
}
