//! Event encoding, decoding, and the shared stored-event type.
//!
//! This module provides the foundational data types and pure functions that
//! the store backends, executor, and projection modules all depend on. No
//! I/O occurs here.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::Aggregate;
use crate::command::CommandContext;

/// Fixed namespace UUID for deterministic stream ID derivation.
///
/// All stream IDs are UUID v5 values derived from this namespace and the
/// `"{aggregate_type}/{instance_id}"` string, so the same aggregate identity
/// always maps to the same stream UUID regardless of which process performs
/// the mapping.
const STREAM_NAMESPACE: Uuid = Uuid::from_bytes([
    0x9a, 0x1e, 0x7c, 0x3b, 0x4d, 0x2f, 0x4a, 0x8e, 0xb5, 0x6c, 0x1f, 0x3d, 0x7e, 0x9a, 0x0b, 0xc4,
]);

/// Derive a deterministic stream UUID from aggregate type and instance ID.
///
/// # Examples
///
/// ```
/// use foldstream::stream_uuid;
/// let id = stream_uuid("account", "u-1");
/// assert_eq!(id, stream_uuid("account", "u-1")); // deterministic
/// ```
pub fn stream_uuid(aggregate_type: &str, instance_id: &str) -> Uuid {
    let name = format!("{aggregate_type}/{instance_id}");
    Uuid::new_v5(&STREAM_NAMESPACE, name.as_bytes())
}

/// Current wall-clock time as Unix epoch milliseconds.
///
/// Stamped on events by the store at append time. Deciders never read this;
/// timestamps are recorded facts, not decision inputs.
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::UNIX_EPOCH
        .elapsed()
        .expect("system clock is before Unix epoch")
        .as_millis() as u64
}

/// Infrastructure metadata stamped on every event.
///
/// The `aggregate_type` and `instance_id` fields make each event
/// self-describing, so projections and side-effect handlers can recover the
/// aggregate identity without an external registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Aggregate type name (e.g., "account").
    pub aggregate_type: String,
    /// Aggregate instance identifier (e.g., "u-1").
    pub instance_id: String,
    /// Actor identity from the command context, if provided.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Correlation ID from the command context, if provided.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Free-form extra metadata from the command context, if provided.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

/// An event proposed for append, before the store assigns positions.
///
/// Produced by [`encode_domain_event`]. The store turns each proposed event
/// into a [`StoredEvent`] by assigning a stream version, global position,
/// and timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedEvent {
    /// Newly generated UUID v4 event ID.
    pub event_id: Uuid,
    /// Event type tag extracted from the adjacently-tagged domain event.
    pub event_type: String,
    /// JSON payload (the `"data"` portion of the adjacently-tagged enum).
    pub payload: serde_json::Value,
    /// Infrastructure metadata to stamp on the event.
    pub metadata: EventMetadata,
}

/// An immutable, persisted event as delivered to folds, projections, and
/// side-effect handlers.
///
/// Once appended, a stored event is never mutated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Client-assigned event ID.
    pub event_id: Uuid,
    /// Stream UUID (see [`stream_uuid`]).
    pub stream_id: Uuid,
    /// One-based version within the stream: the stream's version after this
    /// event was appended. Strictly increasing by 1, no gaps.
    pub stream_version: u64,
    /// Zero-based position in the global append-order log.
    pub global_position: u64,
    /// Event type tag (e.g., "Registered").
    pub event_type: String,
    /// JSON payload (the domain event data).
    pub payload: serde_json::Value,
    /// Infrastructure metadata (aggregate identity, actor, correlation ID).
    pub metadata: EventMetadata,
    /// Store-assigned timestamp (Unix epoch milliseconds).
    pub recorded_at: u64,
}

/// Encode a domain event into a [`ProposedEvent`] ready for append.
///
/// Serializes the adjacently-tagged domain event
/// (`#[serde(tag = "type", content = "data")]`), extracts the `"type"` and
/// `"data"` fields, builds [`EventMetadata`] from the command context and
/// aggregate identity, and generates a fresh UUID v4 event ID.
///
/// # Errors
///
/// Returns `serde_json::Error` if the domain event cannot be serialized.
pub fn encode_domain_event<A: Aggregate>(
    event: &A::DomainEvent,
    ctx: &CommandContext,
    instance_id: &str,
) -> serde_json::Result<ProposedEvent> {
    // Serialize the adjacently-tagged domain event. This produces JSON like:
    //   {"type": "Deactivated"}                (unit variant)
    //   {"type": "Registered", "data": {...}}  (variant with fields)
    let value = serde_json::to_value(event)?;
    let obj = value
        .as_object()
        .expect("adjacently tagged enum must serialize to a JSON object");

    let event_type = obj["type"]
        .as_str()
        .expect("adjacently tagged enum must have a string 'type' field")
        .to_string();

    // The "data" field is absent for unit variants, so default to null.
    let payload = obj.get("data").cloned().unwrap_or(serde_json::Value::Null);

    let metadata = EventMetadata {
        aggregate_type: A::AGGREGATE_TYPE.to_string(),
        instance_id: instance_id.to_string(),
        actor: ctx.actor.clone(),
        correlation_id: ctx.correlation_id.clone(),
        extra: ctx.metadata.clone(),
    };

    Ok(ProposedEvent {
        event_id: Uuid::new_v4(),
        event_type,
        payload,
        metadata,
    })
}

/// Decode a [`StoredEvent`] back into a typed domain event.
///
/// Reconstructs the adjacently-tagged JSON object from the stored event's
/// `event_type` and `payload` fields and deserializes it. Returns `None` for
/// unknown or malformed event types: the fold policy is to skip them with
/// the state unchanged, providing forward compatibility with new event
/// types.
pub fn decode_domain_event<A: Aggregate>(stored: &StoredEvent) -> Option<A::DomainEvent> {
    let tagged = if stored.payload.is_null() {
        serde_json::json!({ "type": stored.event_type })
    } else {
        serde_json::json!({
            "type": stored.event_type,
            "data": stored.payload,
        })
    };
    serde_json::from_value::<A::DomainEvent>(tagged).ok()
}
