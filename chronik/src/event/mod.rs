//! The append-only event log and its companion types.
//!
//! Events are persisted as [`RawEvent`] rows: a dense `store_index` across
//! the whole log, a dense `stream_index` within each stream, and a JSON body
//! tagged with a `type` discriminator (conventionally `<prefix>:<name>`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

mod codec;
mod publish;
mod store;
mod streamer;

pub use codec::{Codec, CodecMember, CodecUnion, EventBody};
pub use publish::StreamUpdateSubscription;
pub use store::EventLog;
pub use streamer::{EventPages, FollowedEvents, Streamer};

/// The unique identifier of an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Creates a fresh random id.
    pub fn make() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true for the unassigned id.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for EventId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for EventId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The id of a logical event stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

/// The name of the virtual stream addressing the whole log in read APIs.
/// It is not a value a producer may assign on write.
pub const STREAM_ID_ALL: &str = "$all";

impl StreamId {
    /// The virtual stream addressing the whole log.
    pub fn all() -> Self {
        Self(STREAM_ID_ALL.to_string())
    }

    /// Returns true if this is the whole-log stream.
    pub fn is_all(&self) -> bool {
        self.0 == STREAM_ID_ALL
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true for the empty id.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for StreamId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The persisted unit of the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    /// The unique id of the event; assigned on encode if absent.
    #[serde(default, skip_serializing_if = "EventId::is_empty")]
    pub id: EventId,
    /// The index of the event within the whole store.
    #[serde(rename = "store-index", default)]
    pub store_index: u64,
    /// The id of the stream this event belongs to.
    #[serde(rename = "stream-id", default, skip_serializing_if = "StreamId::is_empty")]
    pub stream_id: StreamId,
    /// The index of the event within its stream.
    #[serde(rename = "stream-index", default)]
    pub stream_index: u64,
    /// The time the log accepted the event.
    #[serde(rename = "recorded-on", default)]
    pub recorded_on: DateTime<Utc>,
    /// The domain time supplied by the producer.
    #[serde(rename = "occurred-on", default)]
    pub occurred_on: DateTime<Utc>,
    /// The type discriminator, conventionally `<prefix>:<name>`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// The JSON-encoded domain event body.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl RawEvent {
    /// Builds an event carrying only type, body and domain time; log
    /// positions are assigned on append.
    pub fn new(event_type: impl Into<String>, occurred_on: DateTime<Utc>, data: Value) -> Self {
        Self {
            id: EventId::make(),
            store_index: 0,
            stream_id: StreamId::default(),
            stream_index: 0,
            recorded_on: DateTime::<Utc>::default(),
            occurred_on,
            event_type: event_type.into(),
            data,
        }
    }
}

/// Filters of an event log query.
#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    /// Restrict to one stream; `None` or the `"$all"` stream means no filter.
    pub stream_id: Option<StreamId>,
    /// Only events whose domain time is at or before this instant.
    pub to_date: Option<DateTime<Utc>>,
    /// Restrict to one exact type discriminator.
    pub event_type: Option<String>,
    /// Sort ascending by `store_index` when true, descending otherwise.
    pub sort_asc: bool,
}
