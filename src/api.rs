//! Wire types for the client-server API surface the engine consumes.
//!
//! These are plain serde mirrors of the JSON the transport hands us: the
//! incremental sync delta, `/messages` chunks, stripped invite state and the
//! sync filter definition. Optional sections default rather than fail so a
//! sparse delta always deserializes.

use std::collections::HashMap;

use ruma::{OwnedEventId, OwnedRoomId, OwnedUserId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A raw event as it appears in sync deltas and pagination chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    pub event_id: OwnedEventId,
    #[serde(rename = "type")]
    pub event_type: String,
    pub sender: OwnedUserId,
    #[serde(default)]
    pub content: JsonValue,
    #[serde(default, skip_serializing_if = "JsonValue::is_null")]
    pub unsigned: JsonValue,
    #[serde(default)]
    pub origin_server_ts: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacts: Option<OwnedEventId>,
}

impl RawEvent {
    /// Client-generated transaction id echoed back by the server, if any.
    pub fn transaction_id(&self) -> Option<&str> {
        self.unsigned.get("transaction_id").and_then(|v| v.as_str())
    }

    /// Whether the server already marked this event as redacted.
    pub fn is_redacted(&self) -> bool {
        self.unsigned.get("redacted_because").is_some()
    }
}

/// Stripped state event carried in invite sections. No event id, no unsigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrippedState {
    #[serde(rename = "type")]
    pub event_type: String,
    pub sender: OwnedUserId,
    pub state_key: String,
    #[serde(default)]
    pub content: JsonValue,
}

/// An account data entry, global or per room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountDataEvent {
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default)]
    pub content: JsonValue,
}

/// Ephemeral event (typing, receipts). Surfaced to subscribers, never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEphemeralEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub content: JsonValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBatch<T> {
    #[serde(default = "Vec::new")]
    pub events: Vec<T>,
}

// Derived Default would demand T: Default, which the event types do not have.
impl<T> Default for EventBatch<T> {
    fn default() -> Self {
        EventBatch { events: Vec::new() }
    }
}

/// Timeline section of a joined-room delta.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimelineBatch {
    #[serde(default)]
    pub events: Vec<RawEvent>,
    #[serde(default)]
    pub limited: bool,
    #[serde(default)]
    pub prev_batch: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadNotifications {
    #[serde(default)]
    pub notification_count: u64,
    #[serde(default)]
    pub highlight_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomSummary {
    #[serde(rename = "m.heroes", default)]
    pub heroes: Vec<OwnedUserId>,
    #[serde(rename = "m.joined_member_count", default)]
    pub joined_member_count: Option<u64>,
    #[serde(rename = "m.invited_member_count", default)]
    pub invited_member_count: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinedRoomUpdate {
    #[serde(default)]
    pub state: Option<EventBatch<RawEvent>>,
    #[serde(default)]
    pub timeline: Option<TimelineBatch>,
    #[serde(default)]
    pub account_data: Option<EventBatch<AccountDataEvent>>,
    #[serde(default)]
    pub ephemeral: Option<EventBatch<RawEphemeralEvent>>,
    #[serde(default)]
    pub unread_notifications: Option<UnreadNotifications>,
    #[serde(default)]
    pub summary: Option<RoomSummary>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvitedRoomUpdate {
    #[serde(default)]
    pub invite_state: EventBatch<StrippedState>,
}

/// Left-room section. The engine only cares that the key is present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeftRoomUpdate {
    #[serde(default)]
    pub state: Option<EventBatch<RawEvent>>,
    #[serde(default)]
    pub timeline: Option<TimelineBatch>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomUpdates {
    #[serde(default)]
    pub join: HashMap<OwnedRoomId, JoinedRoomUpdate>,
    #[serde(default)]
    pub invite: HashMap<OwnedRoomId, InvitedRoomUpdate>,
    #[serde(default)]
    pub leave: HashMap<OwnedRoomId, LeftRoomUpdate>,
}

/// One incremental sync delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    pub next_batch: String,
    #[serde(default)]
    pub account_data: Option<EventBatch<AccountDataEvent>>,
    #[serde(default)]
    pub rooms: Option<RoomUpdates>,
}

/// Response to a `/messages` pagination request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagesResponse {
    #[serde(default)]
    pub start: Option<String>,
    /// Token for the next page in the requested direction. Absent when the
    /// server has no more history that way.
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub chunk: Vec<RawEvent>,
    #[serde(default)]
    pub state: Vec<RawEvent>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MembersResponse {
    #[serde(default)]
    pub chunk: Vec<RawEvent>,
}

/// Sync filter uploaded once before the first long poll.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<RoomFilter>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<RoomEventFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeline: Option<RoomEventFilter>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomEventFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lazy_load_members: Option<bool>,
}

impl FilterDefinition {
    /// The filter the engine registers: lazy-loaded members plus a bounded
    /// per-room timeline chunk.
    pub fn for_sync(timeline_limit: u32) -> Self {
        FilterDefinition {
            room: Some(RoomFilter {
                state: Some(RoomEventFilter {
                    limit: None,
                    lazy_load_members: Some(true),
                }),
                timeline: Some(RoomEventFilter {
                    limit: Some(timeline_limit),
                    lazy_load_members: None,
                }),
            }),
        }
    }
}
