//! The event model: one shared core with timeline, state and local-echo
//! variants, plus extraction of the relation descriptors an event carries.
//!
//! Events are owned by exactly one room's event index; everything else
//! (timelines, relations) refers to them by id. Local events use their
//! client-generated transaction id as identity until the server-confirmed
//! event id replaces it.

use ruma::{OwnedEventId, OwnedUserId};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::api::RawEvent;

/// Lifecycle of a locally-originated event awaiting confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalStatus {
    Sending,
    Sent,
    Errored,
}

/// Variant-specific data attached to the shared event core.
#[derive(Debug, Clone)]
pub enum EventKind {
    /// A point-in-time occurrence delivered by the server.
    Timeline,
    /// A (type, state_key)-addressed room configuration event.
    State { state_key: String },
    /// A client-synthesized event shown optimistically before confirmation.
    Local { status: LocalStatus },
}

/// A room event: immutable identity, type, sender, timestamp and an opaque
/// content payload.
#[derive(Debug, Clone)]
pub struct Event {
    id: String,
    event_type: String,
    sender: OwnedUserId,
    origin_server_ts: u64,
    content: JsonValue,
    unsigned: JsonValue,
    redacts: Option<OwnedEventId>,
    kind: EventKind,
}

impl Event {
    pub fn from_raw(raw: RawEvent) -> Self {
        let kind = match raw.state_key {
            Some(state_key) => EventKind::State { state_key },
            None => EventKind::Timeline,
        };
        Event {
            id: raw.event_id.to_string(),
            event_type: raw.event_type,
            sender: raw.sender,
            origin_server_ts: raw.origin_server_ts,
            content: raw.content,
            unsigned: raw.unsigned,
            redacts: raw.redacts,
            kind,
        }
    }

    /// Build a local echo keyed by its transaction id.
    pub fn local(
        transaction_id: &str,
        event_type: &str,
        sender: OwnedUserId,
        content: JsonValue,
        origin_server_ts: u64,
    ) -> Self {
        Event {
            id: transaction_id.to_owned(),
            event_type: event_type.to_owned(),
            sender,
            origin_server_ts,
            content,
            unsigned: JsonValue::Null,
            redacts: None,
            kind: EventKind::Local {
                status: LocalStatus::Sending,
            },
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn sender(&self) -> &OwnedUserId {
        &self.sender
    }

    pub fn origin_server_ts(&self) -> u64 {
        self.origin_server_ts
    }

    pub fn content(&self) -> &JsonValue {
        &self.content
    }

    pub fn unsigned(&self) -> &JsonValue {
        &self.unsigned
    }

    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    pub fn is_state(&self) -> bool {
        matches!(self.kind, EventKind::State { .. })
    }

    pub fn state_key(&self) -> Option<&str> {
        match &self.kind {
            EventKind::State { state_key } => Some(state_key),
            _ => None,
        }
    }

    /// Target of a redaction event. Newer servers put it in `content`.
    pub fn redacts(&self) -> Option<OwnedEventId> {
        if let Some(id) = &self.redacts {
            return Some(id.clone());
        }
        self.content
            .get("redacts")
            .and_then(|v| v.as_str())
            .and_then(|s| s.try_into().ok())
    }

    pub fn local_status(&self) -> Option<LocalStatus> {
        match self.kind {
            EventKind::Local { status } => Some(status),
            _ => None,
        }
    }

    pub(crate) fn set_local_status(&mut self, status: LocalStatus) {
        if let EventKind::Local { status: current } = &mut self.kind {
            *current = status;
        }
    }

    /// Upgrade a local echo into a confirmed event: swap identity for the
    /// server-assigned id and leave the local lifecycle behind.
    pub(crate) fn confirm(&mut self, event_id: &str, origin_server_ts: u64, unsigned: JsonValue) {
        self.id = event_id.to_owned();
        self.origin_server_ts = origin_server_ts;
        self.unsigned = unsigned;
        self.kind = EventKind::Timeline;
    }

    /// Convert back to the wire shape for persistence. Local echoes have no
    /// server-assigned id yet and cannot be represented.
    pub fn to_raw(&self) -> Option<RawEvent> {
        let event_id: OwnedEventId = self.id.as_str().try_into().ok()?;
        Some(RawEvent {
            event_id,
            event_type: self.event_type.clone(),
            sender: self.sender.clone(),
            content: self.content.clone(),
            unsigned: self.unsigned.clone(),
            origin_server_ts: self.origin_server_ts,
            state_key: self.state_key().map(str::to_owned),
            redacts: self.redacts.clone(),
        })
    }

    /// Outgoing relation descriptors carried in this event's content.
    pub fn relations(&self) -> Vec<RelationDescriptor> {
        let Some(relates) = self.content.get("m.relates_to") else {
            return Vec::new();
        };
        let mut out = Vec::new();

        if let Some(reply) = relates.get("m.in_reply_to") {
            if let Some(target) = reply.get("event_id").and_then(|v| v.as_str()) {
                out.push(RelationDescriptor {
                    target: target.to_owned(),
                    kind: RelationKind::Reply,
                    fallback: relates
                        .get("is_falling_back")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false),
                });
            }
        }

        if let Some(rel_type) = relates.get("rel_type").and_then(|v| v.as_str()) {
            let Some(target) = relates.get("event_id").and_then(|v| v.as_str()) else {
                debug!(event = %self.id, rel_type, "relation without target, skipping");
                return out;
            };
            match rel_type {
                "m.replace" => out.push(RelationDescriptor {
                    target: target.to_owned(),
                    kind: RelationKind::Replace,
                    fallback: false,
                }),
                "m.annotation" => match relates.get("key").and_then(|v| v.as_str()) {
                    Some(key) => out.push(RelationDescriptor {
                        target: target.to_owned(),
                        kind: RelationKind::Annotation(key.to_owned()),
                        fallback: false,
                    }),
                    None => debug!(event = %self.id, "annotation without key, skipping"),
                },
                other => debug!(event = %self.id, rel_type = other, "unhandled relation kind"),
            }
        }

        out
    }

    /// Whether this event is the payload of an edit rather than a message in
    /// its own right.
    pub fn is_edit_payload(&self) -> bool {
        self.content
            .get("m.relates_to")
            .and_then(|r| r.get("rel_type"))
            .and_then(|v| v.as_str())
            == Some("m.replace")
    }
}

/// Relation kinds the engine resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationKind {
    /// An edit. The related content replaces the target's rendered content.
    Replace,
    /// A reaction, aggregated under its key.
    Annotation(String),
    /// A rich reply.
    Reply,
}

/// A directed relation extracted from an event's content, pointing at a
/// target that may not have arrived yet.
#[derive(Debug, Clone)]
pub struct RelationDescriptor {
    pub target: String,
    pub kind: RelationKind,
    pub fallback: bool,
}

/// Ephemeral room event (typing notification, read receipt). Broadcast to
/// subscribers and never stored.
#[derive(Debug, Clone)]
pub struct EphemeralEvent {
    pub event_type: String,
    pub content: JsonValue,
}
