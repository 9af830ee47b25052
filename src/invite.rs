//! Pending invites, derived from stripped state.
//!
//! Stripped state carries no event ids and no auth chain, so nothing here is
//! verified; the derived fields exist purely to render the invite. Accepting
//! an invite refetches the full room state from the server.

use ruma::{OwnedRoomId, OwnedUserId, UserId};
use serde_json::Value as JsonValue;

use crate::api::StrippedState;

/// A room the user has been invited to but not yet joined.
#[derive(Debug, Clone)]
pub struct Invite {
    pub room_id: OwnedRoomId,
    pub name: Option<String>,
    pub topic: Option<String>,
    pub avatar_url: Option<String>,
    /// Room type from `m.room.create`, e.g. `m.space`.
    pub kind: Option<String>,
    /// Who sent the invite, from our own member event.
    pub inviter: Option<OwnedUserId>,
    pub is_direct: bool,
    pub state: Vec<StrippedState>,
}

impl Invite {
    pub fn from_stripped_state(
        room_id: OwnedRoomId,
        own_user: &UserId,
        state: Vec<StrippedState>,
    ) -> Self {
        let mut invite = Invite {
            room_id,
            name: None,
            topic: None,
            avatar_url: None,
            kind: None,
            inviter: None,
            is_direct: false,
            state,
        };

        for event in &invite.state {
            match event.event_type.as_str() {
                "m.room.name" => {
                    invite.name = string_field(&event.content, "name");
                }
                "m.room.topic" => {
                    invite.topic = string_field(&event.content, "topic");
                }
                "m.room.avatar" => {
                    invite.avatar_url = string_field(&event.content, "url");
                }
                "m.room.create" => {
                    invite.kind = string_field(&event.content, "type");
                }
                "m.room.member" if event.state_key == own_user.as_str() => {
                    let membership = event.content.get("membership").and_then(|v| v.as_str());
                    if membership == Some("invite") {
                        invite.inviter = Some(event.sender.clone());
                        invite.is_direct = event
                            .content
                            .get("is_direct")
                            .and_then(|v| v.as_bool())
                            .unwrap_or(false);
                    }
                }
                _ => {}
            }
        }

        invite
    }
}

fn string_field(content: &JsonValue, field: &str) -> Option<String> {
    content.get(field).and_then(|v| v.as_str()).map(str::to_owned)
}
