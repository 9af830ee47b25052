//! Power level snapshot derived from the `m.room.power_levels` state event.
//!
//! The snapshot is immutable; the room caches it behind an `Arc` and drops
//! the cache whenever the power levels state changes, so readers always see
//! a whole, consistent object.

use std::collections::HashMap;

use ruma::{OwnedUserId, UserId};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::warn;

fn default_fifty() -> i64 {
    50
}

#[derive(Debug, Clone, Deserialize)]
struct PowerLevelsContent {
    #[serde(default)]
    users: HashMap<OwnedUserId, i64>,
    #[serde(default)]
    users_default: i64,
    #[serde(default)]
    events: HashMap<String, i64>,
    #[serde(default)]
    events_default: i64,
    #[serde(default = "default_fifty")]
    state_default: i64,
    #[serde(default = "default_fifty")]
    redact: i64,
    #[serde(default)]
    invite: i64,
    #[serde(default = "default_fifty")]
    kick: i64,
    #[serde(default = "default_fifty")]
    ban: i64,
}

// Has to match the serde defaults above; the derived impl would zero the
// action thresholds.
impl Default for PowerLevelsContent {
    fn default() -> Self {
        PowerLevelsContent {
            users: HashMap::new(),
            users_default: 0,
            events: HashMap::new(),
            events_default: 0,
            state_default: default_fifty(),
            redact: default_fifty(),
            invite: 0,
            kick: default_fifty(),
            ban: default_fifty(),
        }
    }
}

/// Per-user and per-action permission thresholds for a room.
#[derive(Debug, Clone)]
pub struct PowerLevels {
    content: PowerLevelsContent,
}

impl PowerLevels {
    /// Parse a snapshot out of a power-levels state event's content. An
    /// unparseable payload degrades to the defaults rather than failing,
    /// since the client must stay live with whatever the room carries.
    pub fn from_content(content: &JsonValue) -> Self {
        let parsed = match serde_json::from_value(content.clone()) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(%err, "unparseable power levels content, using defaults");
                PowerLevelsContent::default()
            }
        };
        PowerLevels { content: parsed }
    }

    /// The snapshot used when a room has no power-levels event at all: the
    /// room creator gets full power, everyone else the defaults.
    pub fn synthesized(creator: Option<&UserId>) -> Self {
        let mut content = PowerLevelsContent::default();
        if let Some(creator) = creator {
            content.users.insert(creator.to_owned(), 100);
        }
        PowerLevels { content }
    }

    pub fn for_user(&self, user_id: &UserId) -> i64 {
        self.content
            .users
            .get(user_id)
            .copied()
            .unwrap_or(self.content.users_default)
    }

    pub fn for_event(&self, event_type: &str) -> i64 {
        self.content
            .events
            .get(event_type)
            .copied()
            .unwrap_or(self.content.events_default)
    }

    pub fn for_state(&self, event_type: &str) -> i64 {
        self.content
            .events
            .get(event_type)
            .copied()
            .unwrap_or(self.content.state_default)
    }

    pub fn users_default(&self) -> i64 {
        self.content.users_default
    }

    pub fn redact(&self) -> i64 {
        self.content.redact
    }

    pub fn invite(&self) -> i64 {
        self.content.invite
    }

    pub fn kick(&self) -> i64 {
        self.content.kick
    }

    pub fn ban(&self) -> i64 {
        self.content.ban
    }

    pub fn can_send_event(&self, user_id: &UserId, event_type: &str) -> bool {
        self.for_user(user_id) >= self.for_event(event_type)
    }

    pub fn can_send_state(&self, user_id: &UserId, event_type: &str) -> bool {
        self.for_user(user_id) >= self.for_state(event_type)
    }

    pub fn can_redact(&self, user_id: &UserId) -> bool {
        self.for_user(user_id) >= self.redact()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ruma::user_id;
    use serde_json::json;
    use test_log::test;

    #[test]
    fn parses_user_and_action_levels() {
        let levels = PowerLevels::from_content(&json!({
            "users": { "@admin:example.org": 100, "@mod:example.org": 50 },
            "users_default": 0,
            "events": { "m.room.name": 75 },
            "events_default": 0,
            "state_default": 50,
            "redact": 50,
            "invite": 25
        }));

        assert_eq!(levels.for_user(user_id!("@admin:example.org")), 100);
        assert_eq!(levels.for_user(user_id!("@random:example.org")), 0);
        assert_eq!(levels.for_state("m.room.name"), 75);
        assert_eq!(levels.for_state("m.room.topic"), 50);
        assert_eq!(levels.for_event("m.room.message"), 0);
        assert_eq!(levels.invite(), 25);

        assert!(levels.can_send_state(user_id!("@mod:example.org"), "m.room.topic"));
        assert!(!levels.can_send_state(user_id!("@mod:example.org"), "m.room.name"));
        assert!(levels.can_redact(user_id!("@admin:example.org")));
    }

    #[test]
    fn synthesized_default_grants_creator_full_power() {
        let levels = PowerLevels::synthesized(Some(user_id!("@creator:example.org")));
        assert_eq!(levels.for_user(user_id!("@creator:example.org")), 100);
        assert_eq!(levels.for_user(user_id!("@other:example.org")), 0);
        assert_eq!(levels.for_state("m.room.name"), 50);
        assert!(!levels.can_redact(user_id!("@other:example.org")));
        assert!(!levels.can_send_state(user_id!("@other:example.org"), "m.room.name"));
        assert!(levels.can_redact(user_id!("@creator:example.org")));
    }

    #[test]
    fn garbage_content_degrades_to_defaults() {
        let levels = PowerLevels::from_content(&json!({ "users": "not a map" }));
        assert_eq!(levels.for_user(user_id!("@anyone:example.org")), 0);
        assert_eq!(levels.ban(), 50);
    }
}
