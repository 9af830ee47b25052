//! Membership roster derived from `m.room.member` state events.
//!
//! Queries by membership value are sorted by (descending power, ascending
//! display name) and cached per membership value. A member event drops the
//! cache entries for the member's previous and new membership; a
//! power-levels change drops every entry, since power participates in the
//! sort.

use std::collections::HashMap;

use ruma::{OwnedUserId, UserId};
use tracing::warn;

use crate::event::Event;
use crate::power::PowerLevels;

/// A user as seen through a room's member event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub user_id: OwnedUserId,
    pub membership: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

impl Member {
    fn from_event(user_id: OwnedUserId, event: &Event) -> Self {
        let content = event.content();
        Member {
            user_id,
            membership: content
                .get("membership")
                .and_then(|v| v.as_str())
                .unwrap_or("leave")
                .to_owned(),
            display_name: content
                .get("displayname")
                .and_then(|v| v.as_str())
                .map(str::to_owned),
            avatar_url: content
                .get("avatar_url")
                .and_then(|v| v.as_str())
                .map(str::to_owned),
        }
    }

    /// Sort key for the roster: display name, falling back to the user id.
    fn name_key(&self) -> &str {
        self.display_name.as_deref().unwrap_or(self.user_id.as_str())
    }
}

#[derive(Debug, Default)]
pub struct MemberRoster {
    members: HashMap<OwnedUserId, Member>,
    sorted: HashMap<String, Vec<Member>>,
}

impl MemberRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an `m.room.member` state event.
    pub fn handle(&mut self, event: &Event) {
        debug_assert_eq!(event.event_type(), "m.room.member");
        let Some(state_key) = event.state_key() else {
            warn!(event = %event.id(), "member event without state key");
            return;
        };
        let user_id: OwnedUserId = match state_key.try_into() {
            Ok(user_id) => user_id,
            Err(err) => {
                warn!(event = %event.id(), %err, "member event with invalid user id");
                return;
            }
        };

        let member = Member::from_event(user_id.clone(), event);

        self.sorted.remove(&member.membership);
        if let Some(previous) = self.members.get(&user_id) {
            self.sorted.remove(&previous.membership);
        }
        if let Some(prev_membership) = event
            .unsigned()
            .get("prev_content")
            .and_then(|c| c.get("membership"))
            .and_then(|v| v.as_str())
        {
            self.sorted.remove(prev_membership);
        }

        self.members.insert(user_id, member);
    }

    pub fn get(&self, user_id: &UserId) -> Option<&Member> {
        self.members.get(user_id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members with the given membership value, sorted by descending power
    /// and ascending name. The result is cached until invalidated.
    pub fn with_membership(&mut self, membership: &str, power: &PowerLevels) -> Vec<Member> {
        if let Some(cached) = self.sorted.get(membership) {
            return cached.clone();
        }
        let mut members: Vec<Member> = self
            .members
            .values()
            .filter(|m| m.membership == membership)
            .cloned()
            .collect();
        members.sort_by(|a, b| {
            power
                .for_user(&b.user_id)
                .cmp(&power.for_user(&a.user_id))
                .then_with(|| a.name_key().cmp(b.name_key()))
        });
        self.sorted.insert(membership.to_owned(), members.clone());
        members
    }

    /// Drop every cached sort. Called when power levels change.
    pub fn invalidate_sorting(&mut self) {
        self.sorted.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RawEvent;
    use serde_json::json;
    use test_log::test;

    fn member_event(user: &str, membership: &str, name: Option<&str>) -> Event {
        let mut content = json!({ "membership": membership });
        if let Some(name) = name {
            content["displayname"] = json!(name);
        }
        Event::from_raw(
            serde_json::from_value::<RawEvent>(json!({
                "event_id": format!("$m-{user}-{membership}"),
                "type": "m.room.member",
                "sender": user,
                "state_key": user,
                "content": content,
            }))
            .unwrap(),
        )
    }

    fn power(users: serde_json::Value) -> PowerLevels {
        PowerLevels::from_content(&json!({ "users": users, "users_default": 0 }))
    }

    #[test]
    fn sorts_by_power_then_name() {
        let mut roster = MemberRoster::new();
        roster.handle(&member_event("@u2:example.org", "join", Some("beta")));
        roster.handle(&member_event("@u1:example.org", "join", Some("zeta")));
        roster.handle(&member_event("@u3:example.org", "join", Some("alpha")));

        let levels = power(json!({ "@u1:example.org": 100 }));
        let joined = roster.with_membership("join", &levels);
        let ids: Vec<&str> = joined.iter().map(|m| m.user_id.as_str()).collect();
        // u1 first on power, then alpha before beta on name
        assert_eq!(
            ids,
            ["@u1:example.org", "@u3:example.org", "@u2:example.org"]
        );
    }

    #[test]
    fn membership_change_invalidates_both_buckets() {
        let mut roster = MemberRoster::new();
        roster.handle(&member_event("@a:example.org", "join", None));
        roster.handle(&member_event("@b:example.org", "join", None));
        let levels = power(json!({}));

        assert_eq!(roster.with_membership("join", &levels).len(), 2);
        assert_eq!(roster.with_membership("leave", &levels).len(), 0);

        roster.handle(&member_event("@b:example.org", "leave", None));
        assert_eq!(roster.with_membership("join", &levels).len(), 1);
        assert_eq!(roster.with_membership("leave", &levels).len(), 1);
    }

    #[test]
    fn missing_display_name_falls_back_to_user_id() {
        let mut roster = MemberRoster::new();
        roster.handle(&member_event("@b:example.org", "join", None));
        roster.handle(&member_event("@a:example.org", "join", None));

        let levels = power(json!({}));
        let joined = roster.with_membership("join", &levels);
        assert_eq!(joined[0].user_id.as_str(), "@a:example.org");
    }

    #[test]
    fn invalid_state_key_is_skipped() {
        let mut roster = MemberRoster::new();
        let event = Event::from_raw(
            serde_json::from_value::<RawEvent>(json!({
                "event_id": "$bad",
                "type": "m.room.member",
                "sender": "@a:example.org",
                "state_key": "not a user id",
                "content": { "membership": "join" },
            }))
            .unwrap(),
        );
        roster.handle(&event);
        assert!(roster.is_empty());
    }
}
