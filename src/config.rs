//! Client configuration and timeline visibility policy.

use std::collections::HashSet;
use std::time::Duration;

use ruma::OwnedUserId;

use crate::event::Event;
use crate::retry::RetryPolicy;

/// Which events the visible timeline shows. Hidden events are still indexed
/// and resolved as relations; they just never occupy a timeline slot.
#[derive(Debug, Clone)]
pub struct TimelinePolicy {
    /// Event types excluded from the visible timeline.
    pub hidden_types: HashSet<String>,
    /// Exclude edit payloads, since their content is folded into the target.
    pub hide_edit_fallbacks: bool,
}

impl Default for TimelinePolicy {
    fn default() -> Self {
        let mut hidden_types = HashSet::new();
        hidden_types.insert("m.reaction".to_owned());
        TimelinePolicy {
            hidden_types,
            hide_edit_fallbacks: true,
        }
    }
}

impl TimelinePolicy {
    pub fn is_visible(&self, event: &Event) -> bool {
        if self.hidden_types.contains(event.event_type()) {
            return false;
        }
        if self.hide_edit_fallbacks && event.is_edit_payload() {
            return false;
        }
        true
    }
}

/// Tunables for one client instance.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// The user this client syncs as.
    pub user_id: OwnedUserId,
    /// Long-poll timeout passed to the sync endpoint.
    pub sync_timeout: Duration,
    /// Per-room timeline chunk size requested in the sync filter.
    pub timeline_limit: u32,
    /// Page size for history pagination.
    pub page_limit: u32,
    pub policy: TimelinePolicy,
    pub retry: RetryPolicy,
}

impl ClientConfig {
    pub fn new(user_id: OwnedUserId) -> Self {
        ClientConfig {
            user_id,
            sync_timeout: Duration::from_secs(30),
            timeline_limit: 20,
            page_limit: 50,
            policy: TimelinePolicy::default(),
            retry: RetryPolicy::default(),
        }
    }
}
