//! Per-room event index and relation graph.
//!
//! Every event a room knows about lives in this arena, keyed by id. A
//! relation extracted from an event is attached bidirectionally the moment
//! both endpoints are indexed: once as "outgoing" on the source and once as
//! "incoming" on the target, so either side resolves in O(1). Relations
//! whose target has not arrived yet wait in a pending queue keyed by target
//! id and are drained when the target is indexed, which makes delivery
//! order irrelevant.
//!
//! Two derived views are cached per entry and invalidated by attachment and
//! detachment: the rendered content (latest valid edit wins, and an edit is
//! only valid when it comes from the original sender) and the reaction
//! aggregation (incoming annotations grouped by key).

use std::collections::{BTreeMap, HashMap};

use ruma::OwnedUserId;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::event::{Event, LocalStatus, RelationKind};

/// A resolved directed edge between two indexed events.
#[derive(Debug, Clone)]
pub struct Relation {
    pub source: String,
    pub target: String,
    pub kind: RelationKind,
    pub fallback: bool,
}

#[derive(Debug)]
struct EventEntry {
    event: Event,
    relations_out: Vec<Relation>,
    relations_in: Vec<Relation>,
    /// Cached rendered content; `None` means recompute on next read.
    rendered: Option<JsonValue>,
    /// Cached reaction aggregation keyed by annotation key.
    reactions: Option<BTreeMap<String, Vec<OwnedUserId>>>,
}

impl EventEntry {
    fn new(event: Event) -> Self {
        EventEntry {
            event,
            relations_out: Vec::new(),
            relations_in: Vec::new(),
            rendered: None,
            reactions: None,
        }
    }
}

/// The event arena plus relation bookkeeping for one room.
#[derive(Debug, Default)]
pub struct EventGraph {
    entries: HashMap<String, EventEntry>,
    /// Relations waiting for their target, keyed by target id.
    pending: HashMap<String, Vec<Relation>>,
}

impl EventGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index an event and resolve its relations in both directions.
    ///
    /// Returns false (and changes nothing) when the id is already indexed;
    /// a duplicate delivery is a data-integrity warning, never an error.
    pub fn insert(&mut self, event: Event, to_front: bool) -> bool {
        let id = event.id().to_owned();
        if self.entries.contains_key(&id) {
            warn!(event = %id, "duplicate event id, skipping");
            return false;
        }

        let descriptors = event.relations();
        self.entries.insert(id.clone(), EventEntry::new(event));

        for descriptor in descriptors {
            let relation = Relation {
                source: id.clone(),
                target: descriptor.target,
                kind: descriptor.kind,
                fallback: descriptor.fallback,
            };
            if self.entries.contains_key(&relation.target) {
                self.attach(relation, to_front);
            } else {
                debug!(source = %id, target = %relation.target, "queueing relation for missing target");
                let queue = self.pending.entry(relation.target.clone()).or_default();
                if to_front {
                    queue.insert(0, relation);
                } else {
                    queue.push(relation);
                }
            }
        }

        if let Some(queued) = self.pending.remove(&id) {
            for relation in queued {
                self.attach(relation, false);
            }
        }

        true
    }

    /// Attach a relation to both endpoints. Both must be indexed.
    fn attach(&mut self, relation: Relation, to_front: bool) {
        match &relation.kind {
            RelationKind::Replace => {
                let same_sender = match (
                    self.entries.get(&relation.source),
                    self.entries.get(&relation.target),
                ) {
                    (Some(source), Some(target)) => {
                        source.event.sender() == target.event.sender()
                    }
                    _ => false,
                };
                // A spoofed edit never touches the rendered cache.
                if same_sender {
                    if let Some(target) = self.entries.get_mut(&relation.target) {
                        target.rendered = None;
                    }
                }
            }
            RelationKind::Annotation(_) => {
                if let Some(target) = self.entries.get_mut(&relation.target) {
                    target.reactions = None;
                }
            }
            RelationKind::Reply => {}
        }

        if let Some(source) = self.entries.get_mut(&relation.source) {
            if to_front {
                source.relations_out.insert(0, relation.clone());
            } else {
                source.relations_out.push(relation.clone());
            }
        }
        if let Some(target) = self.entries.get_mut(&relation.target) {
            if to_front {
                target.relations_in.insert(0, relation);
            } else {
                target.relations_in.push(relation);
            }
        }
    }

    /// Remove an event (redaction), detaching each of its relations from
    /// the partner event and re-invalidating the partner's caches.
    pub fn remove(&mut self, id: &str) -> Option<Event> {
        let entry = self.entries.remove(id)?;

        for relation in &entry.relations_out {
            if let Some(target) = self.entries.get_mut(&relation.target) {
                let before = target.relations_in.len();
                target.relations_in.retain(|r| r.source != id);
                if target.relations_in.len() == before {
                    warn!(source = %id, target = %relation.target, "missing incoming half of relation");
                }
                match &relation.kind {
                    RelationKind::Replace => target.rendered = None,
                    RelationKind::Annotation(_) => target.reactions = None,
                    RelationKind::Reply => {}
                }
            }
        }

        for relation in &entry.relations_in {
            if let Some(source) = self.entries.get_mut(&relation.source) {
                source.relations_out.retain(|r| r.target != id);
            }
        }

        // Anything still queued from this event can never attach.
        for queue in self.pending.values_mut() {
            queue.retain(|r| r.source != id);
        }
        self.pending.retain(|_, queue| !queue.is_empty());
        self.pending.remove(id);

        Some(entry.event)
    }

    /// Re-key a local echo under its server-confirmed id, preserving every
    /// relation already attached to it.
    pub fn confirm_local(
        &mut self,
        transaction_id: &str,
        event_id: &str,
        origin_server_ts: u64,
        unsigned: JsonValue,
    ) -> bool {
        if self.entries.contains_key(event_id) {
            warn!(event = %event_id, "confirmed id already indexed, dropping local echo");
            self.remove(transaction_id);
            return false;
        }
        let Some(mut entry) = self.entries.remove(transaction_id) else {
            return false;
        };

        entry.event.confirm(event_id, origin_server_ts, unsigned);

        let out_targets: Vec<String> =
            entry.relations_out.iter().map(|r| r.target.clone()).collect();
        let in_sources: Vec<String> =
            entry.relations_in.iter().map(|r| r.source.clone()).collect();

        for relation in &mut entry.relations_out {
            relation.source = event_id.to_owned();
        }
        for relation in &mut entry.relations_in {
            relation.target = event_id.to_owned();
        }
        for target in out_targets {
            if let Some(partner) = self.entries.get_mut(&target) {
                for relation in &mut partner.relations_in {
                    if relation.source == transaction_id {
                        relation.source = event_id.to_owned();
                    }
                }
            }
        }
        for source in in_sources {
            if let Some(partner) = self.entries.get_mut(&source) {
                for relation in &mut partner.relations_out {
                    if relation.target == transaction_id {
                        relation.target = event_id.to_owned();
                    }
                }
            }
        }
        for queue in self.pending.values_mut() {
            for relation in queue.iter_mut() {
                if relation.source == transaction_id {
                    relation.source = event_id.to_owned();
                }
            }
        }

        self.entries.insert(event_id.to_owned(), entry);
        true
    }

    pub fn event(&self, id: &str) -> Option<&Event> {
        self.entries.get(id).map(|e| &e.event)
    }

    pub(crate) fn set_local_status(&mut self, id: &str, status: LocalStatus) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) => {
                entry.event.set_local_status(status);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn events(&self) -> impl Iterator<Item = &Event> {
        self.entries.values().map(|e| &e.event)
    }

    pub fn relations_out(&self, id: &str) -> &[Relation] {
        self.entries
            .get(id)
            .map(|e| e.relations_out.as_slice())
            .unwrap_or(&[])
    }

    pub fn relations_in(&self, id: &str) -> &[Relation] {
        self.entries
            .get(id)
            .map(|e| e.relations_in.as_slice())
            .unwrap_or(&[])
    }

    /// Number of relations still waiting for a target.
    pub fn pending_relations(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// Rendered content of an event: the replacement content of the latest
    /// valid edit, or the raw content when no valid edit exists.
    pub fn rendered_content(&mut self, id: &str) -> Option<JsonValue> {
        if let Some(cached) = self.entries.get(id).and_then(|e| e.rendered.clone()) {
            return Some(cached);
        }
        let computed = self.compute_rendered(id)?;
        if let Some(entry) = self.entries.get_mut(id) {
            entry.rendered = Some(computed.clone());
        }
        Some(computed)
    }

    fn compute_rendered(&self, id: &str) -> Option<JsonValue> {
        let entry = self.entries.get(id)?;
        for relation in entry.relations_in.iter().rev() {
            if relation.kind != RelationKind::Replace {
                continue;
            }
            let Some(source) = self.entries.get(&relation.source) else {
                continue;
            };
            if source.event.sender() != entry.event.sender() {
                continue;
            }
            if let Some(new_content) = source.event.content().get("m.new_content") {
                return Some(new_content.clone());
            }
        }
        Some(entry.event.content().clone())
    }

    /// Reaction aggregation for an event: incoming annotations grouped by
    /// key, one entry per sender.
    pub fn reactions(&mut self, id: &str) -> Option<BTreeMap<String, Vec<OwnedUserId>>> {
        if let Some(cached) = self.entries.get(id).and_then(|e| e.reactions.clone()) {
            return Some(cached);
        }
        let computed = self.compute_reactions(id)?;
        if let Some(entry) = self.entries.get_mut(id) {
            entry.reactions = Some(computed.clone());
        }
        Some(computed)
    }

    fn compute_reactions(&self, id: &str) -> Option<BTreeMap<String, Vec<OwnedUserId>>> {
        let entry = self.entries.get(id)?;
        let mut aggregated: BTreeMap<String, Vec<OwnedUserId>> = BTreeMap::new();
        for relation in &entry.relations_in {
            let RelationKind::Annotation(key) = &relation.kind else {
                continue;
            };
            let Some(source) = self.entries.get(&relation.source) else {
                continue;
            };
            let senders = aggregated.entry(key.clone()).or_default();
            if !senders.contains(source.event.sender()) {
                senders.push(source.event.sender().clone());
            }
        }
        Some(aggregated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RawEvent;
    use serde_json::json;
    use test_log::test;

    fn message(id: &str, sender: &str, body: &str) -> Event {
        Event::from_raw(
            serde_json::from_value::<RawEvent>(json!({
                "event_id": id,
                "type": "m.room.message",
                "sender": sender,
                "content": { "body": body },
            }))
            .unwrap(),
        )
    }

    fn edit(id: &str, sender: &str, target: &str, new_body: &str) -> Event {
        Event::from_raw(
            serde_json::from_value::<RawEvent>(json!({
                "event_id": id,
                "type": "m.room.message",
                "sender": sender,
                "content": {
                    "body": format!("* {new_body}"),
                    "m.new_content": { "body": new_body },
                    "m.relates_to": { "rel_type": "m.replace", "event_id": target }
                },
            }))
            .unwrap(),
        )
    }

    fn reaction(id: &str, sender: &str, target: &str, key: &str) -> Event {
        Event::from_raw(
            serde_json::from_value::<RawEvent>(json!({
                "event_id": id,
                "type": "m.reaction",
                "sender": sender,
                "content": {
                    "m.relates_to": { "rel_type": "m.annotation", "event_id": target, "key": key }
                },
            }))
            .unwrap(),
        )
    }

    #[test]
    fn edit_applies_in_either_delivery_order() {
        // original first
        let mut graph = EventGraph::new();
        graph.insert(message("$orig", "@alice:example.org", "helo"), false);
        graph.insert(edit("$edit", "@alice:example.org", "$orig", "hello"), false);
        assert_eq!(
            graph.rendered_content("$orig").unwrap(),
            json!({ "body": "hello" })
        );

        // edit first: queued as pending, drained when the target arrives
        let mut graph = EventGraph::new();
        graph.insert(edit("$edit", "@alice:example.org", "$orig", "hello"), false);
        assert_eq!(graph.pending_relations(), 1);
        graph.insert(message("$orig", "@alice:example.org", "helo"), false);
        assert_eq!(graph.pending_relations(), 0);
        assert_eq!(
            graph.rendered_content("$orig").unwrap(),
            json!({ "body": "hello" })
        );
    }

    #[test]
    fn spoofed_edit_is_ignored() {
        let mut graph = EventGraph::new();
        graph.insert(message("$orig", "@alice:example.org", "mine"), false);
        graph.insert(edit("$evil", "@mallory:example.org", "$orig", "pwned"), false);
        assert_eq!(
            graph.rendered_content("$orig").unwrap(),
            json!({ "body": "mine" })
        );
    }

    #[test]
    fn latest_edit_wins() {
        let mut graph = EventGraph::new();
        graph.insert(message("$orig", "@alice:example.org", "v1"), false);
        graph.insert(edit("$e1", "@alice:example.org", "$orig", "v2"), false);
        graph.insert(edit("$e2", "@alice:example.org", "$orig", "v3"), false);
        assert_eq!(
            graph.rendered_content("$orig").unwrap(),
            json!({ "body": "v3" })
        );
    }

    #[test]
    fn reactions_aggregate_by_key_and_dedupe_senders() {
        let mut graph = EventGraph::new();
        graph.insert(message("$orig", "@alice:example.org", "hi"), false);
        graph.insert(reaction("$r1", "@bob:example.org", "$orig", "👍"), false);
        graph.insert(reaction("$r2", "@carol:example.org", "$orig", "👍"), false);
        graph.insert(reaction("$r3", "@bob:example.org", "$orig", "👍"), false);
        graph.insert(reaction("$r4", "@bob:example.org", "$orig", "🎉"), false);

        let reactions = graph.reactions("$orig").unwrap();
        assert_eq!(reactions["👍"].len(), 2);
        assert_eq!(reactions["🎉"].len(), 1);
    }

    #[test]
    fn relations_are_bidirectional() {
        let mut graph = EventGraph::new();
        graph.insert(message("$orig", "@alice:example.org", "hi"), false);
        graph.insert(reaction("$r1", "@bob:example.org", "$orig", "👍"), false);

        assert_eq!(graph.relations_out("$r1").len(), 1);
        assert_eq!(graph.relations_in("$orig").len(), 1);
        assert_eq!(graph.relations_out("$r1")[0].target, "$orig");
        assert_eq!(graph.relations_in("$orig")[0].source, "$r1");
    }

    #[test]
    fn removing_a_reaction_detaches_and_reaggregates() {
        let mut graph = EventGraph::new();
        graph.insert(message("$orig", "@alice:example.org", "hi"), false);
        graph.insert(reaction("$r1", "@bob:example.org", "$orig", "👍"), false);
        assert_eq!(graph.reactions("$orig").unwrap()["👍"].len(), 1);

        graph.remove("$r1");
        assert!(graph.reactions("$orig").unwrap().is_empty());
        assert!(graph.relations_in("$orig").is_empty());

        // second removal of the same id is a no-op
        assert!(graph.remove("$r1").is_none());
    }

    #[test]
    fn removing_an_edit_reverts_rendered_content() {
        let mut graph = EventGraph::new();
        graph.insert(message("$orig", "@alice:example.org", "raw"), false);
        graph.insert(edit("$edit", "@alice:example.org", "$orig", "edited"), false);
        assert_eq!(
            graph.rendered_content("$orig").unwrap(),
            json!({ "body": "edited" })
        );

        graph.remove("$edit");
        assert_eq!(
            graph.rendered_content("$orig").unwrap(),
            json!({ "body": "raw" })
        );
    }

    #[test]
    fn duplicate_ids_are_skipped() {
        let mut graph = EventGraph::new();
        assert!(graph.insert(message("$orig", "@alice:example.org", "one"), false));
        assert!(!graph.insert(message("$orig", "@alice:example.org", "two"), false));
        assert_eq!(graph.len(), 1);
        assert_eq!(
            graph.event("$orig").unwrap().content(),
            &json!({ "body": "one" })
        );
    }

    #[test]
    fn confirming_a_local_echo_rewrites_relations() {
        let mut graph = EventGraph::new();
        graph.insert(message("$orig", "@me:example.org", "hi"), false);

        let local = Event::local(
            "txn-1",
            "m.room.message",
            ruma::user_id!("@me:example.org").to_owned(),
            json!({
                "body": "* hi there",
                "m.new_content": { "body": "hi there" },
                "m.relates_to": { "rel_type": "m.replace", "event_id": "$orig" }
            }),
            1,
        );
        graph.insert(local, false);
        assert_eq!(
            graph.rendered_content("$orig").unwrap(),
            json!({ "body": "hi there" })
        );

        assert!(graph.confirm_local("txn-1", "$confirmed", 2, JsonValue::Null));
        assert!(!graph.contains("txn-1"));
        assert!(graph.contains("$confirmed"));
        assert_eq!(graph.relations_in("$orig")[0].source, "$confirmed");
        assert_eq!(
            graph.rendered_content("$orig").unwrap(),
            json!({ "body": "hi there" })
        );
    }
}
