//! A joined room: state store with derived fields, event graph, live
//! timeline, member roster and the local-echo ledger.
//!
//! All mutable room data sits behind one `RwLock`; the lock is never held
//! across an await. Interested-party notifications go out on the client's
//! broadcast channel, so a lagging subscriber can never block sync.
//!
//! Pagination in each direction is coalesced: concurrent callers share one
//! in-flight request through a [`Shared`] future, so at most one `/messages`
//! call per direction is ever outstanding.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use ruma::{OwnedRoomId, OwnedUserId};
use serde_json::Value as JsonValue;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use roomsync_common::Result;

use crate::api::{
    AccountDataEvent, MessagesResponse, RawEvent, RoomSummary, UnreadNotifications,
};
use crate::client::ClientEvent;
use crate::config::TimelinePolicy;
use crate::event::{EphemeralEvent, Event, LocalStatus};
use crate::fetcher::Fetcher;
use crate::graph::EventGraph;
use crate::members::{Member, MemberRoster};
use crate::persist::RoomSnapshot;
use crate::power::PowerLevels;
use crate::timeline::{Direction, Timeline};

/// Fields derived from well-known state events, recomputed on every state
/// change so reads are free.
#[derive(Debug, Clone, Default)]
pub struct RoomMeta {
    pub name: Option<String>,
    pub topic: Option<String>,
    pub avatar_url: Option<String>,
    pub canonical_alias: Option<String>,
    /// Room type from `m.room.create`, e.g. `m.space`.
    pub kind: Option<String>,
    pub creator: Option<OwnedUserId>,
    pub join_rule: Option<String>,
    /// Replacement room from `m.room.tombstone`, set once the room is dead.
    pub tombstone: Option<OwnedRoomId>,
}

type MetaFn = fn(&mut RoomMeta, &Event);

enum StateEffect {
    /// Recompute a derived meta field.
    Meta(MetaFn),
    /// Drop the power snapshot and every power-dependent cache.
    Power,
    /// Update the member roster.
    Member,
}

fn string_field(content: &JsonValue, field: &str) -> Option<String> {
    content.get(field).and_then(|v| v.as_str()).map(str::to_owned)
}

fn state_effects() -> &'static HashMap<&'static str, StateEffect> {
    static TABLE: OnceLock<HashMap<&'static str, StateEffect>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table: HashMap<&'static str, StateEffect> = HashMap::new();
        table.insert(
            "m.room.name",
            StateEffect::Meta(|meta, event| meta.name = string_field(event.content(), "name")),
        );
        table.insert(
            "m.room.topic",
            StateEffect::Meta(|meta, event| meta.topic = string_field(event.content(), "topic")),
        );
        table.insert(
            "m.room.avatar",
            StateEffect::Meta(|meta, event| meta.avatar_url = string_field(event.content(), "url")),
        );
        table.insert(
            "m.room.canonical_alias",
            StateEffect::Meta(|meta, event| {
                meta.canonical_alias = string_field(event.content(), "alias")
            }),
        );
        table.insert(
            "m.room.join_rules",
            StateEffect::Meta(|meta, event| {
                meta.join_rule = string_field(event.content(), "join_rule")
            }),
        );
        table.insert(
            "m.room.create",
            StateEffect::Meta(|meta, event| {
                meta.kind = string_field(event.content(), "type");
                meta.creator = string_field(event.content(), "creator")
                    .and_then(|c| c.as_str().try_into().ok())
                    .or_else(|| Some(event.sender().clone()));
            }),
        );
        table.insert(
            "m.room.tombstone",
            StateEffect::Meta(|meta, event| {
                meta.tombstone = string_field(event.content(), "replacement_room")
                    .and_then(|r| r.as_str().try_into().ok());
            }),
        );
        table.insert("m.room.power_levels", StateEffect::Power);
        table.insert("m.room.member", StateEffect::Member);
        table
    })
}

#[derive(Debug, Default)]
struct RoomInner {
    /// Current state, keyed by (event type, state key).
    state: HashMap<(String, String), Event>,
    meta: RoomMeta,
    /// Lazily rebuilt power snapshot; `None` means recompute.
    power: Option<Arc<PowerLevels>>,
    members: MemberRoster,
    graph: EventGraph,
    live: Timeline,
    account_data: HashMap<String, JsonValue>,
    notifications: UnreadNotifications,
    summary: RoomSummary,
    /// Transaction ids of in-flight local echoes.
    transactions: HashSet<String>,
}

/// One in-flight pagination per direction, shared by concurrent callers.
#[derive(Default)]
struct FetchSlot {
    fut: Option<Shared<BoxFuture<'static, Result<usize>>>>,
}

pub struct Room {
    id: OwnedRoomId,
    own_user: OwnedUserId,
    fetcher: Arc<dyn Fetcher>,
    notify: tokio::sync::broadcast::Sender<ClientEvent>,
    policy: TimelinePolicy,
    page_limit: u32,
    inner: RwLock<RoomInner>,
    back_fetch: Mutex<FetchSlot>,
    front_fetch: Mutex<FetchSlot>,
}

impl Room {
    pub(crate) fn new(
        id: OwnedRoomId,
        own_user: OwnedUserId,
        fetcher: Arc<dyn Fetcher>,
        notify: tokio::sync::broadcast::Sender<ClientEvent>,
        policy: TimelinePolicy,
        page_limit: u32,
    ) -> Self {
        Room {
            id,
            own_user,
            fetcher,
            notify,
            policy,
            page_limit,
            inner: RwLock::new(RoomInner::default()),
            back_fetch: Mutex::new(FetchSlot::default()),
            front_fetch: Mutex::new(FetchSlot::default()),
        }
    }

    pub fn id(&self) -> &OwnedRoomId {
        &self.id
    }

    fn read(&self) -> RwLockReadGuard<'_, RoomInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RoomInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ClientEvent) {
        // No subscribers is fine.
        let _ = self.notify.send(event);
    }

    // ---- state ----

    /// Apply a state event. Returns false when the exact same event is
    /// already the current entry for its (type, state_key).
    pub(crate) fn handle_state_event(&self, event: Event, emit: bool) -> bool {
        let changed = {
            let mut inner = self.write();
            apply_state(&mut inner, &event)
        };
        if changed && emit {
            self.emit(ClientEvent::State {
                room_id: self.id.clone(),
                event_type: event.event_type().to_owned(),
                state_key: event.state_key().unwrap_or("").to_owned(),
            });
        }
        changed
    }

    /// Replace the entire state store, as after accepting an invite.
    pub(crate) fn reset_state(&self, events: Vec<RawEvent>) {
        {
            let mut inner = self.write();
            inner.state.clear();
            inner.meta = RoomMeta::default();
            inner.power = None;
            inner.members = MemberRoster::new();
            for raw in events {
                let event = Event::from_raw(raw);
                if event.is_state() {
                    apply_state(&mut inner, &event);
                }
            }
        }
        self.emit(ClientEvent::State {
            room_id: self.id.clone(),
            event_type: String::new(),
            state_key: String::new(),
        });
    }

    pub fn state_event(&self, event_type: &str, state_key: &str) -> Option<Event> {
        self.read()
            .state
            .get(&(event_type.to_owned(), state_key.to_owned()))
            .cloned()
    }

    /// Every current state event of one type, across all state keys. For
    /// enumerable state like members or space children.
    pub fn state_events(&self, event_type: &str) -> Vec<Event> {
        self.read()
            .state
            .iter()
            .filter(|((kind, _), _)| kind == event_type)
            .map(|(_, event)| event.clone())
            .collect()
    }

    pub fn meta(&self) -> RoomMeta {
        self.read().meta.clone()
    }

    pub fn name(&self) -> Option<String> {
        self.read().meta.name.clone()
    }

    pub fn topic(&self) -> Option<String> {
        self.read().meta.topic.clone()
    }

    pub fn avatar_url(&self) -> Option<String> {
        self.read().meta.avatar_url.clone()
    }

    /// The current power snapshot, rebuilding it if a power-levels change
    /// dropped the cache. Falls back to a synthesized snapshot granting the
    /// creator full power when the room carries no power-levels event.
    pub fn power_levels(&self) -> Arc<PowerLevels> {
        let mut inner = self.write();
        if let Some(power) = &inner.power {
            return power.clone();
        }
        let levels = match inner
            .state
            .get(&("m.room.power_levels".to_owned(), String::new()))
        {
            Some(event) => PowerLevels::from_content(event.content()),
            None => PowerLevels::synthesized(inner.meta.creator.as_deref()),
        };
        let levels = Arc::new(levels);
        inner.power = Some(levels.clone());
        levels
    }

    /// Members with the given membership value, sorted by descending power
    /// then ascending display name.
    pub fn members(&self, membership: &str) -> Vec<Member> {
        let power = self.power_levels();
        self.write().members.with_membership(membership, &power)
    }

    /// Fetch the full member list from the server. Lazy loading only
    /// delivers the members who sent timeline events; call this before
    /// showing a complete roster. Returns how many entries changed.
    pub async fn fetch_members(&self, membership: Option<&str>) -> Result<usize> {
        let response = self.fetcher.members(&self.id, membership).await?;
        let mut changed = 0;
        let mut inner = self.write();
        for raw in response.chunk {
            let event = Event::from_raw(raw);
            if event.is_state() && apply_state(&mut inner, &event) {
                changed += 1;
            }
        }
        Ok(changed)
    }

    // ---- timeline ----

    /// Apply one event from the sync timeline section: redactions are
    /// executed, local echoes are reconciled by transaction id, everything
    /// else is indexed and appended.
    #[instrument(skip(self, raw), fields(room = %self.id, event = %raw.event_id))]
    pub(crate) fn handle_timeline_event(&self, raw: RawEvent) {
        if raw.event_type == "m.room.redaction" {
            let target = raw
                .redacts
                .as_ref()
                .map(|id| id.to_string())
                .or_else(|| string_field(&raw.content, "redacts"));
            match target {
                Some(target) => self.apply_redaction(&target),
                None => warn!("redaction without target"),
            }
            return;
        }

        if let Some(txn) = raw.transaction_id().map(str::to_owned) {
            if self.confirm_transaction(&txn, &raw) {
                return;
            }
        }

        let event = Event::from_raw(raw);
        if event.is_state() {
            self.handle_state_event(event.clone(), true);
        }

        let event_id = event.id().to_owned();
        let visible = self.policy.is_visible(&event);
        let inserted = {
            let mut inner = self.write();
            let inserted = inner.graph.insert(event, false);
            if inserted && visible {
                inner.live.append(&event_id);
            }
            inserted
        };
        if inserted {
            self.emit(ClientEvent::Timeline {
                room_id: self.id.clone(),
                event_id,
            });
        }
    }

    /// Reconcile a server echo with its local event. Returns false when the
    /// transaction id is unknown here, e.g. sent from another session.
    fn confirm_transaction(&self, transaction_id: &str, raw: &RawEvent) -> bool {
        let event_id = raw.event_id.to_string();
        let confirmed = {
            let mut inner = self.write();
            // The ledger gates reconciliation; an echo for a transaction
            // this client never issued inserts as a normal event.
            if !inner.transactions.remove(transaction_id) {
                return false;
            }
            let confirmed = inner.graph.confirm_local(
                transaction_id,
                &event_id,
                raw.origin_server_ts,
                raw.unsigned.clone(),
            );
            if confirmed {
                inner.live.replace_id(transaction_id, &event_id);
            } else {
                inner.live.remove(transaction_id);
            }
            confirmed
        };
        debug!(transaction = transaction_id, event = %event_id, confirmed, "local echo reconciled");
        self.emit(ClientEvent::RemoteEcho {
            room_id: self.id.clone(),
            transaction_id: transaction_id.to_owned(),
            event_id,
        });
        true
    }

    /// Remove a redacted event: out of the graph, off the timeline, with
    /// the partner caches of its relations invalidated. Unknown targets are
    /// a no-op, since the redacted event may predate our window.
    fn apply_redaction(&self, target: &str) {
        let removed = {
            let mut inner = self.write();
            let removed = inner.graph.remove(target).is_some();
            if removed {
                inner.live.remove(target);
            }
            removed
        };
        if removed {
            self.emit(ClientEvent::Redacted {
                room_id: self.id.clone(),
                event_id: target.to_owned(),
            });
        } else {
            debug!(event = target, room = %self.id, "redaction for unindexed event");
        }
    }

    /// Record the token for paging further back. Only the first token is
    /// kept; later sync deltas extend the timeline forwards instead.
    pub(crate) fn note_prev_batch(&self, token: Option<String>) {
        let mut inner = self.write();
        if inner.live.prev_batch.is_none() {
            inner.live.prev_batch = token;
        }
    }

    pub fn timeline_ids(&self) -> Vec<String> {
        self.read().live.ids().to_vec()
    }

    pub fn event(&self, id: &str) -> Option<Event> {
        self.read().graph.event(id).cloned()
    }

    /// The visible timeline, oldest first.
    pub fn visible_events(&self) -> Vec<Event> {
        let inner = self.read();
        inner
            .live
            .ids()
            .iter()
            .filter_map(|id| inner.graph.event(id))
            .cloned()
            .collect()
    }

    /// Content as it should render: the latest valid edit, or the original.
    pub fn rendered_content(&self, id: &str) -> Option<JsonValue> {
        self.write().graph.rendered_content(id)
    }

    /// Reactions on an event, grouped by key with one entry per sender.
    pub fn reactions(&self, id: &str) -> Option<BTreeMap<String, Vec<OwnedUserId>>> {
        self.write().graph.reactions(id)
    }

    // ---- pagination ----

    /// Fetch one page of history in the given direction, returning how many
    /// events joined the visible timeline. Concurrent calls in the same
    /// direction share a single request. Returns 0 once that direction is
    /// exhausted.
    pub async fn paginate(self: Arc<Self>, direction: Direction) -> Result<usize> {
        let fut = {
            let slot = match direction {
                Direction::Backwards => &self.back_fetch,
                Direction::Forwards => &self.front_fetch,
            };
            let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
            match &slot.fut {
                Some(fut) => fut.clone(),
                None => {
                    let this = self.clone();
                    let fut = async move { this.fetch_page(direction).await }
                        .boxed()
                        .shared();
                    slot.fut = Some(fut.clone());
                    fut
                }
            }
        };

        let result = fut.clone().await;

        let slot = match direction {
            Direction::Backwards => &self.back_fetch,
            Direction::Forwards => &self.front_fetch,
        };
        let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.fut.as_ref().map_or(false, |f| f.ptr_eq(&fut)) {
            slot.fut = None;
        }

        result
    }

    #[instrument(skip(self), fields(room = %self.id))]
    async fn fetch_page(&self, direction: Direction) -> Result<usize> {
        let Some(token) = self.read().live.token(direction).map(str::to_owned) else {
            debug!("pagination direction exhausted");
            return Ok(0);
        };
        let response = self
            .fetcher
            .messages(&self.id, &token, direction, self.page_limit)
            .await?;
        Ok(self.apply_messages(direction, response))
    }

    fn apply_messages(&self, direction: Direction, response: MessagesResponse) -> usize {
        // Redactions later in the batch hide their targets from the same
        // batch entirely.
        let redacted_in_batch: HashSet<String> = response
            .chunk
            .iter()
            .filter(|raw| raw.event_type == "m.room.redaction")
            .filter_map(|raw| {
                raw.redacts
                    .as_ref()
                    .map(|id| id.to_string())
                    .or_else(|| string_field(&raw.content, "redacts"))
            })
            .collect();

        let mut added = 0;
        let mut emitted: Vec<ClientEvent> = Vec::new();
        {
            let mut inner = self.write();
            inner.live.set_token(direction, response.end.clone());

            // Lazy-loaded state arriving out of band with the page.
            for raw in response.state {
                let event = Event::from_raw(raw);
                if event.is_state() && apply_state(&mut inner, &event) {
                    emitted.push(ClientEvent::State {
                        room_id: self.id.clone(),
                        event_type: event.event_type().to_owned(),
                        state_key: event.state_key().unwrap_or("").to_owned(),
                    });
                }
            }

            for raw in response.chunk {
                if raw.event_type == "m.room.redaction" {
                    let target = raw
                        .redacts
                        .as_ref()
                        .map(|id| id.to_string())
                        .or_else(|| string_field(&raw.content, "redacts"));
                    if let Some(target) = target {
                        if inner.graph.remove(&target).is_some() {
                            inner.live.remove(&target);
                            emitted.push(ClientEvent::Redacted {
                                room_id: self.id.clone(),
                                event_id: target,
                            });
                        }
                    }
                    continue;
                }
                let id = raw.event_id.to_string();
                if raw.is_redacted() || redacted_in_batch.contains(&id) {
                    debug!(event = %id, "skipping redacted event in page");
                    continue;
                }

                let event = Event::from_raw(raw);
                if event.is_state() {
                    apply_state(&mut inner, &event);
                }
                let visible = self.policy.is_visible(&event);
                let to_front = direction == Direction::Backwards;
                if inner.graph.insert(event, to_front) && visible {
                    let placed = match direction {
                        Direction::Backwards => inner.live.prepend(&id),
                        Direction::Forwards => inner.live.append(&id),
                    };
                    if placed {
                        added += 1;
                        emitted.push(ClientEvent::Timeline {
                            room_id: self.id.clone(),
                            event_id: id,
                        });
                    }
                }
            }
        }
        for event in emitted {
            self.emit(event);
        }
        added
    }

    // ---- sending ----

    /// Send a timeline event with an optimistic local echo. The echo is
    /// visible immediately under its transaction id and swaps to the server
    /// id when the echo comes back through sync.
    #[instrument(skip(self, content), fields(room = %self.id, event_type))]
    pub async fn send(&self, event_type: &str, content: JsonValue) -> Result<String> {
        let transaction_id = new_transaction_id();
        let event = Event::local(
            &transaction_id,
            event_type,
            self.own_user.clone(),
            content.clone(),
            now_millis(),
        );
        let visible = self.policy.is_visible(&event);
        {
            let mut inner = self.write();
            inner.transactions.insert(transaction_id.clone());
            inner.graph.insert(event, false);
            if visible {
                inner.live.append(&transaction_id);
            }
        }
        self.emit(ClientEvent::Timeline {
            room_id: self.id.clone(),
            event_id: transaction_id.clone(),
        });

        match self
            .fetcher
            .send_event(&self.id, event_type, &content, &transaction_id)
            .await
        {
            Ok(_) => {
                self.write()
                    .graph
                    .set_local_status(&transaction_id, LocalStatus::Sent);
                Ok(transaction_id)
            }
            Err(err) => {
                warn!(%err, transaction = %transaction_id, "send failed");
                self.write()
                    .graph
                    .set_local_status(&transaction_id, LocalStatus::Errored);
                self.emit(ClientEvent::SendFailed {
                    room_id: self.id.clone(),
                    transaction_id,
                });
                Err(err)
            }
        }
    }

    /// Send a state event. State is never echoed locally; it lands through
    /// the sync state section.
    pub async fn send_state(
        &self,
        event_type: &str,
        state_key: &str,
        content: JsonValue,
    ) -> Result<String> {
        let event_id = self
            .fetcher
            .send_state(&self.id, event_type, state_key, &content)
            .await?;
        Ok(event_id.to_string())
    }

    /// Redact an event, applying the removal locally once the server
    /// accepts. The sync-delivered redaction later becomes a no-op.
    pub async fn redact(&self, event_id: &str, reason: Option<&str>) -> Result<String> {
        let transaction_id = new_transaction_id();
        let redaction_id = self
            .fetcher
            .redact(&self.id, event_id, reason, &transaction_id)
            .await?;
        self.apply_redaction(event_id);
        Ok(redaction_id.to_string())
    }

    // ---- account data, receipts, counters ----

    pub(crate) fn handle_account_data(&self, entry: AccountDataEvent) {
        self.write()
            .account_data
            .insert(entry.data_type.clone(), entry.content);
        self.emit(ClientEvent::RoomAccountData {
            room_id: self.id.clone(),
            data_type: entry.data_type,
        });
    }

    pub fn account_data(&self, data_type: &str) -> Option<JsonValue> {
        self.read().account_data.get(data_type).cloned()
    }

    pub(crate) fn handle_ephemeral(&self, event: EphemeralEvent) {
        self.emit(ClientEvent::Ephemeral {
            room_id: self.id.clone(),
            event,
        });
    }

    pub(crate) fn set_notifications(&self, counts: UnreadNotifications) {
        let changed = {
            let mut inner = self.write();
            let changed = inner.notifications != counts;
            inner.notifications = counts;
            changed
        };
        if changed {
            self.emit(ClientEvent::Notifications {
                room_id: self.id.clone(),
                counts,
            });
        }
    }

    pub fn notifications(&self) -> UnreadNotifications {
        self.read().notifications
    }

    pub(crate) fn set_summary(&self, summary: RoomSummary) {
        self.write().summary = summary;
    }

    pub fn summary(&self) -> RoomSummary {
        self.read().summary.clone()
    }

    // ---- persistence ----

    /// Capture what survives a restart: full state, account data and the
    /// tail of the visible timeline. Local echoes are in flight and are not
    /// persisted.
    pub(crate) fn snapshot(&self, timeline_tail: usize) -> RoomSnapshot {
        let inner = self.read();
        let state = inner.state.values().filter_map(Event::to_raw).collect();
        let account_data = inner
            .account_data
            .iter()
            .map(|(data_type, content)| AccountDataEvent {
                data_type: data_type.clone(),
                content: content.clone(),
            })
            .collect();
        let ids = inner.live.ids();
        let skip = ids.len().saturating_sub(timeline_tail);
        let timeline = ids
            .iter()
            .skip(skip)
            .filter_map(|id| inner.graph.event(id))
            .filter(|event| event.local_status().is_none())
            .filter_map(Event::to_raw)
            .collect();
        RoomSnapshot {
            id: self.id.to_string(),
            state,
            account_data,
            timeline,
            prev_batch: inner.live.prev_batch.clone(),
            notifications: inner.notifications,
            summary: inner.summary.clone(),
        }
    }

    /// Rehydrate from a snapshot before the first sync. No notifications
    /// are emitted; subscribers attach after restore.
    pub(crate) fn restore(&self, snapshot: RoomSnapshot) {
        let mut inner = self.write();
        for raw in snapshot.state {
            let event = Event::from_raw(raw);
            if event.is_state() {
                apply_state(&mut inner, &event);
            }
        }
        for entry in snapshot.account_data {
            inner.account_data.insert(entry.data_type, entry.content);
        }
        for raw in snapshot.timeline {
            let id = raw.event_id.to_string();
            let event = Event::from_raw(raw);
            let visible = self.policy.is_visible(&event);
            if inner.graph.insert(event, false) && visible {
                inner.live.append(&id);
            }
        }
        inner.live.prev_batch = snapshot.prev_batch;
        inner.notifications = snapshot.notifications;
        inner.summary = snapshot.summary;
    }
}

/// Store a state event and run its side effect. Returns false when the
/// entry is already current, which makes re-delivered state idempotent.
fn apply_state(inner: &mut RoomInner, event: &Event) -> bool {
    let Some(state_key) = event.state_key() else {
        warn!(event = %event.id(), "state handler given a non-state event");
        return false;
    };
    let key = (event.event_type().to_owned(), state_key.to_owned());
    if inner
        .state
        .get(&key)
        .map_or(false, |current| current.id() == event.id())
    {
        return false;
    }
    inner.state.insert(key, event.clone());

    match state_effects().get(event.event_type()) {
        Some(StateEffect::Meta(apply)) if state_key.is_empty() => apply(&mut inner.meta, event),
        Some(StateEffect::Power) => {
            inner.power = None;
            inner.members.invalidate_sorting();
        }
        Some(StateEffect::Member) => inner.members.handle(event),
        _ => {}
    }
    true
}

fn new_transaction_id() -> String {
    format!("rs{}", Uuid::new_v4().simple())
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RawEvent;
    use ruma::{room_id, user_id};
    use serde_json::json;
    use test_log::test;
    use tokio::sync::broadcast;

    struct NullFetcher;

    #[async_trait::async_trait]
    impl Fetcher for NullFetcher {
        async fn sync(
            &self,
            _since: Option<&str>,
            _filter: Option<&str>,
            _timeout: std::time::Duration,
        ) -> Result<crate::api::SyncResponse> {
            Err(roomsync_common::Error::Transport("unused".into()))
        }
        async fn create_filter(
            &self,
            _user_id: &ruma::UserId,
            _filter: &crate::api::FilterDefinition,
        ) -> Result<String> {
            Err(roomsync_common::Error::Transport("unused".into()))
        }
        async fn send_event(
            &self,
            _room_id: &ruma::RoomId,
            _event_type: &str,
            _content: &JsonValue,
            _transaction_id: &str,
        ) -> Result<ruma::OwnedEventId> {
            Ok("$sent:example.org".try_into().unwrap())
        }
        async fn send_state(
            &self,
            _room_id: &ruma::RoomId,
            _event_type: &str,
            _state_key: &str,
            _content: &JsonValue,
        ) -> Result<ruma::OwnedEventId> {
            Ok("$state:example.org".try_into().unwrap())
        }
        async fn redact(
            &self,
            _room_id: &ruma::RoomId,
            _event_id: &str,
            _reason: Option<&str>,
            _transaction_id: &str,
        ) -> Result<ruma::OwnedEventId> {
            Ok("$redaction:example.org".try_into().unwrap())
        }
        async fn messages(
            &self,
            _room_id: &ruma::RoomId,
            _from: &str,
            _direction: Direction,
            _limit: u32,
        ) -> Result<MessagesResponse> {
            Ok(MessagesResponse::default())
        }
        async fn state(&self, _room_id: &ruma::RoomId) -> Result<Vec<RawEvent>> {
            Ok(Vec::new())
        }
        async fn members(
            &self,
            _room_id: &ruma::RoomId,
            _membership: Option<&str>,
        ) -> Result<crate::api::MembersResponse> {
            Ok(crate::api::MembersResponse::default())
        }
    }

    fn test_room() -> Room {
        let (notify, _) = broadcast::channel(64);
        Room::new(
            room_id!("!room:example.org").to_owned(),
            user_id!("@me:example.org").to_owned(),
            Arc::new(NullFetcher),
            notify,
            TimelinePolicy::default(),
            50,
        )
    }

    fn raw(value: serde_json::Value) -> RawEvent {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn state_updates_derived_fields() {
        let room = test_room();
        room.handle_state_event(
            Event::from_raw(raw(json!({
                "event_id": "$create",
                "type": "m.room.create",
                "sender": "@alice:example.org",
                "state_key": "",
                "content": {}
            }))),
            false,
        );
        room.handle_state_event(
            Event::from_raw(raw(json!({
                "event_id": "$name",
                "type": "m.room.name",
                "sender": "@alice:example.org",
                "state_key": "",
                "content": { "name": "Ops" }
            }))),
            false,
        );

        assert_eq!(room.name().as_deref(), Some("Ops"));
        let meta = room.meta();
        assert_eq!(
            meta.creator.as_deref().map(ruma::UserId::as_str),
            Some("@alice:example.org")
        );
        // creator fallback grants full power
        assert_eq!(
            room.power_levels().for_user(user_id!("@alice:example.org")),
            100
        );
    }

    #[test]
    fn state_events_enumerates_one_type_across_keys() {
        let room = test_room();
        for user in ["@alice:example.org", "@bob:example.org"] {
            room.handle_state_event(
                Event::from_raw(raw(json!({
                    "event_id": format!("$m-{user}"),
                    "type": "m.room.member",
                    "sender": user,
                    "state_key": user,
                    "content": { "membership": "join" }
                }))),
                false,
            );
        }
        room.handle_state_event(
            Event::from_raw(raw(json!({
                "event_id": "$name",
                "type": "m.room.name",
                "sender": "@alice:example.org",
                "state_key": "",
                "content": { "name": "Ops" }
            }))),
            false,
        );

        let mut keys: Vec<_> = room
            .state_events("m.room.member")
            .into_iter()
            .map(|e| e.state_key().unwrap_or("").to_owned())
            .collect();
        keys.sort();
        assert_eq!(keys, ["@alice:example.org", "@bob:example.org"]);
        assert!(room.state_events("m.room.topic").is_empty());
    }

    #[test]
    fn redelivered_state_is_idempotent() {
        let room = test_room();
        let name = Event::from_raw(raw(json!({
            "event_id": "$name",
            "type": "m.room.name",
            "sender": "@alice:example.org",
            "state_key": "",
            "content": { "name": "Ops" }
        })));
        assert!(room.handle_state_event(name.clone(), false));
        assert!(!room.handle_state_event(name, false));
    }

    #[test]
    fn power_change_drops_cached_snapshot() {
        let room = test_room();
        room.handle_state_event(
            Event::from_raw(raw(json!({
                "event_id": "$pl1",
                "type": "m.room.power_levels",
                "sender": "@alice:example.org",
                "state_key": "",
                "content": { "users": { "@alice:example.org": 100 } }
            }))),
            false,
        );
        assert_eq!(
            room.power_levels().for_user(user_id!("@alice:example.org")),
            100
        );

        room.handle_state_event(
            Event::from_raw(raw(json!({
                "event_id": "$pl2",
                "type": "m.room.power_levels",
                "sender": "@alice:example.org",
                "state_key": "",
                "content": { "users": { "@alice:example.org": 50 } }
            }))),
            false,
        );
        assert_eq!(
            room.power_levels().for_user(user_id!("@alice:example.org")),
            50
        );
    }

    #[test]
    fn timeline_event_is_indexed_and_visible() {
        let room = test_room();
        room.handle_timeline_event(raw(json!({
            "event_id": "$msg",
            "type": "m.room.message",
            "sender": "@alice:example.org",
            "content": { "body": "hi" },
            "origin_server_ts": 1
        })));
        room.handle_timeline_event(raw(json!({
            "event_id": "$react",
            "type": "m.reaction",
            "sender": "@bob:example.org",
            "content": {
                "m.relates_to": { "rel_type": "m.annotation", "event_id": "$msg", "key": "x" }
            },
            "origin_server_ts": 2
        })));

        // the reaction is indexed but hidden from the visible timeline
        assert_eq!(room.timeline_ids(), ["$msg"]);
        assert_eq!(room.reactions("$msg").unwrap()["x"].len(), 1);
    }

    #[test]
    fn redaction_removes_target() {
        let room = test_room();
        room.handle_timeline_event(raw(json!({
            "event_id": "$msg",
            "type": "m.room.message",
            "sender": "@alice:example.org",
            "content": { "body": "oops" },
            "origin_server_ts": 1
        })));
        room.handle_timeline_event(raw(json!({
            "event_id": "$redaction",
            "type": "m.room.redaction",
            "sender": "@alice:example.org",
            "content": { "redacts": "$msg" },
            "origin_server_ts": 2
        })));

        assert!(room.timeline_ids().is_empty());
        assert!(room.event("$msg").is_none());
        // unknown target is a no-op
        room.handle_timeline_event(raw(json!({
            "event_id": "$redaction2",
            "type": "m.room.redaction",
            "sender": "@alice:example.org",
            "content": { "redacts": "$missing" },
            "origin_server_ts": 3
        })));
    }

    #[test(tokio::test)]
    async fn send_places_local_echo_then_sync_confirms() {
        let room = test_room();
        let txn = room.send("m.room.message", json!({ "body": "hi" })).await.unwrap();

        assert_eq!(room.timeline_ids(), [txn.clone()]);
        assert_eq!(room.event(&txn).unwrap().local_status(), Some(LocalStatus::Sent));

        room.handle_timeline_event(raw(json!({
            "event_id": "$confirmed",
            "type": "m.room.message",
            "sender": "@me:example.org",
            "content": { "body": "hi" },
            "origin_server_ts": 5,
            "unsigned": { "transaction_id": txn.clone() }
        })));

        assert_eq!(room.timeline_ids(), ["$confirmed"]);
        assert!(room.event(&txn).is_none());
        assert!(room.event("$confirmed").unwrap().local_status().is_none());
    }

    #[test]
    fn foreign_transaction_id_inserts_normally() {
        let room = test_room();
        room.handle_timeline_event(raw(json!({
            "event_id": "$other",
            "type": "m.room.message",
            "sender": "@me:example.org",
            "content": { "body": "from elsewhere" },
            "origin_server_ts": 5,
            "unsigned": { "transaction_id": "unknown-txn" }
        })));
        assert_eq!(room.timeline_ids(), ["$other"]);
    }

    #[test]
    fn backwards_page_prepends_in_order() {
        let room = test_room();
        room.handle_timeline_event(raw(json!({
            "event_id": "$c",
            "type": "m.room.message",
            "sender": "@alice:example.org",
            "content": { "body": "c" },
            "origin_server_ts": 3
        })));
        room.note_prev_batch(Some("t0".into()));

        // backwards chunks run newest to oldest
        let added = room.apply_messages(
            Direction::Backwards,
            serde_json::from_value(json!({
                "start": "t0",
                "end": "t1",
                "chunk": [
                    {
                        "event_id": "$b",
                        "type": "m.room.message",
                        "sender": "@alice:example.org",
                        "content": { "body": "b" },
                        "origin_server_ts": 2
                    },
                    {
                        "event_id": "$a",
                        "type": "m.room.message",
                        "sender": "@alice:example.org",
                        "content": { "body": "a" },
                        "origin_server_ts": 1
                    }
                ]
            }))
            .unwrap(),
        );

        assert_eq!(added, 2);
        assert_eq!(room.timeline_ids(), ["$a", "$b", "$c"]);
        assert_eq!(room.read().live.prev_batch.as_deref(), Some("t1"));
    }

    #[test]
    fn same_batch_redaction_hides_target() {
        let room = test_room();
        room.note_prev_batch(Some("t0".into()));
        let added = room.apply_messages(
            Direction::Backwards,
            serde_json::from_value(json!({
                "end": "t1",
                "chunk": [
                    {
                        "event_id": "$redaction",
                        "type": "m.room.redaction",
                        "sender": "@alice:example.org",
                        "content": { "redacts": "$gone" },
                        "origin_server_ts": 2
                    },
                    {
                        "event_id": "$gone",
                        "type": "m.room.message",
                        "sender": "@alice:example.org",
                        "content": { "body": "secret" },
                        "origin_server_ts": 1
                    }
                ]
            }))
            .unwrap(),
        );
        assert_eq!(added, 0);
        assert!(room.timeline_ids().is_empty());
    }

    #[test(tokio::test)]
    async fn redact_applies_locally_after_accept() {
        let room = test_room();
        room.handle_timeline_event(raw(json!({
            "event_id": "$msg",
            "type": "m.room.message",
            "sender": "@me:example.org",
            "content": { "body": "typo" },
            "origin_server_ts": 1
        })));

        room.redact("$msg", Some("typo")).await.unwrap();
        assert!(room.timeline_ids().is_empty());
        assert!(room.event("$msg").is_none());
    }

    #[test(tokio::test)]
    async fn exhausted_direction_short_circuits() {
        let room = Arc::new(test_room());
        // no prev_batch token at all
        assert_eq!(room.clone().paginate(Direction::Backwards).await.unwrap(), 0);
    }

    #[test]
    fn snapshot_restores_state_and_timeline() {
        let room = test_room();
        room.handle_state_event(
            Event::from_raw(raw(json!({
                "event_id": "$name",
                "type": "m.room.name",
                "sender": "@alice:example.org",
                "state_key": "",
                "content": { "name": "Ops" }
            }))),
            false,
        );
        room.handle_timeline_event(raw(json!({
            "event_id": "$msg",
            "type": "m.room.message",
            "sender": "@alice:example.org",
            "content": { "body": "hi" },
            "origin_server_ts": 1
        })));
        room.note_prev_batch(Some("t0".into()));

        let snapshot = room.snapshot(50);
        assert_eq!(snapshot.timeline.len(), 1);

        let restored = test_room();
        restored.restore(snapshot);
        assert_eq!(restored.name().as_deref(), Some("Ops"));
        assert_eq!(restored.timeline_ids(), ["$msg"]);
        assert_eq!(restored.read().live.prev_batch.as_deref(), Some("t0"));
    }
}
