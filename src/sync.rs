//! The sync loop: long-poll, apply, persist, repeat.
//!
//! Status transitions: `Stopped -> Starting -> Syncing`, dipping into
//! `Reconnecting` on transient errors with capped exponential backoff. A
//! protocol-level error is fatal and stops the loop; cancellation stops it
//! silently. A failed delta never advances the sync token, so the next
//! attempt replays the same window.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use roomsync_common::Result;

use crate::api::{SyncResponse, TimelineBatch};
use crate::client::{read, write, ClientEvent, ClientInner};
use crate::event::{EphemeralEvent, Event};
use crate::invite::Invite;
use crate::persist::{ACCOUNT_DATA_TABLE, ROOMS_TABLE, SYNC_TABLE, SYNC_TOKEN_KEY};

/// How many trailing timeline events a room snapshot keeps.
const SNAPSHOT_TIMELINE_TAIL: usize = 50;

/// Where the engine stands relative to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Stopped,
    /// Start requested, first delta not applied yet.
    Starting,
    Syncing,
    /// A transient failure interrupted the stream; retrying with backoff.
    Reconnecting,
}

/// Rooms affected by one delta, for the persistence pass.
#[derive(Debug, Default)]
struct SyncOutcome {
    touched: Vec<ruma::OwnedRoomId>,
    removed: Vec<ruma::OwnedRoomId>,
}

pub(crate) async fn run_sync_loop(
    inner: Arc<ClientInner>,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    let mut attempt: u32 = 0;
    // Ready must fire on the first applied delta even when transient
    // failures pushed the status through Reconnecting first.
    let mut ready_pending = true;
    loop {
        let since = read(&inner.next_batch)
            .clone();
        let filter = read(&inner.filter_id)
            .clone();

        let result = tokio::select! {
            _ = stop.changed() => {
                info!("sync loop cancelled");
                inner.set_status(SyncStatus::Stopped);
                return Ok(());
            }
            result = inner.fetcher.sync(
                since.as_deref(),
                filter.as_deref(),
                inner.config.sync_timeout,
            ) => result,
        };

        match result {
            Ok(response) => {
                let next_batch = response.next_batch.clone();
                let outcome = handle_sync(&inner, response).await;

                // Token advances only after the delta applied.
                *write(&inner.next_batch) =
                    Some(next_batch.clone());
                attempt = 0;

                inner.set_status(SyncStatus::Syncing);
                if std::mem::take(&mut ready_pending) {
                    inner.emit(ClientEvent::Ready);
                }

                if let Err(err) = persist(&inner, &outcome, &next_batch).await {
                    warn!(%err, "failed to persist sync snapshot");
                }
            }
            Err(err) if err.is_cancelled() => {
                info!("sync request cancelled");
                inner.set_status(SyncStatus::Stopped);
                return Ok(());
            }
            Err(err) if err.is_fatal() => {
                warn!(%err, "protocol error, stopping sync");
                inner.set_status(SyncStatus::Stopped);
                return Err(err);
            }
            Err(err) => {
                let delay = inner.config.retry.delay_for_attempt(attempt);
                attempt = attempt.saturating_add(1);
                warn!(%err, attempt, ?delay, "transient sync failure, backing off");
                inner.set_status(SyncStatus::Reconnecting);
                tokio::select! {
                    _ = stop.changed() => {
                        inner.set_status(SyncStatus::Stopped);
                        return Ok(());
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Apply one delta to the room, invite and account-data stores.
#[instrument(skip_all)]
async fn handle_sync(inner: &Arc<ClientInner>, response: SyncResponse) -> SyncOutcome {
    let mut outcome = SyncOutcome::default();

    if let Some(batch) = response.account_data {
        for entry in batch.events {
            write(&inner.account_data)
                .insert(entry.data_type.clone(), entry.content);
            inner.emit(ClientEvent::AccountData {
                data_type: entry.data_type,
            });
        }
    }

    let Some(rooms) = response.rooms else {
        return outcome;
    };

    for (room_id, update) in rooms.join {
        let (room, is_new) = inner.room_or_create(&room_id);

        if is_new {
            let accepted_invite = write(&inner.invites)
                .remove(&room_id)
                .is_some();
            if accepted_invite {
                // Stripped invite state is unverified; replace it with the
                // server's full state.
                match inner.fetcher.state(&room_id).await {
                    Ok(events) => room.reset_state(events),
                    Err(err) => {
                        warn!(%err, room = %room_id, "failed to fetch state for accepted invite")
                    }
                }
            }
        }

        if let Some(state) = update.state {
            for raw in state.events {
                room.handle_state_event(Event::from_raw(raw), true);
            }
        }

        if let Some(timeline) = update.timeline {
            apply_timeline(&room, timeline);
        }

        if is_new {
            inner.emit(ClientEvent::Joined(room_id.clone()));
        }

        if let Some(batch) = update.account_data {
            for entry in batch.events {
                room.handle_account_data(entry);
            }
        }
        if let Some(batch) = update.ephemeral {
            for raw in batch.events {
                room.handle_ephemeral(EphemeralEvent {
                    event_type: raw.event_type,
                    content: raw.content,
                });
            }
        }
        if let Some(counts) = update.unread_notifications {
            room.set_notifications(counts);
        }
        if let Some(summary) = update.summary {
            room.set_summary(summary);
        }

        outcome.touched.push(room_id);
    }

    for (room_id, update) in rooms.invite {
        let invite = Invite::from_stripped_state(
            room_id.clone(),
            &inner.config.user_id,
            update.invite_state.events,
        );
        write(&inner.invites)
            .insert(room_id.clone(), invite);
        inner.emit(ClientEvent::Invited(room_id));
    }

    for room_id in rooms.leave.into_keys() {
        let left = write(&inner.rooms)
            .remove(&room_id)
            .is_some();
        if left {
            outcome.removed.push(room_id.clone());
            inner.emit(ClientEvent::Left(room_id.clone()));
        }
        let revoked = write(&inner.invites)
            .remove(&room_id)
            .is_some();
        if revoked {
            inner.emit(ClientEvent::InviteRevoked(room_id.clone()));
        }
        if !left && !revoked {
            debug!(room = %room_id, "leave for unknown room");
        }
    }

    outcome
}

fn apply_timeline(room: &crate::room::Room, timeline: TimelineBatch) {
    room.note_prev_batch(timeline.prev_batch);
    for raw in timeline.events {
        room.handle_timeline_event(raw);
    }
}

/// Snapshot every touched room plus the sync token and global account data.
async fn persist(inner: &Arc<ClientInner>, outcome: &SyncOutcome, next_batch: &str) -> Result<()> {
    let Some(store) = &inner.store else {
        return Ok(());
    };

    store
        .put(SYNC_TABLE, SYNC_TOKEN_KEY, json!(next_batch))
        .await?;

    let account_data: Vec<(String, serde_json::Value)> = read(&inner.account_data)
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    store.put_all(ACCOUNT_DATA_TABLE, account_data).await?;

    for room_id in &outcome.touched {
        let room = read(&inner.rooms)
            .get(room_id)
            .cloned();
        let Some(room) = room else { continue };
        let snapshot = room.snapshot(SNAPSHOT_TIMELINE_TAIL);
        store
            .put(ROOMS_TABLE, room_id.as_str(), serde_json::to_value(snapshot)?)
            .await?;
    }
    for room_id in &outcome.removed {
        store.delete(ROOMS_TABLE, room_id.as_str()).await?;
    }
    Ok(())
}
