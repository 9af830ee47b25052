//! The client: owns the room set, the invite set, global account data and
//! the sync task, and fans out change notifications.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use ruma::OwnedRoomId;
use serde_json::Value as JsonValue;
use tracing::{error, info, instrument, warn};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use roomsync_common::{Error, Result};

use crate::api::{FilterDefinition, UnreadNotifications};
use crate::config::ClientConfig;
use crate::event::EphemeralEvent;
use crate::fetcher::Fetcher;
use crate::invite::Invite;
use crate::persist::{
    RoomSnapshot, Store, ACCOUNT_DATA_TABLE, ROOMS_TABLE, SYNC_TABLE, SYNC_TOKEN_KEY,
};
use crate::room::Room;
use crate::sync::{run_sync_loop, SyncStatus};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Everything subscribers can observe changing.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Status(SyncStatus),
    /// First sync delta applied; the room set is trustworthy from here on.
    Ready,
    AccountData {
        data_type: String,
    },
    RoomAccountData {
        room_id: OwnedRoomId,
        data_type: String,
    },
    State {
        room_id: OwnedRoomId,
        event_type: String,
        state_key: String,
    },
    Timeline {
        room_id: OwnedRoomId,
        event_id: String,
    },
    Redacted {
        room_id: OwnedRoomId,
        event_id: String,
    },
    Ephemeral {
        room_id: OwnedRoomId,
        event: EphemeralEvent,
    },
    Joined(OwnedRoomId),
    Left(OwnedRoomId),
    Invited(OwnedRoomId),
    InviteRevoked(OwnedRoomId),
    Notifications {
        room_id: OwnedRoomId,
        counts: UnreadNotifications,
    },
    /// A local echo was matched to its server event.
    RemoteEcho {
        room_id: OwnedRoomId,
        transaction_id: String,
        event_id: String,
    },
    SendFailed {
        room_id: OwnedRoomId,
        transaction_id: String,
    },
}

pub(crate) struct ClientInner {
    pub(crate) config: ClientConfig,
    pub(crate) fetcher: Arc<dyn Fetcher>,
    pub(crate) store: Option<Arc<dyn Store>>,
    pub(crate) rooms: RwLock<HashMap<OwnedRoomId, Arc<Room>>>,
    pub(crate) invites: RwLock<HashMap<OwnedRoomId, Invite>>,
    pub(crate) account_data: RwLock<HashMap<String, JsonValue>>,
    pub(crate) status: watch::Sender<SyncStatus>,
    pub(crate) events: broadcast::Sender<ClientEvent>,
    pub(crate) filter_id: RwLock<Option<String>>,
    pub(crate) next_batch: RwLock<Option<String>>,
    stop: Mutex<Option<watch::Sender<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ClientInner {
    pub(crate) fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn set_status(&self, status: SyncStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            info!(?status, "sync status changed");
            self.emit(ClientEvent::Status(status));
        }
    }

    /// Fetch or lazily create the room object for an id.
    pub(crate) fn room_or_create(&self, room_id: &OwnedRoomId) -> (Arc<Room>, bool) {
        if let Some(room) = read(&self.rooms).get(room_id) {
            return (room.clone(), false);
        }
        let mut rooms = write(&self.rooms);
        // raced with another creator
        if let Some(room) = rooms.get(room_id) {
            return (room.clone(), false);
        }
        let room = Arc::new(Room::new(
            room_id.clone(),
            self.config.user_id.clone(),
            self.fetcher.clone(),
            self.events.clone(),
            self.config.policy.clone(),
            self.config.page_limit,
        ));
        rooms.insert(room_id.clone(), room.clone());
        (room, true)
    }
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to one sync engine instance. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(config: ClientConfig, fetcher: Arc<dyn Fetcher>) -> Self {
        Self::build(config, fetcher, None)
    }

    /// A client that snapshots its state through `store` after every delta
    /// and replays it before the first sync.
    pub fn with_store(
        config: ClientConfig,
        fetcher: Arc<dyn Fetcher>,
        store: Arc<dyn Store>,
    ) -> Self {
        Self::build(config, fetcher, Some(store))
    }

    fn build(config: ClientConfig, fetcher: Arc<dyn Fetcher>, store: Option<Arc<dyn Store>>) -> Self {
        let (status, _) = watch::channel(SyncStatus::Stopped);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Client {
            inner: Arc::new(ClientInner {
                config,
                fetcher,
                store,
                rooms: RwLock::new(HashMap::new()),
                invites: RwLock::new(HashMap::new()),
                account_data: RwLock::new(HashMap::new()),
                status,
                events,
                filter_id: RwLock::new(None),
                next_batch: RwLock::new(None),
                stop: Mutex::new(None),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    pub fn status(&self) -> SyncStatus {
        *self.inner.status.borrow()
    }

    pub fn status_updates(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.subscribe()
    }

    pub fn room(&self, room_id: &OwnedRoomId) -> Option<Arc<Room>> {
        read(&self.inner.rooms).get(room_id).cloned()
    }

    pub fn rooms(&self) -> Vec<Arc<Room>> {
        read(&self.inner.rooms).values().cloned().collect()
    }

    pub fn invite(&self, room_id: &OwnedRoomId) -> Option<Invite> {
        read(&self.inner.invites).get(room_id).cloned()
    }

    pub fn invites(&self) -> Vec<Invite> {
        read(&self.inner.invites).values().cloned().collect()
    }

    pub fn account_data(&self, data_type: &str) -> Option<JsonValue> {
        read(&self.inner.account_data).get(data_type).cloned()
    }

    /// Start syncing. Replays the persisted snapshot first, registers the
    /// sync filter once, then spawns the long-poll loop. Starting an
    /// already-running client is an error.
    #[instrument(skip(self), fields(user = %self.inner.config.user_id))]
    pub async fn start(&self) -> Result<()> {
        if self.status() != SyncStatus::Stopped {
            return Err(Error::InvalidState("client already started".to_owned()));
        }
        self.inner.set_status(SyncStatus::Starting);

        if let Err(err) = self.replay_store().await {
            warn!(%err, "persisted state unusable, starting fresh");
            if let Some(store) = &self.inner.store {
                if let Err(err) = store.clear().await {
                    warn!(%err, "failed to clear store");
                }
            }
        }

        if read(&self.inner.filter_id).is_none() {
            let filter = FilterDefinition::for_sync(self.inner.config.timeline_limit);
            match self
                .inner
                .fetcher
                .create_filter(&self.inner.config.user_id, &filter)
                .await
            {
                Ok(filter_id) => *write(&self.inner.filter_id) = Some(filter_id),
                Err(err) => {
                    self.inner.set_status(SyncStatus::Stopped);
                    return Err(err);
                }
            }
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        *self.inner.stop.lock().unwrap_or_else(PoisonError::into_inner) = Some(stop_tx);

        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            if let Err(err) = run_sync_loop(inner, stop_rx).await {
                error!(%err, "sync loop stopped on fatal error");
            }
        });
        *self.inner.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        Ok(())
    }

    /// Stop syncing. Cancels the in-flight long poll, waits for the loop to
    /// wind down and closes the store. Idempotent.
    pub async fn stop(&self) {
        let stop = self
            .inner
            .stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(stop) = stop {
            let _ = stop.send(true);
        }
        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(%err, "sync task panicked");
            }
        }
        self.inner.set_status(SyncStatus::Stopped);
        if let Some(store) = &self.inner.store {
            if let Err(err) = store.close().await {
                warn!(%err, "failed to close store");
            }
        }
    }

    async fn replay_store(&self) -> Result<()> {
        let Some(store) = &self.inner.store else {
            return Ok(());
        };
        store.open().await?;

        if let Some(token) = store.get(SYNC_TABLE, SYNC_TOKEN_KEY).await? {
            if let Some(token) = token.as_str() {
                *write(&self.inner.next_batch) = Some(token.to_owned());
            }
        }

        for (data_type, content) in store.get_all(ACCOUNT_DATA_TABLE).await? {
            write(&self.inner.account_data).insert(data_type, content);
        }

        let snapshots = store.get_all(ROOMS_TABLE).await?;
        let count = snapshots.len();
        for (_, value) in snapshots {
            let snapshot: RoomSnapshot = serde_json::from_value(value)?;
            let room_id: OwnedRoomId = snapshot
                .id
                .as_str()
                .try_into()
                .map_err(|_| Error::Store(format!("bad room id in snapshot: {}", snapshot.id)))?;
            let (room, _) = self.inner.room_or_create(&room_id);
            room.restore(snapshot);
        }
        info!(rooms = count, "replayed persisted state");
        Ok(())
    }
}
