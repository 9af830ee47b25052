//! Scripted transport for driving the engine in tests.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use ruma::{OwnedEventId, RoomId, UserId};
use serde_json::Value as JsonValue;

use roomsync::api::{
    FilterDefinition, MembersResponse, MessagesResponse, RawEvent, SyncResponse,
};
use roomsync::{Direction, Error, Fetcher, Result};

/// A fetcher fed from queues. `sync` polls its queue, so a test can push
/// deltas after the loop is already parked on an empty long poll.
#[derive(Default)]
pub struct MockFetcher {
    syncs: Mutex<VecDeque<Result<SyncResponse>>>,
    messages: Mutex<VecDeque<Result<MessagesResponse>>>,
    states: Mutex<VecDeque<Vec<RawEvent>>>,
    send_failures: Mutex<VecDeque<Error>>,
    pub sync_since: Mutex<Vec<Option<String>>>,
    pub sync_filters: Mutex<Vec<Option<String>>>,
    pub messages_calls: AtomicUsize,
    pub messages_delay: Mutex<Option<Duration>>,
    pub sent: Mutex<Vec<(String, JsonValue, String)>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_sync(&self, response: Result<SyncResponse>) {
        self.syncs.lock().unwrap().push_back(response);
    }

    pub fn push_messages(&self, response: Result<MessagesResponse>) {
        self.messages.lock().unwrap().push_back(response);
    }

    pub fn push_state(&self, state: Vec<RawEvent>) {
        self.states.lock().unwrap().push_back(state);
    }

    pub fn fail_next_send(&self, err: Error) {
        self.send_failures.lock().unwrap().push_back(err);
    }

    pub fn sync_calls(&self) -> usize {
        self.sync_since.lock().unwrap().len()
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn sync(
        &self,
        since: Option<&str>,
        filter: Option<&str>,
        _timeout: Duration,
    ) -> Result<SyncResponse> {
        self.sync_since
            .lock()
            .unwrap()
            .push(since.map(str::to_owned));
        self.sync_filters
            .lock()
            .unwrap()
            .push(filter.map(str::to_owned));
        loop {
            if let Some(response) = self.syncs.lock().unwrap().pop_front() {
                return response;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn create_filter(&self, _user_id: &UserId, _filter: &FilterDefinition) -> Result<String> {
        Ok("filter-1".to_owned())
    }

    async fn send_event(
        &self,
        _room_id: &RoomId,
        event_type: &str,
        content: &JsonValue,
        transaction_id: &str,
    ) -> Result<OwnedEventId> {
        if let Some(err) = self.send_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.sent.lock().unwrap().push((
            event_type.to_owned(),
            content.clone(),
            transaction_id.to_owned(),
        ));
        Ok("$sent:example.org".try_into().unwrap())
    }

    async fn send_state(
        &self,
        _room_id: &RoomId,
        _event_type: &str,
        _state_key: &str,
        _content: &JsonValue,
    ) -> Result<OwnedEventId> {
        Ok("$state:example.org".try_into().unwrap())
    }

    async fn redact(
        &self,
        _room_id: &RoomId,
        _event_id: &str,
        _reason: Option<&str>,
        _transaction_id: &str,
    ) -> Result<OwnedEventId> {
        Ok("$redaction:example.org".try_into().unwrap())
    }

    async fn messages(
        &self,
        _room_id: &RoomId,
        _from: &str,
        _direction: Direction,
        _limit: u32,
    ) -> Result<MessagesResponse> {
        self.messages_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.messages_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.messages.lock().unwrap().pop_front() {
            Some(response) => response,
            None => Ok(MessagesResponse::default()),
        }
    }

    async fn state(&self, _room_id: &RoomId) -> Result<Vec<RawEvent>> {
        Ok(self.states.lock().unwrap().pop_front().unwrap_or_default())
    }

    async fn members(
        &self,
        _room_id: &RoomId,
        _membership: Option<&str>,
    ) -> Result<MembersResponse> {
        Ok(MembersResponse::default())
    }
}
