//! Transport abstraction.
//!
//! The engine never talks HTTP itself; it drives a [`Fetcher`] and leaves
//! authentication, retries at the wire level and endpoint shapes to the
//! implementation. Tests script one in memory.

use std::time::Duration;

use async_trait::async_trait;
use ruma::{OwnedEventId, RoomId, UserId};
use serde_json::Value as JsonValue;

use roomsync_common::Result;

use crate::api::{FilterDefinition, MembersResponse, MessagesResponse, SyncResponse};
use crate::timeline::Direction;

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Long-poll for the next sync delta. `since` is absent on the initial
    /// sync. Cancellation is handled by the caller dropping the future.
    async fn sync(
        &self,
        since: Option<&str>,
        filter: Option<&str>,
        timeout: Duration,
    ) -> Result<SyncResponse>;

    /// Register a sync filter, returning its server-assigned id.
    async fn create_filter(&self, user_id: &UserId, filter: &FilterDefinition) -> Result<String>;

    /// Send a timeline event. The transaction id makes the request
    /// idempotent and is echoed back in the sync delta.
    async fn send_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: &JsonValue,
        transaction_id: &str,
    ) -> Result<OwnedEventId>;

    async fn send_state(
        &self,
        room_id: &RoomId,
        event_type: &str,
        state_key: &str,
        content: &JsonValue,
    ) -> Result<OwnedEventId>;

    async fn redact(
        &self,
        room_id: &RoomId,
        event_id: &str,
        reason: Option<&str>,
        transaction_id: &str,
    ) -> Result<OwnedEventId>;

    /// Fetch a page of history starting at `from` in the given direction.
    async fn messages(
        &self,
        room_id: &RoomId,
        from: &str,
        direction: Direction,
        limit: u32,
    ) -> Result<MessagesResponse>;

    /// Full current state of a room. Used when an invite is accepted, since
    /// the stripped invite state is not trustworthy.
    async fn state(&self, room_id: &RoomId) -> Result<Vec<crate::api::RawEvent>>;

    /// Room members, optionally filtered by membership value.
    async fn members(&self, room_id: &RoomId, membership: Option<&str>)
        -> Result<MembersResponse>;
}
