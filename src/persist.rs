//! Persistence collaborator.
//!
//! The engine snapshots its state through a key-value [`Store`] with named
//! tables and JSON values. On start the snapshot is replayed before the
//! first sync, so rooms render immediately and the saved sync token resumes
//! the delta stream. [`MemoryStore`] is the in-process implementation used
//! by default and by tests.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use roomsync_common::{Error, Result};

use crate::api::{AccountDataEvent, RawEvent, RoomSummary, UnreadNotifications};

/// Table holding the sync token under [`SYNC_TOKEN_KEY`].
pub const SYNC_TABLE: &str = "sync";
pub const SYNC_TOKEN_KEY: &str = "next_batch";
/// Table of room snapshots keyed by room id.
pub const ROOMS_TABLE: &str = "rooms";
/// Table of global account data keyed by data type.
pub const ACCOUNT_DATA_TABLE: &str = "account_data";

#[async_trait]
pub trait Store: Send + Sync {
    async fn open(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
    /// Drop every table. Used when the saved state is unusable.
    async fn clear(&self) -> Result<()>;

    async fn get(&self, table: &str, key: &str) -> Result<Option<JsonValue>>;
    async fn get_all(&self, table: &str) -> Result<Vec<(String, JsonValue)>>;
    async fn put(&self, table: &str, key: &str, value: JsonValue) -> Result<()>;
    async fn put_all(&self, table: &str, entries: Vec<(String, JsonValue)>) -> Result<()>;
    async fn delete(&self, table: &str, key: &str) -> Result<()>;
    async fn delete_all(&self, table: &str) -> Result<()>;
}

/// What survives a restart for one joined room: full state, account data,
/// the tail of the visible timeline and the token to page further back.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub id: String,
    #[serde(default)]
    pub state: Vec<RawEvent>,
    #[serde(default)]
    pub account_data: Vec<AccountDataEvent>,
    #[serde(default)]
    pub timeline: Vec<RawEvent>,
    #[serde(default)]
    pub prev_batch: Option<String>,
    #[serde(default)]
    pub notifications: UnreadNotifications,
    #[serde(default)]
    pub summary: RoomSummary,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, HashMap<String, JsonValue>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, HashMap<String, JsonValue>>>> {
        self.tables
            .write()
            .map_err(|_| Error::Store("store lock poisoned".to_owned()))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.lock()?.clear();
        Ok(())
    }

    async fn get(&self, table: &str, key: &str) -> Result<Option<JsonValue>> {
        Ok(self
            .lock()?
            .get(table)
            .and_then(|t| t.get(key))
            .cloned())
    }

    async fn get_all(&self, table: &str) -> Result<Vec<(String, JsonValue)>> {
        Ok(self
            .lock()?
            .get(table)
            .map(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn put(&self, table: &str, key: &str, value: JsonValue) -> Result<()> {
        self.lock()?
            .entry(table.to_owned())
            .or_default()
            .insert(key.to_owned(), value);
        Ok(())
    }

    async fn put_all(&self, table: &str, entries: Vec<(String, JsonValue)>) -> Result<()> {
        let mut tables = self.lock()?;
        let table = tables.entry(table.to_owned()).or_default();
        for (key, value) in entries {
            table.insert(key, value);
        }
        Ok(())
    }

    async fn delete(&self, table: &str, key: &str) -> Result<()> {
        if let Some(table) = self.lock()?.get_mut(table) {
            table.remove(key);
        }
        Ok(())
    }

    async fn delete_all(&self, table: &str) -> Result<()> {
        self.lock()?.remove(table);
        Ok(())
    }
}
