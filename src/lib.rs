//! roomsync is a client-side sync engine for federated, room-based chat.
//!
//! It drives the long-poll sync loop against a pluggable transport
//! ([`Fetcher`]), maintains per-room state with derived-field caches,
//! resolves event relations (edits, reactions, replies, redactions)
//! regardless of delivery order, reconciles optimistic local echoes with
//! their server events, and snapshots everything through a pluggable
//! [`Store`] so a restart resumes where it left off.
//!
//! ```no_run
//! use std::sync::Arc;
//! use roomsync::{Client, ClientConfig};
//! # async fn run(fetcher: Arc<dyn roomsync::Fetcher>) -> roomsync::Result<()> {
//! let config = ClientConfig::new(ruma::user_id!("@me:example.org").to_owned());
//! let client = Client::new(config, fetcher);
//! let mut events = client.subscribe();
//! client.start().await?;
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod client;
pub mod config;
pub mod event;
pub mod fetcher;
pub mod graph;
pub mod invite;
pub mod members;
pub mod persist;
pub mod power;
pub mod retry;
pub mod room;
pub mod sync;
pub mod timeline;

pub use roomsync_common::{Error, Result};

pub use crate::client::{Client, ClientEvent};
pub use crate::config::{ClientConfig, TimelinePolicy};
pub use crate::event::{EphemeralEvent, Event, EventKind, LocalStatus};
pub use crate::fetcher::Fetcher;
pub use crate::invite::Invite;
pub use crate::members::Member;
pub use crate::persist::{MemoryStore, RoomSnapshot, Store};
pub use crate::power::PowerLevels;
pub use crate::retry::RetryPolicy;
pub use crate::room::{Room, RoomMeta};
pub use crate::sync::SyncStatus;
pub use crate::timeline::Direction;
