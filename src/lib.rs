//! # Collab Relay
//!
//! Real-time relay and durability pipeline for collaborative documents.
//!
//! Clients connect over WebSocket to a document room and exchange opaque
//! CRDT update payloads. Binary documents and text notes are separate
//! [`Channel`]s with their own rooms, cache keys and durable tables. The
//! relay:
//!
//! - **Fans out** every update to the other members of the room, in one
//!   room-wide order, without ever waiting on a slow client.
//! - **Journals** every update into a fast cache (Redis or in-process) so
//!   late joiners can catch up and nothing is lost between compactions.
//! - **Compacts** the cached update log into durable storage on a schedule,
//!   merging it onto the last stored state.
//!
//! The relay never interprets payloads. Merging is delegated to an
//! [`UpdateMerger`]; the default [`YrsMerger`] understands Yjs v1 updates.
//!
//! ## Example
//!
//! ```rust,no_run
//! use collab_relay::{ChannelCaches, ClientConfig, Hub, MemoryCache};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn demo() {
//! let caches = ChannelCaches::new(
//!     Arc::new(MemoryCache::new(Duration::from_secs(3600), 1000)),
//!     Arc::new(MemoryCache::new(Duration::from_secs(3600), 1000)),
//! );
//! let hub = Arc::new(Hub::new(caches, ClientConfig::default()));
//! println!("rooms: {}", hub.stats().total_rooms);
//! # }
//! ```

pub mod cache;
pub mod channel;
pub mod config;
pub mod error;
pub mod hub;
pub mod merge;
pub mod persister;
pub mod server;
pub mod storage;

pub use cache::{FastCache, MemoryCache, RedisCache};
pub use channel::{Channel, ChannelCaches, WireFormat};
pub use config::{CacheBackend, ClientConfig, Config};
pub use error::{CollabError, Result};
pub use hub::{ClientIdentity, Hub, HubStats, Room};
pub use merge::{MergedState, TranscriptMerger, UpdateMerger, YrsMerger};
pub use persister::{OpenDocuments, PassReport, Persister, PersisterState};
pub use storage::{DocumentStore, SqliteStore, StoredState};
