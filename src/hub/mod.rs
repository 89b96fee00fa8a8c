//! Connection hub: rooms keyed by channel and document id.
//!
//! The hub is constructed once at startup and passed to whoever needs it.
//! Each [`Channel`] journals into its own cache, and its rooms live under
//! [`Channel::room_key`].
//! Rooms are created on first join and retired as soon as their last member
//! leaves. Creation and retirement both happen under the map's shard lock for
//! that document, so a join can never land in a room that is being retired.

pub mod client;
pub mod room;

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::channel::ChannelCaches;
use crate::config::ClientConfig;
use crate::persister::OpenDocuments;

pub use self::client::{ClientActor, ClientHandle, ClientId, ClientIdentity, Disconnect, Frame};
pub use self::room::{Room, RoomSettings, RoomStats};
pub use crate::channel::{Channel, WireFormat};

/// Read-only snapshot for the observability endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub total_rooms: usize,
    pub total_clients: usize,
    /// Clients per room key (`{id}` or `note:{id}`).
    pub rooms: BTreeMap<String, usize>,
}

pub struct Hub {
    rooms: DashMap<String, Arc<Room>>,
    caches: ChannelCaches,
    room_settings: RoomSettings,
    client: ClientConfig,
}

impl Hub {
    pub fn new(caches: ChannelCaches, client: ClientConfig) -> Self {
        Self::with_room_settings(caches, client, RoomSettings::default())
    }

    pub fn with_room_settings(
        caches: ChannelCaches,
        client: ClientConfig,
        room_settings: RoomSettings,
    ) -> Self {
        Self {
            rooms: DashMap::new(),
            caches,
            room_settings,
            client,
        }
    }

    fn create_room(&self, channel: Channel, doc_id: &str) -> Arc<Room> {
        info!(doc_id, channel = channel.name(), "Created room");
        Room::new(doc_id, self.caches.get(channel).clone(), self.room_settings)
    }

    /// Existing room for `doc_id` on `channel`, or a new one. Concurrent
    /// callers for the same key always get the same instance.
    pub fn get_or_create_room(&self, channel: Channel, doc_id: &str) -> Arc<Room> {
        self.rooms
            .entry(channel.room_key(doc_id))
            .or_insert_with(|| self.create_room(channel, doc_id))
            .clone()
    }

    pub fn room(&self, channel: Channel, doc_id: &str) -> Option<Arc<Room>> {
        self.rooms
            .get(&channel.room_key(doc_id))
            .map(|room| room.value().clone())
    }

    /// Register `handle` in the room for `doc_id`, creating it if needed.
    pub fn join(&self, channel: Channel, doc_id: &str, handle: ClientHandle) -> Arc<Room> {
        let room = self
            .rooms
            .entry(channel.room_key(doc_id))
            .or_insert_with(|| self.create_room(channel, doc_id));
        room.register(handle);
        room.clone()
    }

    /// Remove a client; retire the room if it became empty.
    pub fn leave(&self, channel: Channel, doc_id: &str, client_id: ClientId) {
        let key = channel.room_key(doc_id);
        let retired = self.rooms.remove_if(&key, |_, room| {
            room.unregister(client_id);
            room.is_empty()
        });
        if let Some((_, room)) = retired {
            room.close();
            info!(room = %key, "Retired empty room");
        }
    }

    /// Create the actor for a freshly admitted connection. The client is a
    /// room member when this returns.
    pub fn connect(
        self: &Arc<Self>,
        channel: Channel,
        doc_id: &str,
        identity: ClientIdentity,
    ) -> ClientActor {
        let (handle, outbound) = ClientHandle::channel(identity.clone(), self.client.outbound_queue);
        let id = handle.id();
        let room = self.join(channel, doc_id, handle);
        ClientActor::new(
            id,
            channel,
            identity,
            room,
            self.clone(),
            outbound,
            self.client.ping_interval(),
        )
    }

    /// Whether `doc_id` currently has a live room on `channel`.
    pub fn is_open(&self, channel: Channel, doc_id: &str) -> bool {
        self.rooms.contains_key(&channel.room_key(doc_id))
    }

    /// Open-room query for one channel's persister.
    pub fn open_rooms(self: &Arc<Self>, channel: Channel) -> OpenRooms {
        OpenRooms {
            hub: self.clone(),
            channel,
        }
    }

    pub fn stats(&self) -> HubStats {
        let mut stats = HubStats::default();
        for entry in self.rooms.iter() {
            let count = entry.value().client_count();
            stats.total_rooms += 1;
            stats.total_clients += count;
            stats.rooms.insert(entry.key().clone(), count);
        }
        stats
    }

    /// Retire rooms that were created but never joined, or whose members
    /// were all evicted.
    pub fn retire_empty_rooms(&self) -> usize {
        let empty: Vec<String> = self
            .rooms
            .iter()
            .filter(|entry| entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect();

        let mut retired = 0;
        for key in empty {
            if let Some((_, room)) = self.rooms.remove_if(&key, |_, room| room.is_empty()) {
                room.close();
                retired += 1;
            }
        }
        if retired > 0 {
            debug!(retired, "Swept empty rooms");
        }
        retired
    }

    /// Periodically call [`Hub::retire_empty_rooms`].
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let hub = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match hub.upgrade() {
                    Some(hub) => {
                        hub.retire_empty_rooms();
                    }
                    None => break,
                }
            }
        })
    }

    /// Disconnect every client, retire every room and wait until all
    /// updates already received have been handed to the cache.
    pub async fn shutdown(&self) {
        let keys: Vec<String> = self.rooms.iter().map(|entry| entry.key().clone()).collect();
        let mut closed = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, room)) = self.rooms.remove(&key) {
                room.close();
                closed.push(room);
            }
        }
        for room in &closed {
            room.wait_drained().await;
        }
        info!(rooms = closed.len(), "Hub shut down");
    }
}

/// [`OpenDocuments`] view of the hub for a single channel.
pub struct OpenRooms {
    hub: Arc<Hub>,
    channel: Channel,
}

impl OpenDocuments for OpenRooms {
    fn is_open(&self, doc_id: &str) -> bool {
        self.hub.is_open(self.channel, doc_id)
    }
}
