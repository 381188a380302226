//! Local room registry for client connections on this process.
//!
//! Rooms are keyed by room ID; each room owns a broadcast channel that
//! every locally connected client of the room receives from.
//!
//! # Architecture
//!
//! ```text
//! Room: 3f2a…          Room: 9c41…
//! ├── client-a         ├── client-d
//! ├── client-b         └── client-e
//! └── client-c
//! ```
//!
//! The first client joining a room and the last client leaving it are
//! published as [`RoomActivityChange`]s, which drive the broker
//! subscription controller.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::config::BusConfig;
use crate::domain::foundation::RoomId;
use crate::domain::room::RoomEvent;
use crate::ports::{ActiveRoomSet, LocalConnections, RoomActivityChange};

const DEFAULT_CLIENT_CHANNEL_CAPACITY: usize = 64;

/// Unique identifier for a local client connection.
///
/// Generated server-side when a client connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Room {
    sender: broadcast::Sender<RoomEvent>,
    clients: HashSet<ClientId>,
}

#[derive(Default)]
struct Registry {
    rooms: HashMap<RoomId, Room>,
    client_rooms: HashMap<ClientId, RoomId>,
}

/// Tracks which local clients are in which room.
///
/// Implements [`ActiveRoomSet`] for the subscription controller and
/// [`LocalConnections`] for the room broadcast forwarder.
///
/// A client is in at most one room; joining another room leaves the
/// previous one.
pub struct LocalRoomRegistry {
    registry: RwLock<Registry>,
    changes: broadcast::Sender<RoomActivityChange>,
    channel_capacity: usize,
}

impl LocalRoomRegistry {
    /// # Arguments
    ///
    /// * `channel_capacity` - Buffer size of each room's client channel.
    ///   Slow clients that fall further behind miss events.
    /// * `change_capacity` - Buffer size of the activity change channel.
    pub fn new(channel_capacity: usize, change_capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(change_capacity);
        Self {
            registry: RwLock::new(Registry::default()),
            changes,
            channel_capacity,
        }
    }

    /// Registry sized from the bus config, with the default per-room buffer.
    pub fn from_config(config: &BusConfig) -> Self {
        Self::new(DEFAULT_CLIENT_CHANNEL_CAPACITY, config.room_change_capacity)
    }

    /// Join a client to a room, returning its event receiver.
    pub async fn join(
        &self,
        room_id: RoomId,
        client_id: ClientId,
    ) -> broadcast::Receiver<RoomEvent> {
        let mut registry = self.registry.write().await;

        if let Some(previous) = registry.client_rooms.get(&client_id).copied() {
            if previous != room_id {
                self.remove_client(&mut registry, previous, client_id);
            }
        }

        let capacity = self.channel_capacity;
        let room = registry.rooms.entry(room_id).or_insert_with(|| {
            let (sender, _) = broadcast::channel(capacity);
            Room {
                sender,
                clients: HashSet::new(),
            }
        });

        let first = room.clients.is_empty();
        room.clients.insert(client_id);
        let receiver = room.sender.subscribe();
        registry.client_rooms.insert(client_id, room_id);

        if first {
            tracing::debug!(room_id = %room_id, "Room became active");
            let _ = self.changes.send(RoomActivityChange::activated(room_id));
        }

        receiver
    }

    /// Remove a client from its room. Unknown clients are ignored.
    pub async fn leave(&self, client_id: &ClientId) {
        let mut registry = self.registry.write().await;
        if let Some(room_id) = registry.client_rooms.get(client_id).copied() {
            self.remove_client(&mut registry, room_id, *client_id);
        }
    }

    fn remove_client(&self, registry: &mut Registry, room_id: RoomId, client_id: ClientId) {
        registry.client_rooms.remove(&client_id);

        let now_empty = match registry.rooms.get_mut(&room_id) {
            Some(room) => room.clients.remove(&client_id) && room.clients.is_empty(),
            None => false,
        };

        if now_empty {
            registry.rooms.remove(&room_id);
            tracing::debug!(room_id = %room_id, "Room became inactive");
            let _ = self.changes.send(RoomActivityChange::deactivated(room_id));
        }
    }

    /// Number of local clients in a room (0 if unknown).
    pub async fn client_count(&self, room_id: &RoomId) -> usize {
        self.registry
            .read()
            .await
            .rooms
            .get(room_id)
            .map_or(0, |room| room.clients.len())
    }
}

#[async_trait]
impl ActiveRoomSet for LocalRoomRegistry {
    fn changes(&self) -> broadcast::Receiver<RoomActivityChange> {
        self.changes.subscribe()
    }

    async fn active_rooms(&self) -> Vec<RoomId> {
        self.registry.read().await.rooms.keys().copied().collect()
    }
}

#[async_trait]
impl LocalConnections for LocalRoomRegistry {
    async fn forward_to_local_connections(&self, room_id: &RoomId, event: RoomEvent) {
        let registry = self.registry.read().await;
        match registry.rooms.get(room_id) {
            // No receivers is fine; a client may be mid-reconnect.
            Some(room) => {
                let _ = room.sender.send(event);
            }
            None => {
                tracing::trace!(room_id = %room_id, "No local clients for room event");
            }
        }
    }
}
