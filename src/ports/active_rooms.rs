//! ActiveRoomSet port - Which rooms have local listeners on this process.
//!
//! Owned and mutated by the connection layer (WebSocket handling). The
//! subscription controller only reads it: a room's broker channel is
//! subscribed exactly while the room is active here.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::domain::foundation::RoomId;

/// A room gained its first local listener or lost its last one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomActivityChange {
    pub room_id: RoomId,
    pub became_active: bool,
}

impl RoomActivityChange {
    pub fn activated(room_id: RoomId) -> Self {
        Self {
            room_id,
            became_active: true,
        }
    }

    pub fn deactivated(room_id: RoomId) -> Self {
        Self {
            room_id,
            became_active: false,
        }
    }
}

/// Port exposing local room activity.
///
/// Change notifications are delivered over a bounded broadcast channel. A
/// receiver that lags must resynchronise from [`active_rooms`](Self::active_rooms).
#[async_trait]
pub trait ActiveRoomSet: Send + Sync {
    /// Subscribe to activation / deactivation notifications.
    fn changes(&self) -> broadcast::Receiver<RoomActivityChange>;

    /// Snapshot of rooms with at least one local listener.
    async fn active_rooms(&self) -> Vec<RoomId>;
}
