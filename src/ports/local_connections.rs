//! LocalConnections port - Delivery to this process's client sockets.

use async_trait::async_trait;

use crate::domain::foundation::RoomId;
use crate::domain::room::RoomEvent;

/// Port for handing a decoded room event to the clients connected here.
///
/// Implementations deliver to every local socket in the room and must not
/// block on slow clients; a room with no local clients is a no-op.
#[async_trait]
pub trait LocalConnections: Send + Sync {
    async fn forward_to_local_connections(&self, room_id: &RoomId, event: RoomEvent);
}
