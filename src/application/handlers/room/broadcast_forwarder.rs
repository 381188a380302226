//! RoomBroadcastForwarder - Hands room broadcasts to local clients.

use async_trait::async_trait;
use std::sync::Arc;

use crate::domain::foundation::DomainError;
use crate::domain::room::{ChannelKey, Envelope};
use crate::ports::{EnvelopeHandler, LocalConnections};

/// Envelope handler for per-room channels.
///
/// Decodes each `BroadcastToRoom` envelope and forwards the event to the
/// clients connected to this process. Undecodable payloads, stateful
/// envelopes and events addressed to another room are logged and dropped.
pub struct RoomBroadcastForwarder {
    local: Arc<dyn LocalConnections>,
}

impl RoomBroadcastForwarder {
    pub fn new(local: Arc<dyn LocalConnections>) -> Self {
        Self { local }
    }
}

#[async_trait]
impl EnvelopeHandler for RoomBroadcastForwarder {
    async fn handle(&self, key: &ChannelKey, envelope: Envelope) -> Result<(), DomainError> {
        let payload = match envelope {
            Envelope::BroadcastToRoom(payload) => payload,
            Envelope::Received(_) => {
                tracing::warn!(channel = %key, "Ignoring stateful envelope on room channel");
                return Ok(());
            }
        };

        let event = match payload.decode() {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(channel = %key, error = %e, "Dropping undecodable room event");
                return Ok(());
            }
        };

        let room_id = *event.room_id();
        if key.room_id().is_some_and(|expected| expected != room_id) {
            tracing::warn!(
                channel = %key,
                room_id = %room_id,
                event_id = %event.event_id(),
                "Dropping room event published on another room's channel"
            );
            return Ok(());
        }

        self.local.forward_to_local_connections(&room_id, event).await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "RoomBroadcastForwarder"
    }
}
