//! RoomEventDispatcher - Sole entry point for producing room events.
//!
//! Every event is published on its room's broadcast channel. Stateful
//! events are additionally published, with the same encoded bytes, on the
//! fleet-wide stateful channel. The two publishes are independent: both
//! are always attempted and the error says which one failed.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::domain::foundation::RoomId;
use crate::domain::room::{encode, ChannelKey, EncodeError, Envelope, RoomEvent};
use crate::ports::{BusConnectionFactory, PublishError, Publisher};

/// Failure of a room event dispatch.
///
/// No partial success is reported as success; inspect
/// [`broadcast_delivered`](Self::broadcast_delivered) to learn whether
/// live clients saw the event.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("No publisher available: {0}")]
    PublisherUnavailable(#[source] PublishError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("Broadcast to room {room_id} failed: {source}")]
    BroadcastFailed {
        room_id: RoomId,
        #[source]
        source: PublishError,
    },

    #[error("Stateful publish for room {room_id} failed after broadcast was delivered: {source}")]
    StatefulFailed {
        room_id: RoomId,
        #[source]
        source: PublishError,
    },

    #[error("Both publishes for room {room_id} failed: {broadcast}; {stateful}")]
    BothFailed {
        room_id: RoomId,
        broadcast: PublishError,
        stateful: PublishError,
    },

    #[error("Dispatch cancelled (broadcast delivered: {broadcast_delivered})")]
    Cancelled { broadcast_delivered: bool },
}

impl DispatchError {
    /// Returns true if the room broadcast reached the broker.
    pub fn broadcast_delivered(&self) -> bool {
        match self {
            DispatchError::StatefulFailed { .. } => true,
            DispatchError::Cancelled {
                broadcast_delivered,
            } => *broadcast_delivered,
            _ => false,
        }
    }

    /// Returns true if the broker connection is gone for good.
    pub fn is_connection_lost(&self) -> bool {
        let lost = |e: &PublishError| matches!(e, PublishError::ConnectionLost);
        match self {
            DispatchError::PublisherUnavailable(e) => lost(e),
            DispatchError::BroadcastFailed { source, .. }
            | DispatchError::StatefulFailed { source, .. } => lost(source),
            DispatchError::BothFailed {
                broadcast,
                stateful,
                ..
            } => lost(broadcast) || lost(stateful),
            DispatchError::Encode(_) | DispatchError::Cancelled { .. } => false,
        }
    }
}

/// Publishes room events onto the bus.
///
/// # Example
///
/// ```ignore
/// let dispatcher = RoomEventDispatcher::new(connections.clone());
///
/// let event = RoomEvent::new_stateful(room_id, event_types::CHAT_MESSAGE, payload)?;
/// dispatcher.write(&event).await?;
/// ```
pub struct RoomEventDispatcher {
    connections: Arc<dyn BusConnectionFactory>,
}

impl RoomEventDispatcher {
    pub fn new(connections: Arc<dyn BusConnectionFactory>) -> Self {
        Self { connections }
    }

    /// Publish `event` to its room, and to the stateful channel if stateful.
    pub async fn write(&self, event: &RoomEvent) -> Result<(), DispatchError> {
        self.write_cancellable(event, &CancellationToken::new()).await
    }

    /// Like [`write`](Self::write), abandoning pending publishes once
    /// `cancel` fires.
    pub async fn write_cancellable(
        &self,
        event: &RoomEvent,
        cancel: &CancellationToken,
    ) -> Result<(), DispatchError> {
        let publisher = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(DispatchError::Cancelled { broadcast_delivered: false });
            }
            publisher = self.connections.publisher() => {
                publisher.map_err(DispatchError::PublisherUnavailable)?
            }
        };

        let encoded = encode(event)?;
        let room_id = *event.room_id();

        let broadcast = publish_or_cancel(
            publisher.as_ref(),
            &ChannelKey::room(&room_id),
            &Envelope::BroadcastToRoom(encoded.clone()),
            cancel,
        )
        .await;

        if let Err(PublishError::Cancelled) = broadcast {
            return Err(DispatchError::Cancelled {
                broadcast_delivered: false,
            });
        }

        if !event.is_stateful() {
            return broadcast.map_err(|source| {
                log_failure(event, "broadcast", &source);
                DispatchError::BroadcastFailed { room_id, source }
            });
        }

        let stateful = publish_or_cancel(
            publisher.as_ref(),
            &ChannelKey::stateful(),
            &Envelope::Received(encoded),
            cancel,
        )
        .await;

        match (broadcast, stateful) {
            (Ok(()), Ok(())) => Ok(()),
            (broadcast, Err(PublishError::Cancelled)) => Err(DispatchError::Cancelled {
                broadcast_delivered: broadcast.is_ok(),
            }),
            (Err(source), Ok(())) => {
                log_failure(event, "broadcast", &source);
                Err(DispatchError::BroadcastFailed { room_id, source })
            }
            (Ok(()), Err(source)) => {
                log_failure(event, "stateful", &source);
                Err(DispatchError::StatefulFailed { room_id, source })
            }
            (Err(broadcast), Err(stateful)) => {
                log_failure(event, "broadcast", &broadcast);
                log_failure(event, "stateful", &stateful);
                Err(DispatchError::BothFailed {
                    room_id,
                    broadcast,
                    stateful,
                })
            }
        }
    }
}

async fn publish_or_cancel(
    publisher: &dyn Publisher,
    key: &ChannelKey,
    envelope: &Envelope,
    cancel: &CancellationToken,
) -> Result<(), PublishError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PublishError::Cancelled),
        result = publisher.publish(key, envelope) => result,
    }
}

fn log_failure(event: &RoomEvent, step: &'static str, error: &PublishError) {
    tracing::warn!(
        room_id = %event.room_id(),
        event_id = %event.event_id(),
        event_type = event.event_type(),
        step,
        error = %error,
        "Room event publish failed"
    );
}
