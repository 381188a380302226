//! StatefulEventConsumer - Applies stateful events received on the stateful channel.

use async_trait::async_trait;
use std::sync::Arc;

use crate::domain::foundation::DomainError;
use crate::domain::room::{ChannelKey, Envelope};
use crate::ports::{EnvelopeHandler, StatefulEventHandler};

/// Envelope handler for the stateful channel.
///
/// Invoked on every process for every stateful event, so the wrapped
/// handler runs once per process per event. Wrap it in
/// [`IdempotentStatefulHandler`](crate::adapters::IdempotentStatefulHandler)
/// to apply each event once per processed-event store.
pub struct StatefulEventConsumer {
    handler: Arc<dyn StatefulEventHandler>,
}

impl StatefulEventConsumer {
    pub fn new(handler: Arc<dyn StatefulEventHandler>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl EnvelopeHandler for StatefulEventConsumer {
    async fn handle(&self, key: &ChannelKey, envelope: Envelope) -> Result<(), DomainError> {
        let payload = match envelope {
            Envelope::Received(payload) => payload,
            Envelope::BroadcastToRoom(_) => {
                tracing::warn!(channel = %key, "Ignoring room broadcast on stateful channel");
                return Ok(());
            }
        };

        let event = match payload.decode() {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(channel = %key, error = %e, "Dropping undecodable stateful event");
                return Ok(());
            }
        };

        let event_id = event.event_id().clone();
        let room_id = *event.room_id();

        tracing::debug!(
            event_id = %event_id,
            room_id = %room_id,
            event_type = event.event_type(),
            handler = self.handler.name(),
            "Applying stateful event"
        );

        self.handler.apply_stateful_event(event).await.map_err(|e| {
            e.with_detail("event_id", event_id.as_str())
                .with_detail("room_id", room_id.to_string())
        })
    }

    fn name(&self) -> &'static str {
        "StatefulEventConsumer"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::foundation::{ErrorCode, RoomId};
    use crate::domain::room::{encode, RoomEvent};
    use serde_json::json;
    use std::sync::Mutex;

    struct RecordingHandler {
        applied: Mutex<Vec<RoomEvent>>,
        fail: bool,
    }

    impl RecordingHandler {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                applied: Mutex::new(Vec::new()),
                fail,
            })
        }
    }

    #[async_trait]
    impl StatefulEventHandler for RecordingHandler {
        async fn apply_stateful_event(&self, event: RoomEvent) -> Result<(), DomainError> {
            if self.fail {
                return Err(DomainError::new(ErrorCode::DatabaseError, "write failed"));
            }
            self.applied.lock().unwrap().push(event);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "RecordingHandler"
        }
    }

    fn stateful_event() -> RoomEvent {
        RoomEvent::new_stateful(RoomId::new(), "code_editor.changed", json!({"rev": 3})).unwrap()
    }

    #[tokio::test]
    async fn applies_received_event() {
        let handler = RecordingHandler::new(false);
        let consumer = StatefulEventConsumer::new(handler.clone());
        let event = stateful_event();

        consumer
            .handle(&ChannelKey::stateful(), Envelope::Received(encode(&event).unwrap()))
            .await
            .unwrap();

        assert_eq!(*handler.applied.lock().unwrap(), vec![event]);
    }

    #[tokio::test]
    async fn broadcast_envelope_is_not_applied() {
        let handler = RecordingHandler::new(false);
        let consumer = StatefulEventConsumer::new(handler.clone());
        let event = stateful_event();

        consumer
            .handle(
                &ChannelKey::stateful(),
                Envelope::BroadcastToRoom(encode(&event).unwrap()),
            )
            .await
            .unwrap();

        assert!(handler.applied.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn handler_failure_carries_event_identity() {
        let consumer = StatefulEventConsumer::new(RecordingHandler::new(true));
        let event = stateful_event();

        let err = consumer
            .handle(&ChannelKey::stateful(), Envelope::Received(encode(&event).unwrap()))
            .await
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::DatabaseError);
        assert_eq!(
            err.details.get("event_id").map(String::as_str),
            Some(event.event_id().as_str())
        );
    }
}
