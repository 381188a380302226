//! Delivery loop shared by the subscriber adapters.
//!
//! Pulls raw messages off a broker stream, parses the envelope and hands it
//! to the subscription's handler, one message at a time. Undecodable
//! messages and handler failures are logged and skipped.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::domain::room::{ChannelKey, Envelope};
use crate::ports::EnvelopeHandler;

/// Why a delivery loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeliveryEnd {
    /// The subscription was released.
    Cancelled,
    /// The broker stream closed underneath the subscription.
    StreamClosed,
}

/// Runs until `cancel` fires or `messages` ends.
///
/// On stream end the token is cancelled so the owning `Subscription`
/// reports itself inactive.
pub(crate) async fn run_delivery_loop<S>(
    key: ChannelKey,
    messages: S,
    handler: Arc<dyn EnvelopeHandler>,
    cancel: CancellationToken,
) -> DeliveryEnd
where
    S: Stream<Item = Vec<u8>> + Send,
{
    futures::pin_mut!(messages);

    loop {
        let bytes = tokio::select! {
            biased;
            _ = cancel.cancelled() => return DeliveryEnd::Cancelled,
            next = messages.next() => match next {
                Some(bytes) => bytes,
                None => {
                    tracing::debug!(channel = %key, "Broker stream closed");
                    cancel.cancel();
                    return DeliveryEnd::StreamClosed;
                }
            },
        };

        deliver(&key, &bytes, handler.as_ref()).await;
    }
}

async fn deliver(key: &ChannelKey, bytes: &[u8], handler: &dyn EnvelopeHandler) {
    let envelope = match Envelope::from_bytes(bytes) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(channel = %key, error = %e, "Dropping undecodable envelope");
            return;
        }
    };

    if let Err(e) = handler.handle(key, envelope).await {
        tracing::warn!(
            channel = %key,
            handler = handler.name(),
            error = %e,
            details = ?e.details,
            "Envelope handler failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::foundation::{DomainError, RoomId};
    use crate::domain::room::{encode, EnvelopeKind, RoomEvent};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct RecordingHandler {
        seen: Mutex<Vec<EnvelopeKind>>,
    }

    #[async_trait]
    impl EnvelopeHandler for RecordingHandler {
        async fn handle(&self, _key: &ChannelKey, envelope: Envelope) -> Result<(), DomainError> {
            self.seen.lock().unwrap().push(envelope.kind());
            Ok(())
        }

        fn name(&self) -> &'static str {
            "RecordingHandler"
        }
    }

    fn envelope_bytes(kind: EnvelopeKind) -> Vec<u8> {
        let event =
            RoomEvent::new(RoomId::new(), "reaction.added", json!({"emoji": "+1"})).unwrap();
        Envelope::new(kind, encode(&event).unwrap()).to_bytes().unwrap()
    }

    fn receiver_stream(rx: mpsc::UnboundedReceiver<Vec<u8>>) -> impl Stream<Item = Vec<u8>> {
        futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|m| (m, rx)) })
    }

    #[tokio::test]
    async fn garbage_is_skipped_and_loop_continues() {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = Arc::new(RecordingHandler { seen: Mutex::new(Vec::new()) });

        tx.send(b"{not json".to_vec()).unwrap();
        tx.send(envelope_bytes(EnvelopeKind::BroadcastToRoom)).unwrap();
        tx.send(b"{\"kind\":\"unknown\",\"payload\":{}}".to_vec()).unwrap();
        tx.send(envelope_bytes(EnvelopeKind::Received)).unwrap();
        drop(tx);

        let cancel = CancellationToken::new();
        let end = run_delivery_loop(
            ChannelKey::stateful(),
            receiver_stream(rx),
            handler.clone(),
            cancel.clone(),
        )
        .await;

        assert_eq!(end, DeliveryEnd::StreamClosed);
        assert!(cancel.is_cancelled());
        assert_eq!(
            *handler.seen.lock().unwrap(),
            vec![EnvelopeKind::BroadcastToRoom, EnvelopeKind::Received]
        );
    }

    #[tokio::test]
    async fn cancelled_loop_delivers_nothing_further() {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = Arc::new(RecordingHandler { seen: Mutex::new(Vec::new()) });
        let cancel = CancellationToken::new();
        cancel.cancel();

        tx.send(envelope_bytes(EnvelopeKind::BroadcastToRoom)).unwrap();

        let end = run_delivery_loop(
            ChannelKey::stateful(),
            receiver_stream(rx),
            handler.clone(),
            cancel,
        )
        .await;

        assert_eq!(end, DeliveryEnd::Cancelled);
        assert!(handler.seen.lock().unwrap().is_empty());
    }
}
