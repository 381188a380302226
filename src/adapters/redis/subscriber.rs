//! Redis SUBSCRIBE adapter.

use async_trait::async_trait;
use futures::stream;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::adapters::delivery::{run_delivery_loop, DeliveryEnd};
use crate::domain::room::ChannelKey;
use crate::ports::{EnvelopeHandler, SubscribeError, Subscriber, Subscription};

use super::connection::RedisConnectionManager;

/// Subscribes channels on the manager's shared pub/sub connection.
///
/// Each subscription owns a route on that connection; releasing it
/// unsubscribes the channel once no other route needs it. When the shared
/// connection drops, every route ends and the outage is reported to the
/// connection manager, whose `Reconnected` event prompts resubscription.
#[derive(Debug, Clone)]
pub struct RedisSubscriber {
    manager: RedisConnectionManager,
}

impl RedisSubscriber {
    pub fn new(manager: RedisConnectionManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Subscriber for RedisSubscriber {
    async fn subscribe(
        &self,
        key: &ChannelKey,
        handler: Arc<dyn EnvelopeHandler>,
    ) -> Result<Subscription, SubscribeError> {
        let channel = key.broker_channel(self.manager.channel_prefix());
        let session = self.manager.pubsub().await?;
        let (route, receiver) = session
            .subscribe(&channel, self.manager.subscribe_timeout())
            .await?;

        tracing::debug!(channel = %channel, handler = handler.name(), "Subscribed");

        let messages = stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|bytes| (bytes, receiver))
        });

        let cancel = CancellationToken::new();
        let task = {
            let key = key.clone();
            let cancel = cancel.clone();
            let manager = self.manager.clone();
            tokio::spawn(async move {
                match run_delivery_loop(key, messages, handler, cancel).await {
                    DeliveryEnd::StreamClosed => {
                        manager.report_connection_lost("subscription stream closed");
                    }
                    DeliveryEnd::Cancelled => {
                        session.release(&channel, route).await;
                        tracing::debug!(channel = %channel, "Unsubscribed");
                    }
                }
            })
        };

        Ok(Subscription::new(key.clone(), cancel, task))
    }
}
