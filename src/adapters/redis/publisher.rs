//! Redis PUBLISH adapter.

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::domain::room::{ChannelKey, Envelope};
use crate::ports::{PublishError, Publisher};

use super::connection::RedisConnectionManager;
use super::error::{is_connection_error, publish_error};

/// Publishes envelopes with `PUBLISH` over the shared multiplexed connection.
///
/// Publishes on one key from one process reach each subscriber in the
/// order they were issued (Redis delivers per-connection FIFO).
#[derive(Debug, Clone)]
pub struct RedisPublisher {
    manager: RedisConnectionManager,
}

impl RedisPublisher {
    pub fn new(manager: RedisConnectionManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Publisher for RedisPublisher {
    async fn publish(&self, key: &ChannelKey, envelope: &Envelope) -> Result<(), PublishError> {
        let channel = key.broker_channel(self.manager.channel_prefix());
        let bytes = envelope
            .to_bytes()
            .map_err(|e| PublishError::Encode(e.to_string()))?;

        let mut conn = self.manager.connection().await?;
        let timeout = self.manager.publish_timeout();

        let receivers: i64 = tokio::time::timeout(timeout, conn.publish(&channel, bytes))
            .await
            .map_err(|_| PublishError::Timeout(timeout))?
            .map_err(|e: redis::RedisError| {
                if is_connection_error(&e) {
                    self.manager.report_connection_lost(&e.to_string());
                }
                publish_error(&e, timeout)
            })?;

        tracing::trace!(
            channel = %channel,
            kind = %envelope.kind(),
            receivers,
            "Published envelope"
        );

        Ok(())
    }
}
