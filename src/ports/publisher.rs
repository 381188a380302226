//! Publisher port - Interface for sending envelopes to broker channels.
//!
//! The domain never talks to the broker directly; it hands envelopes to a
//! `Publisher` obtained from a [`BusConnectionFactory`](super::BusConnectionFactory).

use async_trait::async_trait;
use std::time::Duration;

use crate::domain::room::{ChannelKey, Envelope};

/// Errors that can occur while publishing to the broker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    /// Broker unreachable or the connection dropped mid-operation
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// Broker did not acknowledge in time
    #[error("Publish timed out after {0:?}")]
    Timeout(Duration),

    /// Broker answered with an error
    #[error("Broker rejected publish: {0}")]
    Rejected(String),

    /// Reconnection exhausted its retries; fatal until the process restarts
    #[error("Broker connection lost")]
    ConnectionLost,

    /// Caller cancelled the publish before it completed
    #[error("Publish cancelled")]
    Cancelled,

    /// Envelope could not be serialized
    #[error("Envelope encoding failed: {0}")]
    Encode(String),
}

/// Port for publishing envelopes.
///
/// Implementations must:
/// - Deliver at-least-once to processes subscribed at publish time
/// - Propagate failures without retrying internally
///
/// Ordering between publishes to the same key over the same connection is
/// whatever the broker provides (FIFO for Redis); nothing is promised
/// across keys.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish one envelope to the channel named by `key`.
    async fn publish(&self, key: &ChannelKey, envelope: &Envelope) -> Result<(), PublishError>;
}
