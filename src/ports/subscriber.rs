//! Subscriber port - Interface for receiving envelopes from broker channels.
//!
//! A subscription binds one [`EnvelopeHandler`] to one channel and is
//! released through the returned [`Subscription`] handle.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::foundation::DomainError;
use crate::domain::room::{ChannelKey, Envelope};

/// Errors that can occur while subscribing to a channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscribeError {
    /// Broker unreachable
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// Broker did not confirm the subscription in time
    #[error("Subscribe timed out after {0:?}")]
    Timeout(Duration),

    /// Reconnection exhausted its retries; fatal until the process restarts
    #[error("Broker connection lost")]
    ConnectionLost,

    /// The subscribe attempt was abandoned by shutdown
    #[error("Subscribe cancelled")]
    Cancelled,
}

/// Callback invoked for every envelope received on a subscribed channel.
///
/// Implementations should be:
/// - **Quick** - a slow handler delays later messages on the same channel
/// - **Tolerant** - undecodable payloads are logged and dropped, not returned
///
/// Errors returned here are logged by the delivery loop; they never end
/// the subscription.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    /// Process one envelope received on `key`.
    async fn handle(&self, key: &ChannelKey, envelope: Envelope) -> Result<(), DomainError>;

    /// Handler name for logging.
    fn name(&self) -> &'static str;
}

/// Port for subscribing to broker channels.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Subscribe `handler` to the channel named by `key`.
    ///
    /// Returns once the broker has confirmed the subscription. Envelopes are
    /// handed to `handler` one at a time, in broker delivery order.
    async fn subscribe(
        &self,
        key: &ChannelKey,
        handler: Arc<dyn EnvelopeHandler>,
    ) -> Result<Subscription, SubscribeError>;
}

/// Handle to a live channel subscription.
///
/// Dropping the handle stops delivery without waiting for it; call
/// [`unsubscribe`](Self::unsubscribe) to also wait until the delivery task
/// has finished.
pub struct Subscription {
    key: ChannelKey,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Subscription {
    /// Wraps a delivery task spawned by a subscriber adapter.
    ///
    /// The task must stop invoking its handler once `cancel` fires, and
    /// should cancel `cancel` itself if it ends for any other reason.
    pub fn new(key: ChannelKey, cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self {
            key,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    /// Returns false once the subscription was released or its delivery
    /// task ended (e.g. the broker connection dropped).
    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Stops delivery and waits for the delivery task to finish.
    ///
    /// Idempotent. When it returns, the handler will not be invoked again;
    /// a message whose handling had already started completes first.
    /// Must not be awaited from inside this subscription's own handler.
    pub async fn unsubscribe(&self) {
        self.cancel.cancel();

        let mut task = self.task.lock().await;
        if let Some(handle) = task.take() {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    tracing::error!(channel = %self.key, "Subscription delivery task panicked");
                }
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}
