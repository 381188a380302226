//! IdempotentStatefulHandler - Skip stateful events that were already applied.
//!
//! Every process subscribed to the stateful channel receives every stateful
//! event. This decorator wraps a `StatefulEventHandler` with a
//! `ProcessedEventStore` so an event is applied at most once per store.
//!
//! ## Usage
//!
//! ```ignore
//! let handler = IdempotentStatefulHandler::new(
//!     ChatHistoryWriter::new(repo),
//!     Arc::new(RedisProcessedEventStore::new(connections.clone())),
//! );
//!
//! let consumer = StatefulEventConsumer::new(Arc::new(handler));
//! ```
//!
//! ## How It Works
//!
//! 1. Check whether this handler already applied the event
//! 2. If so, skip and return Ok
//! 3. Otherwise apply it through the inner handler
//! 4. After successful application, mark the event as processed
//!
//! ## Error Handling
//!
//! - If the inner handler fails, the event is NOT marked as processed
//! - Store errors are propagated to the caller

use async_trait::async_trait;
use std::sync::Arc;

use crate::domain::foundation::DomainError;
use crate::domain::room::RoomEvent;
use crate::ports::{ProcessedEventStore, StatefulEventHandler};

/// Decorates a `StatefulEventHandler` with idempotency tracking.
///
/// Uses the inner handler's `name()` as part of the idempotency key.
pub struct IdempotentStatefulHandler<H: StatefulEventHandler> {
    inner: H,
    processed_events: Arc<dyn ProcessedEventStore>,
}

impl<H: StatefulEventHandler> IdempotentStatefulHandler<H> {
    pub fn new(inner: H, processed_events: Arc<dyn ProcessedEventStore>) -> Self {
        Self {
            inner,
            processed_events,
        }
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }
}

#[async_trait]
impl<H: StatefulEventHandler + 'static> StatefulEventHandler for IdempotentStatefulHandler<H> {
    async fn apply_stateful_event(&self, event: RoomEvent) -> Result<(), DomainError> {
        let handler_name = self.inner.name();
        let event_id = event.event_id().clone();

        if self
            .processed_events
            .contains(&event_id, handler_name)
            .await?
        {
            tracing::debug!(
                event_id = %event_id,
                handler = handler_name,
                "Skipping already applied stateful event"
            );
            return Ok(());
        }

        self.inner.apply_stateful_event(event).await?;

        self.processed_events
            .mark_processed(&event_id, handler_name)
            .await?;

        Ok(())
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}
