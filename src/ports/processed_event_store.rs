//! ProcessedEventStore port - Interface for tracking applied stateful events.
//!
//! Every process receives every stateful event, and a reconnecting
//! producer may publish the same event twice. This store lets a
//! stateful handler recognise events it has already applied.
//!
//! ## Scope of deduplication
//!
//! - A per-process store suppresses redeliveries to that process only.
//! - A shared store (Redis) suppresses application across the fleet on a
//!   best-effort basis: two processes may both pass `contains` before
//!   either calls `mark_processed`, so handlers must stay re-appliable.

use async_trait::async_trait;

use crate::domain::foundation::{DomainError, EventId};

/// Port for tracking which events have been applied by which handlers.
///
/// # Example
///
/// ```ignore
/// if store.contains(event.event_id(), "ChatHistoryWriter").await? {
///     return Ok(()); // Skip duplicate
/// }
///
/// // Apply event...
///
/// store.mark_processed(event.event_id(), "ChatHistoryWriter").await?;
/// ```
#[async_trait]
pub trait ProcessedEventStore: Send + Sync {
    /// Check if an event has been processed by a specific handler.
    async fn contains(&self, event_id: &EventId, handler_name: &str) -> Result<bool, DomainError>;

    /// Mark an event as processed by a specific handler.
    ///
    /// Call AFTER successful handling so failures are retried on the
    /// next delivery.
    async fn mark_processed(&self, event_id: &EventId, handler_name: &str)
        -> Result<(), DomainError>;
}

/// Storage key shared by the store adapters.
pub(crate) fn processed_key(event_id: &EventId, handler_name: &str) -> String {
    format!("processed:{}:{}", handler_name, event_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(dead_code)]
    fn assert_object_safe(_: &dyn ProcessedEventStore) {}

    #[test]
    fn processed_key_includes_handler_and_event() {
        let key = processed_key(&EventId::from_string("evt-1"), "ChatHistoryWriter");
        assert_eq!(key, "processed:ChatHistoryWriter:evt-1");
    }
}
