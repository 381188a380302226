//! StatefulEventHandler port - Durable state mutation for stateful events.
//!
//! The stateful channel is a broadcast: every process in the fleet receives
//! every stateful event, so each process invokes its handler once per
//! event. Handlers must therefore be safe to re-apply.

use async_trait::async_trait;

use crate::domain::foundation::DomainError;
use crate::domain::room::RoomEvent;

/// Handler applying a stateful room event to persisted state.
///
/// Implementations should be:
/// - **Idempotent** - keyed by `event.event_id()`; re-applying is a no-op
/// - **Bounded** - the stateful channel is shared by every room
///
/// Wrap with [`IdempotentStatefulHandler`](crate::adapters::IdempotentStatefulHandler)
/// when the persistence layer cannot deduplicate on its own.
///
/// # Example
///
/// ```ignore
/// struct ChatHistoryWriter { repo: Arc<dyn ChatRepository> }
///
/// #[async_trait]
/// impl StatefulEventHandler for ChatHistoryWriter {
///     async fn apply_stateful_event(&self, event: RoomEvent) -> Result<(), DomainError> {
///         let message: ChatMessage = event.payload_as()?;
///         self.repo.upsert(event.event_id(), message).await
///     }
///
///     fn name(&self) -> &'static str {
///         "ChatHistoryWriter"
///     }
/// }
/// ```
#[async_trait]
pub trait StatefulEventHandler: Send + Sync {
    /// Apply one stateful event.
    async fn apply_stateful_event(&self, event: RoomEvent) -> Result<(), DomainError>;

    /// Handler name for logging and idempotency keys.
    fn name(&self) -> &'static str;
}
