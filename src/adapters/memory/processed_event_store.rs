//! Per-process processed-event store.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::domain::foundation::{DomainError, EventId};
use crate::ports::{processed_key, ProcessedEventStore};

/// Remembers applied events in process memory.
///
/// Suppresses redeliveries to this process only; other processes keep
/// their own record. Entries older than the retention window are treated
/// as unseen and pruned on write.
#[derive(Debug)]
pub struct InMemoryProcessedEventStore {
    processed: RwLock<HashMap<String, Instant>>,
    retention: Duration,
}

impl InMemoryProcessedEventStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            processed: RwLock::new(HashMap::new()),
            retention,
        }
    }

    /// Number of entries currently remembered (including expired ones not yet pruned).
    pub async fn len(&self) -> usize {
        self.processed.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for InMemoryProcessedEventStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

#[async_trait]
impl ProcessedEventStore for InMemoryProcessedEventStore {
    async fn contains(&self, event_id: &EventId, handler_name: &str) -> Result<bool, DomainError> {
        let key = processed_key(event_id, handler_name);
        let processed = self.processed.read().await;
        Ok(processed
            .get(&key)
            .is_some_and(|marked_at| marked_at.elapsed() < self.retention))
    }

    async fn mark_processed(
        &self,
        event_id: &EventId,
        handler_name: &str,
    ) -> Result<(), DomainError> {
        let key = processed_key(event_id, handler_name);
        let mut processed = self.processed.write().await;
        processed.retain(|_, marked_at| marked_at.elapsed() < self.retention);
        processed.insert(key, Instant::now());
        Ok(())
    }
}
