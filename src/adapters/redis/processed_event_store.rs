//! Fleet-wide processed-event store backed by Redis.
//!
//! Uses `SET key 1 NX EX ttl` so each entry expires on its own; no sweep
//! job is needed.

use async_trait::async_trait;
use std::time::Duration;

use redis::AsyncCommands;

use crate::domain::foundation::{DomainError, ErrorCode, EventId};
use crate::ports::{processed_key, ProcessedEventStore};

use super::connection::RedisConnectionManager;
use super::error::is_connection_error;

/// Processed-event store shared by every process using the same Redis.
///
/// Commands go through the manager's shared connection, so the store
/// follows reconnects. Keys are namespaced with the bus channel prefix
/// and expire after the configured processed-event TTL.
///
/// Deduplication across processes is best effort: two processes may both
/// see `contains == false` before either marks the event.
#[derive(Clone)]
pub struct RedisProcessedEventStore {
    manager: RedisConnectionManager,
    ttl: Duration,
    key_prefix: Option<String>,
}

impl RedisProcessedEventStore {
    pub fn new(manager: RedisConnectionManager) -> Self {
        Self {
            ttl: manager.processed_event_ttl(),
            key_prefix: manager.channel_prefix().map(str::to_string),
            manager,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn redis_key(&self, event_id: &EventId, handler_name: &str) -> String {
        let key = processed_key(event_id, handler_name);
        match &self.key_prefix {
            Some(prefix) => format!("{}:{}", prefix, key),
            None => key,
        }
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, DomainError> {
        self.manager.connection().await.map_err(|e| {
            DomainError::new(ErrorCode::CacheError, format!("Processed event store: {}", e))
        })
    }

    fn cache_error(&self, e: redis::RedisError) -> DomainError {
        if is_connection_error(&e) {
            self.manager.report_connection_lost("processed event store command failed");
        }
        DomainError::new(ErrorCode::CacheError, format!("Processed event store: {}", e))
    }
}

#[async_trait]
impl ProcessedEventStore for RedisProcessedEventStore {
    async fn contains(&self, event_id: &EventId, handler_name: &str) -> Result<bool, DomainError> {
        let key = self.redis_key(event_id, handler_name);
        let mut conn = self.connection().await?;

        conn.exists(&key).await.map_err(|e| self.cache_error(e))
    }

    async fn mark_processed(
        &self,
        event_id: &EventId,
        handler_name: &str,
    ) -> Result<(), DomainError> {
        let key = self.redis_key(event_id, handler_name);
        let mut conn = self.connection().await?;

        // Nil reply means another process marked it first; either way it is marked.
        let _: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| self.cache_error(e))?;

        Ok(())
    }
}

impl std::fmt::Debug for RedisProcessedEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisProcessedEventStore")
            .field("ttl", &self.ttl)
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}
