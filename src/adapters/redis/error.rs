//! Redis error classification.

use std::time::Duration;

use redis::RedisError;
use thiserror::Error;

use crate::ports::{PublishError, SubscribeError};

/// Failure to establish the initial broker connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Invalid Redis connection settings: {0}")]
    InvalidConfig(#[source] RedisError),

    #[error("Redis unreachable: {0}")]
    Unreachable(#[source] RedisError),

    #[error("Redis connect timed out after {0:?}")]
    Timeout(Duration),
}

/// Returns true if the error means the connection itself is gone.
pub(crate) fn is_connection_error(e: &RedisError) -> bool {
    e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal()
}

pub(crate) fn publish_error(e: &RedisError, timeout: Duration) -> PublishError {
    if e.is_timeout() {
        PublishError::Timeout(timeout)
    } else if is_connection_error(e) {
        PublishError::Unavailable(e.to_string())
    } else {
        PublishError::Rejected(e.to_string())
    }
}

pub(crate) fn subscribe_error(e: &RedisError, timeout: Duration) -> SubscribeError {
    if e.is_timeout() {
        SubscribeError::Timeout(timeout)
    } else {
        SubscribeError::Unavailable(e.to_string())
    }
}
