//! Redis pub/sub adapters for production multi-process deployments.

mod connection;
mod error;
#[cfg(test)]
mod mock_server;
mod processed_event_store;
mod publisher;
mod pubsub;
mod subscriber;

pub use connection::RedisConnectionManager;
pub use error::ConnectError;
pub use processed_event_store::RedisProcessedEventStore;
pub use publisher::RedisPublisher;
pub use subscriber::RedisSubscriber;
