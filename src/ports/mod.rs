//! Ports - Interfaces for external dependencies.
//!
//! Following hexagonal architecture, ports define the contracts between
//! the room event layer and the outside world. Adapters implement these
//! ports.
//!
//! ## Bus Ports
//!
//! - `Publisher` - Send an envelope to a broker channel
//! - `Subscriber` - Register an `EnvelopeHandler` for a channel, returning a `Subscription`
//! - `BusConnectionFactory` - Shared broker connection lifecycle
//!
//! ## Collaborator Ports
//!
//! - `ActiveRoomSet` - Rooms with local listeners (connection layer)
//! - `LocalConnections` - Delivery to local client sockets (connection layer)
//! - `StatefulEventHandler` - Durable state mutation (persistence layer)
//! - `ProcessedEventStore` - Idempotency tracking for stateful handlers

mod active_rooms;
mod connection;
mod local_connections;
mod processed_event_store;
mod publisher;
mod stateful_event_handler;
mod subscriber;

pub use active_rooms::{ActiveRoomSet, RoomActivityChange};
pub use connection::{BusConnectionFactory, ConnectionEvent, ConnectionState};
pub use local_connections::LocalConnections;
pub use processed_event_store::ProcessedEventStore;
pub(crate) use processed_event_store::processed_key;
pub use publisher::{PublishError, Publisher};
pub use stateful_event_handler::StatefulEventHandler;
pub use subscriber::{EnvelopeHandler, SubscribeError, Subscriber, Subscription};
