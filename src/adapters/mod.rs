//! Adapters - Implementations of port interfaces.
//!
//! Adapters connect the room event layer to external systems:
//! - `redis` - Production broker (pub/sub) and processed-event store
//! - `memory` - In-memory broker simulating several processes, for tests
//! - `local` - In-process room registry for local client connections
//! - `events` - Stateful handler decorators

mod delivery;

pub mod events;
pub mod local;
pub mod memory;
pub mod redis;

pub use events::IdempotentStatefulHandler;
pub use local::{ClientId, LocalRoomRegistry};
pub use memory::{InMemoryBroker, InMemoryBusConnection, InMemoryProcessedEventStore};
pub use self::redis::{
    ConnectError, RedisConnectionManager, RedisProcessedEventStore, RedisPublisher,
    RedisSubscriber,
};
