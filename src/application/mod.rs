//! Application layer - Dispatch and subscription handlers.
//!
//! This layer coordinates the bus ports: the write side publishes room
//! events, the read side keeps subscriptions alive and routes what arrives.

pub mod handlers;

pub use handlers::{
    ActiveRoomSubscriptionController, DispatchError, RoomBroadcastForwarder, RoomEventDispatcher,
    StatefulEventConsumer,
};
