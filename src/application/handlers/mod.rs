//! Application handlers.
//!
//! Handlers that orchestrate room event delivery across ports.

pub mod room;

pub use room::{
    ActiveRoomSubscriptionController, DispatchError, RoomBroadcastForwarder, RoomEventDispatcher,
    StatefulEventConsumer,
};
