//! Room event handlers.
//!
//! Dispatch on the write side, forwarding and stateful consumption on the
//! read side, and the controller that keeps broker subscriptions in line
//! with local room activity.

mod broadcast_forwarder;
mod dispatch_room_event;
mod stateful_consumer;
mod subscription_controller;

pub use broadcast_forwarder::RoomBroadcastForwarder;
pub use dispatch_room_event::{DispatchError, RoomEventDispatcher};
pub use stateful_consumer::StatefulEventConsumer;
pub use subscription_controller::ActiveRoomSubscriptionController;
