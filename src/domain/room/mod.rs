//! Room event vocabulary shared by producers, the bus and consumers.
//!
//! - [`RoomEvent`] - immutable event raised by room domain logic
//! - [`ChannelKey`] - broker channel derived from a room or the stateful sentinel
//! - [`Envelope`] - discriminated wire wrapper around an encoded event
//! - [`RoomSubscriptionState`] - Inactive/Subscribed lifecycle of a room on one process

mod channel_key;
mod envelope;
mod event;
mod subscription_state;

pub use channel_key::{ChannelIdentity, ChannelKey, ROOM_CHANNEL_PREFIX, STATEFUL_CHANNEL_NAME};
pub use envelope::{
    decode, encode, DecodeError, EncodeError, EncodedRoomEvent, Envelope, EnvelopeKind,
};
pub use event::{event_types, RoomEvent};
pub use subscription_state::RoomSubscriptionState;
