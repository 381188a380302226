//! Broker channel naming.
//!
//! Every broker channel name is derived from a logical identity. Room
//! channels are namespaced with `room:` so they can never collide with the
//! stateful-processing channel.

use std::fmt;

use crate::domain::foundation::RoomId;

/// Prefix for per-room broadcast channels.
pub const ROOM_CHANNEL_PREFIX: &str = "room:";

/// Fixed name of the global stateful-processing channel.
pub const STATEFUL_CHANNEL_NAME: &str = "stateful-events";

/// Logical identity a channel is derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelIdentity {
    /// Per-room broadcast channel.
    Room(RoomId),
    /// The single channel carrying stateful events for the whole fleet.
    StatefulEvents,
}

impl ChannelIdentity {
    /// Derives the logical channel name. Pure and deterministic.
    pub fn derive(&self) -> String {
        match self {
            ChannelIdentity::Room(room_id) => format!("{}{}", ROOM_CHANNEL_PREFIX, room_id),
            ChannelIdentity::StatefulEvents => STATEFUL_CHANNEL_NAME.to_string(),
        }
    }
}

/// Channel identity used to address the broker.
///
/// Two keys are equal iff their derived logical names are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey(String);

impl ChannelKey {
    /// Key for a room's broadcast channel.
    pub fn room(room_id: &RoomId) -> Self {
        ChannelIdentity::Room(*room_id).into()
    }

    /// Key for the stateful-processing channel.
    pub fn stateful() -> Self {
        ChannelIdentity::StatefulEvents.into()
    }

    /// Returns the logical channel name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if this is the stateful-processing channel.
    pub fn is_stateful(&self) -> bool {
        self.0 == STATEFUL_CHANNEL_NAME
    }

    /// Recovers the room a room channel was derived from.
    pub fn room_id(&self) -> Option<RoomId> {
        self.0
            .strip_prefix(ROOM_CHANNEL_PREFIX)
            .and_then(|id| id.parse().ok())
    }

    /// Broker-level channel name, optionally namespaced for shared brokers.
    pub fn broker_channel(&self, prefix: Option<&str>) -> String {
        match prefix {
            Some(prefix) if !prefix.is_empty() => format!("{}:{}", prefix, self.0),
            _ => self.0.clone(),
        }
    }
}

impl From<ChannelIdentity> for ChannelKey {
    fn from(identity: ChannelIdentity) -> Self {
        Self(identity.derive())
    }
}

impl From<&RoomId> for ChannelKey {
    fn from(room_id: &RoomId) -> Self {
        Self::room(room_id)
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_room_id() -> RoomId {
        "550e8400-e29b-41d4-a716-446655440000".parse().unwrap()
    }

    #[test]
    fn room_key_is_namespaced() {
        let key = ChannelKey::room(&test_room_id());
        assert_eq!(key.as_str(), "room:550e8400-e29b-41d4-a716-446655440000");
    }

    #[test]
    fn stateful_key_uses_sentinel_name() {
        assert_eq!(ChannelKey::stateful().as_str(), "stateful-events");
        assert!(ChannelKey::stateful().is_stateful());
    }

    #[test]
    fn derivation_is_deterministic() {
        let room_id = RoomId::new();
        assert_eq!(ChannelKey::room(&room_id), ChannelKey::room(&room_id));
        assert_eq!(ChannelKey::stateful(), ChannelKey::stateful());
    }

    #[test]
    fn distinct_rooms_get_distinct_keys() {
        assert_ne!(ChannelKey::room(&RoomId::new()), ChannelKey::room(&RoomId::new()));
    }

    #[test]
    fn room_keys_never_equal_stateful_key() {
        let key = ChannelKey::room(&RoomId::new());
        assert_ne!(key, ChannelKey::stateful());
        assert!(!key.is_stateful());
    }

    #[test]
    fn room_id_recovered_from_room_key() {
        let room_id = test_room_id();
        assert_eq!(ChannelKey::room(&room_id).room_id(), Some(room_id));
        assert_eq!(ChannelKey::stateful().room_id(), None);
    }

    #[test]
    fn broker_channel_applies_prefix() {
        let key = ChannelKey::stateful();
        assert_eq!(key.broker_channel(None), "stateful-events");
        assert_eq!(key.broker_channel(Some("")), "stateful-events");
        assert_eq!(key.broker_channel(Some("interviews")), "interviews:stateful-events");
    }
}
