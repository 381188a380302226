//! Room events produced by domain logic.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::domain::foundation::{EventId, RoomId, Timestamp, ValidationError};

use super::envelope::DecodeError;

/// Well-known room event types.
///
/// The bus does not restrict event types to this list; these are the types
/// the interview room service raises today.
pub mod event_types {
    /// A chat message posted in the room sidebar.
    pub const CHAT_MESSAGE: &str = "chat.message";
    /// An emoji reaction on a message or on the shared screen.
    pub const REACTION: &str = "reaction.added";
    /// The interviewer switched the active question.
    pub const ACTIVE_QUESTION_CHANGED: &str = "question.active_changed";
    /// An edit to the shared code editor buffer.
    pub const CODE_EDITOR_CHANGED: &str = "code_editor.changed";
}

/// A domain event scoped to one interview room.
///
/// Immutable once constructed. Stateful events additionally drive a
/// durable state mutation on every consuming process, so handlers must
/// treat `event_id` as the idempotency key.
///
/// Serialization is forward compatible: unknown fields are ignored and
/// fields added after the first release carry serde defaults. `event_id`
/// is required, so every process decodes the same identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomEvent {
    event_id: EventId,

    room_id: RoomId,

    #[serde(rename = "type")]
    event_type: String,

    #[serde(default)]
    stateful: bool,

    #[serde(default)]
    occurred_at: Timestamp,

    #[serde(default)]
    payload: JsonValue,
}

impl RoomEvent {
    /// Creates a broadcast-only event (not stateful).
    pub fn new(
        room_id: RoomId,
        event_type: impl Into<String>,
        payload: JsonValue,
    ) -> Result<Self, ValidationError> {
        Self::build(room_id, event_type.into(), false, payload)
    }

    /// Creates an event that is broadcast and also applied to durable state.
    pub fn new_stateful(
        room_id: RoomId,
        event_type: impl Into<String>,
        payload: JsonValue,
    ) -> Result<Self, ValidationError> {
        Self::build(room_id, event_type.into(), true, payload)
    }

    fn build(
        room_id: RoomId,
        event_type: String,
        stateful: bool,
        payload: JsonValue,
    ) -> Result<Self, ValidationError> {
        if event_type.trim().is_empty() {
            return Err(ValidationError::empty_field("event_type"));
        }

        Ok(Self {
            event_id: EventId::new(),
            room_id,
            event_type,
            stateful,
            occurred_at: Timestamp::now(),
            payload,
        })
    }

    /// Rebuilds an event from all of its parts.
    ///
    /// Used when the identity and occurrence time are already known, e.g.
    /// when replaying a persisted event.
    pub fn from_parts(
        event_id: EventId,
        room_id: RoomId,
        event_type: impl Into<String>,
        stateful: bool,
        occurred_at: Timestamp,
        payload: JsonValue,
    ) -> Self {
        Self {
            event_id,
            room_id,
            event_type: event_type.into(),
            stateful,
            occurred_at,
            payload,
        }
    }

    pub fn event_id(&self) -> &EventId {
        &self.event_id
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn is_stateful(&self) -> bool {
        self.stateful
    }

    pub fn occurred_at(&self) -> Timestamp {
        self.occurred_at
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    /// Deserializes the payload into a concrete domain type.
    ///
    /// This is where consumers resolve the opaque payload to a typed event.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        serde_json::from_value(self.payload.clone()).map_err(DecodeError::MalformedEvent)
    }
}
