//! Wire envelope and room event codec.
//!
//! An envelope carries an explicit discriminator plus the serialized room
//! event, kept as raw JSON text. The bus layer moves envelopes around
//! without ever parsing the inner event; only consumers call
//! [`EncodedRoomEvent::decode`].
//!
//! # Wire format
//!
//! ```text
//! {"kind":"broadcast_to_room","payload":{"event_id":"…","room_id":"…","type":"chat.message",…}}
//! {"kind":"received","payload":{…same event…}}
//! ```
//!
//! Decoders ignore unknown envelope fields, so newer producers may add
//! metadata without breaking older consumers.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;

use crate::domain::foundation::{DomainError, ErrorCode};

use super::event::RoomEvent;

/// Failure to decode an envelope or the room event inside it.
///
/// Recovered locally by subscribers: the offending message is logged and
/// dropped, and the subscription keeps running.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(#[source] serde_json::Error),

    #[error("Malformed room event: {0}")]
    MalformedEvent(#[source] serde_json::Error),
}

impl From<DecodeError> for DomainError {
    fn from(err: DecodeError) -> Self {
        DomainError::new(ErrorCode::InvalidRoomEvent, err.to_string())
    }
}

/// Failure to serialize a room event or envelope.
#[derive(Debug, Error)]
#[error("Failed to encode room event: {0}")]
pub struct EncodeError(#[from] serde_json::Error);

/// Serialized form of exactly one [`RoomEvent`].
///
/// Opaque to the bus. Clones share nothing with the original event, so an
/// encoded event can be published on several channels unchanged.
#[derive(Clone)]
pub struct EncodedRoomEvent(Box<RawValue>);

impl EncodedRoomEvent {
    /// Wraps raw bytes received from the wire.
    ///
    /// Only checks that the bytes are well-formed JSON; the event itself
    /// is validated by [`decode`](Self::decode).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        serde_json::from_slice::<Box<RawValue>>(bytes)
            .map(Self)
            .map_err(DecodeError::MalformedEvent)
    }

    /// Raw serialized bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.get().as_bytes()
    }

    /// Deserializes the room event.
    pub fn decode(&self) -> Result<RoomEvent, DecodeError> {
        decode(self.as_bytes())
    }
}

impl PartialEq for EncodedRoomEvent {
    fn eq(&self, other: &Self) -> bool {
        self.0.get() == other.0.get()
    }
}

impl Eq for EncodedRoomEvent {}

impl fmt::Debug for EncodedRoomEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EncodedRoomEvent").field(&self.0.get()).finish()
    }
}

/// Serializes a room event into its self-describing wire form.
pub fn encode(event: &RoomEvent) -> Result<EncodedRoomEvent, EncodeError> {
    Ok(EncodedRoomEvent(serde_json::value::to_raw_value(event)?))
}

/// Deserializes a room event from its wire form.
///
/// Fails on malformed, truncated or non-event input.
pub fn decode(bytes: &[u8]) -> Result<RoomEvent, DecodeError> {
    serde_json::from_slice(bytes).map_err(DecodeError::MalformedEvent)
}

/// Discriminator carried in the envelope metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    BroadcastToRoom,
    Received,
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvelopeKind::BroadcastToRoom => write!(f, "broadcast_to_room"),
            EnvelopeKind::Received => write!(f, "received"),
        }
    }
}

/// Transport wrapper for a serialized room event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// Live broadcast, published on the room's own channel.
    BroadcastToRoom(EncodedRoomEvent),
    /// Stateful-processing signal, published on the stateful channel.
    Received(EncodedRoomEvent),
}

#[derive(Serialize)]
struct WireEnvelopeRef<'a> {
    kind: EnvelopeKind,
    payload: &'a RawValue,
}

#[derive(Deserialize)]
struct WireEnvelope {
    kind: EnvelopeKind,
    payload: Box<RawValue>,
}

impl Envelope {
    /// Builds an envelope of the given kind.
    pub fn new(kind: EnvelopeKind, payload: EncodedRoomEvent) -> Self {
        match kind {
            EnvelopeKind::BroadcastToRoom => Envelope::BroadcastToRoom(payload),
            EnvelopeKind::Received => Envelope::Received(payload),
        }
    }

    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::BroadcastToRoom(_) => EnvelopeKind::BroadcastToRoom,
            Envelope::Received(_) => EnvelopeKind::Received,
        }
    }

    pub fn payload(&self) -> &EncodedRoomEvent {
        match self {
            Envelope::BroadcastToRoom(payload) | Envelope::Received(payload) => payload,
        }
    }

    /// Serializes the envelope for the broker.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        let wire = WireEnvelopeRef {
            kind: self.kind(),
            payload: &self.payload().0,
        };
        Ok(serde_json::to_vec(&wire)?)
    }

    /// Parses an envelope received from the broker.
    ///
    /// The inner event is not decoded here.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let wire: WireEnvelope =
            serde_json::from_slice(bytes).map_err(DecodeError::MalformedEnvelope)?;
        Ok(Envelope::new(wire.kind, EncodedRoomEvent(wire.payload)))
    }
}
