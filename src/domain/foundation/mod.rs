//! Foundation module - Shared domain primitives.
//!
//! Contains identifiers, time, error types and the state machine trait
//! that form the vocabulary of the room event layer.

mod errors;
mod ids;
mod state_machine;
mod timestamp;

pub use errors::{DomainError, ErrorCode, ValidationError};
pub use ids::{EventId, RoomId};
pub use state_machine::StateMachine;
pub use timestamp::Timestamp;
