//! Domain layer containing room event types and lifecycle rules.
//!
//! # Module Organization
//!
//! - `foundation` - Shared domain primitives (IDs, time, errors, state machines)
//! - `room` - Room events, channel keys, the wire envelope and subscription state

pub mod foundation;
pub mod room;
