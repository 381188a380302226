//! In-process connection layer adapters.

mod room_registry;

pub use room_registry::{ClientId, LocalRoomRegistry};
