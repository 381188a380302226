//! Room Relay - Cross-process room event fan-out over a message broker.
//!
//! Every process in a fleet holds some of a room's client connections.
//! Room events are published once and reach every process that has a
//! listener for the room; stateful events additionally reach one
//! persistence handler per process.
//!
//! ```text
//! RoomEventDispatcher ─┬─▶ room:{id} ───────▶ RoomBroadcastForwarder ──▶ LocalConnections
//!                      └─▶ stateful-events ─▶ StatefulEventConsumer ───▶ StatefulEventHandler
//! ```

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod ports;
