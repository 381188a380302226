//! In-memory adapters for tests and single-process deployments.

mod broker;
mod processed_event_store;

pub use broker::{InMemoryBroker, InMemoryBusConnection};
pub use processed_event_store::InMemoryProcessedEventStore;
