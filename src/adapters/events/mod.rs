//! Stateful event handler decorators.

mod idempotent_handler;

pub use idempotent_handler::IdempotentStatefulHandler;
