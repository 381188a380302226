//! BusConnectionFactory port - Broker connection lifecycle.
//!
//! One factory exists per process. It owns the broker connection(s), hands
//! out publishers and subscribers bound to them, and reports connection
//! loss and recovery so subscriptions can be re-established.
//!
//! ## Reconnect semantics
//!
//! ```text
//! connect() --> Connected --(drop)--> Reconnecting{1} --> Reconnecting{n} --> Connected
//!                                            \------------(exhausted)-------> Failed
//! any --(shutdown)--> Closed
//! ```
//!
//! Messages published or delivered while the connection is down are lost.
//! Delivery is at-most-once across a reconnect boundary.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::domain::foundation::StateMachine;

use super::{PublishError, Publisher, SubscribeError, Subscriber};

/// Notifications about the shared broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection dropped; a reconnect loop is running.
    Lost,
    /// The connection is back; every subscription must be re-established.
    Reconnected,
    /// Reconnection exhausted its retries.
    Failed,
}

/// Lifecycle of the shared broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Reconnecting { attempt: u32 },
    Failed,
    Closed,
}

impl ConnectionState {
    /// Returns true if publishes and subscribes can currently succeed.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Returns true if no further recovery will happen.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

impl StateMachine for ConnectionState {
    fn can_transition_to(&self, target: &Self) -> bool {
        use ConnectionState::*;
        match (self, target) {
            (Connected, Reconnecting { attempt }) => *attempt == 1,
            (Reconnecting { attempt: from }, Reconnecting { attempt: to }) => *to == from + 1,
            (Reconnecting { .. }, Connected) | (Reconnecting { .. }, Failed) => true,
            (Closed, _) => false,
            (_, Closed) => true,
            _ => false,
        }
    }

    fn valid_transitions(&self) -> Vec<Self> {
        use ConnectionState::*;
        match self {
            Connected => vec![Reconnecting { attempt: 1 }, Closed],
            Reconnecting { attempt } => vec![
                Reconnecting {
                    attempt: attempt + 1,
                },
                Connected,
                Failed,
                Closed,
            ],
            Failed => vec![Closed],
            Closed => vec![],
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting { attempt } => {
                write!(f, "reconnecting (attempt {})", attempt)
            }
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Port for acquiring publishers and subscribers on the shared connection.
///
/// # Example
///
/// ```ignore
/// let publisher = connections.publisher().await?;
/// publisher.publish(&ChannelKey::room(&room_id), &envelope).await?;
///
/// let mut events = connections.connection_events();
/// while let Ok(ConnectionEvent::Reconnected) = events.recv().await {
///     // re-subscribe every channel
/// }
/// ```
#[async_trait]
pub trait BusConnectionFactory: Send + Sync {
    /// Acquire a publisher bound to the shared connection.
    async fn publisher(&self) -> Result<Arc<dyn Publisher>, PublishError>;

    /// Acquire a subscriber bound to the shared connection.
    async fn subscriber(&self) -> Result<Arc<dyn Subscriber>, SubscribeError>;

    /// Subscribe to connection loss / recovery notifications.
    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent>;

    /// Current connection state.
    fn state(&self) -> ConnectionState;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(dead_code)]
    fn assert_object_safe(_: &dyn BusConnectionFactory) {}

    #[test]
    fn connected_drops_into_first_reconnect_attempt() {
        let first_attempt = ConnectionState::Reconnecting { attempt: 1 };
        let next = ConnectionState::Connected.transition_to(first_attempt);
        assert!(next.is_ok());

        let skipped =
            ConnectionState::Connected.transition_to(ConnectionState::Reconnecting { attempt: 3 });
        assert!(skipped.is_err());
    }

    #[test]
    fn reconnect_attempts_count_up_by_one() {
        let state = ConnectionState::Reconnecting { attempt: 2 };
        assert!(state.can_transition_to(&ConnectionState::Reconnecting { attempt: 3 }));
        assert!(!state.can_transition_to(&ConnectionState::Reconnecting { attempt: 2 }));
    }

    #[test]
    fn closed_is_terminal() {
        assert!(ConnectionState::Closed.is_terminal());
        assert!(!ConnectionState::Failed.is_terminal());
    }

    #[test]
    fn every_live_state_can_close() {
        for state in [
            ConnectionState::Connected,
            ConnectionState::Reconnecting { attempt: 4 },
            ConnectionState::Failed,
        ] {
            assert!(state.can_transition_to(&ConnectionState::Closed), "{}", state);
        }
    }

    #[test]
    fn fatal_states() {
        assert!(ConnectionState::Failed.is_fatal());
        assert!(ConnectionState::Closed.is_fatal());
        assert!(!ConnectionState::Reconnecting { attempt: 1 }.is_fatal());
    }
}
