//! Per-room subscription lifecycle on a single process.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::foundation::StateMachine;

/// Whether this process currently holds a broker subscription for a room.
///
/// ```text
/// Inactive --(first local listener)--> Subscribed
/// Subscribed --(last local listener leaves)--> Inactive
/// ```
///
/// Transitions are driven only by local room activity, never by message
/// content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomSubscriptionState {
    #[default]
    Inactive,
    Subscribed,
}

impl StateMachine for RoomSubscriptionState {
    fn can_transition_to(&self, target: &Self) -> bool {
        use RoomSubscriptionState::*;
        matches!((self, target), (Inactive, Subscribed) | (Subscribed, Inactive))
    }

    fn valid_transitions(&self) -> Vec<Self> {
        use RoomSubscriptionState::*;
        match self {
            Inactive => vec![Subscribed],
            Subscribed => vec![Inactive],
        }
    }
}

impl fmt::Display for RoomSubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomSubscriptionState::Inactive => write!(f, "inactive"),
            RoomSubscriptionState::Subscribed => write!(f, "subscribed"),
        }
    }
}
