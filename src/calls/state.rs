//! Call state machine primitives.

use serde::Serialize;
use std::fmt;

/// Connection state of a call.
///
/// The discriminant order is meaningful: lower values rank higher when
/// several calls compete for the primary slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallState {
    Connected = 0,
    Connecting = 1,
    ExchangingKeys = 2,
    Pending = 3,
    Requesting = 4,
    Closing = 5,
    Closed = 6,
}

impl CallState {
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn is_closing(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connected => "CONNECTED",
            Self::Connecting => "CONNECTING",
            Self::ExchangingKeys => "EXCHANGING_KEYS",
            Self::Pending => "PENDING",
            Self::Requesting => "REQUESTING",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

/// ICE connection state reported by the peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl From<IceConnectionState> for CallState {
    fn from(state: IceConnectionState) -> Self {
        match state {
            IceConnectionState::Closed => CallState::Closed,
            IceConnectionState::Connected | IceConnectionState::Completed => CallState::Connected,
            _ => CallState::Connecting,
        }
    }
}

/// Resolves the visible state of a call.
///
/// An explicit override wins. Without one the state follows the ICE state of
/// the connection, and a call without a connection is still connecting.
pub fn derive_state(
    override_state: Option<CallState>,
    ice_state: Option<IceConnectionState>,
) -> CallState {
    if let Some(state) = override_state {
        return state;
    }
    ice_state.map(CallState::from).unwrap_or(CallState::Connecting)
}

const SORT_STATE_WEIGHT: u64 = 10_000_000_000_000;
const SORT_TIME_CEILING: u64 = 2_147_483_647_000;

/// Ranking key for concurrent calls; callers sort descending.
///
/// States closer to `CONNECTED` weigh more. Within a state, older calls rank
/// higher, except a ringing outgoing call which always ranks first.
pub fn sort_index(state: CallState, pending_outgoing: bool, created_at_ms: u64) -> u64 {
    let state_weight = (CallState::Closed.ordinal() - state.ordinal()) as u64 + 1;
    let age = if pending_outgoing {
        0
    } else {
        created_at_ms.min(SORT_TIME_CEILING)
    };
    state_weight * SORT_STATE_WEIGHT + (SORT_TIME_CEILING - age)
}
