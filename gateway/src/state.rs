//! Gateway lifecycle states.

use serde::Serialize;

/// Gateway operational state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayState {
    /// Stores are being opened.
    Starting,
    /// Accepting requests.
    Running,
    /// Finishing in-flight requests, refusing new ones.
    ShuttingDown,
    /// Stopped.
    Stopped,
}

impl GatewayState {
    /// Check if the gateway is accepting new requests.
    pub fn accepts_requests(&self) -> bool {
        matches!(self, GatewayState::Running)
    }

    /// Check if the gateway is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, GatewayState::Stopped)
    }
}
