//! Connection state as observed by the rest of the system.

use std::fmt;
use std::time::Duration;

use carewire_core::SessionId;

/// Lifecycle state of one identity's connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected. `reason` is set when the server or the transport
    /// closed the connection, or after an explicit close.
    Disconnected {
        /// Close reason, if known.
        reason: Option<String>,
    },
    /// Socket being opened or awaiting `connection_ack`.
    Connecting,
    /// Handshake acknowledged.
    Connected,
    /// The connection failed. A reconnect may be pending unless the failure
    /// was fatal.
    Error(String),
}

impl ConnectionState {
    /// Whether the handshake has been acknowledged.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected { reason: None } => f.write_str("disconnected"),
            Self::Disconnected { reason: Some(r) } => write!(f, "disconnected ({r})"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

/// Snapshot of the connection published to observers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionStatus {
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Round-trip time of the last answered heartbeat.
    pub last_rtt: Option<Duration>,
    /// Session ID assigned by the server in `connection_ack`.
    pub session_id: Option<SessionId>,
    /// Consecutive failed connection attempts since the last ack.
    pub reconnect_attempt: u32,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected { reason: None },
            last_rtt: None,
            session_id: None,
            reconnect_attempt: 0,
        }
    }
}
