//! Connection state machine values.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of the channel. Only the supervisor changes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No transport and no reconnect pending.
    Disconnected,
    /// An explicit `connect` is opening the transport.
    Connecting,
    /// Transport open and negotiated; heartbeats running.
    Connected,
    /// Waiting for, or running, an automatic reconnect attempt.
    Reconnecting,
}

impl ConnectionState {
    /// Converts to string.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a connect was requested by the application or by the
/// reconnection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectMode {
    Explicit,
    Reconnect,
}
