//! Socket transport boundary.
//!
//! The supervisor only talks to the network through these traits. The
//! transport delivers events at-least-once, never fabricates them, and
//! reports every close with a [`CloseReason`].

pub mod ws;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use ridelink_core::result::AppResult;

pub use self::ws::WsTransport;

/// Why a connection closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The server closed the socket.
    ServerInitiated,
    /// This client closed the socket.
    ClientInitiated,
    /// The network dropped the socket (reset, stream ended, I/O error).
    NetworkError,
    /// The heartbeat monitor declared the socket dead.
    HeartbeatTimeout,
}

impl CloseReason {
    /// Whether this close should trigger automatic reconnection.
    pub fn is_unexpected(&self) -> bool {
        !matches!(self, Self::ClientInitiated)
    }

    /// Converts to string.
    pub fn as_str(&self) -> &str {
        match self {
            Self::ServerInitiated => "server_initiated",
            Self::ClientInitiated => "client_initiated",
            Self::NetworkError => "network_error",
            Self::HeartbeatTimeout => "heartbeat_timeout",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something the transport observed on an open connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A named inbound event.
    Message {
        /// Event name, e.g. `ride_status_update`.
        event: String,
        /// Raw payload; validated by the supervisor before dispatch.
        payload: serde_json::Value,
    },
    /// A non-fatal transport error.
    Error(String),
    /// The connection closed. No further events follow.
    Closed(CloseReason),
}

/// Outbound half of an open connection.
#[async_trait]
pub trait TransportSink: Send + Sync + fmt::Debug {
    /// Send a named event.
    async fn send(&self, event: &str, payload: serde_json::Value) -> AppResult<()>;

    /// Close the connection. Closing twice is a no-op.
    async fn close(&self);
}

/// An open connection: a sink plus the stream of inbound events.
#[derive(Debug)]
pub struct TransportConnection {
    /// Outbound half.
    pub sink: Arc<dyn TransportSink>,
    /// Inbound half.
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Opens connections to the backend.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug + 'static {
    /// Open a connection and resolve once the server acknowledged it.
    async fn open(&self, url: &str, auth_token: &str) -> AppResult<TransportConnection>;
}
