//! Presence status definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Peer presence status as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    /// Connected and available.
    Online,
    /// Not connected.
    Offline,
    /// Connected but idle.
    Away,
    /// Connected and occupied (e.g. a driver on a trip).
    Busy,
}

impl PresenceStatus {
    /// Whether the peer is reachable right now.
    pub fn is_online(&self) -> bool {
        matches!(self, Self::Online | Self::Busy)
    }

    /// Converts to string.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Away => "away",
            Self::Busy => "busy",
        }
    }
}

/// Which side of a ride a peer is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    /// Passenger.
    Rider,
    /// Driver.
    Driver,
}

/// Last-known presence of one peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    /// Peer identifier.
    pub user_id: String,
    /// Rider or driver.
    pub user_type: UserType,
    /// Current status.
    pub status: PresenceStatus,
    /// When the server last saw the peer.
    #[serde(default = "Utc::now")]
    pub last_seen: DateTime<Utc>,
    /// Ride the peer is currently part of.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ride_id: Option<String>,
}
