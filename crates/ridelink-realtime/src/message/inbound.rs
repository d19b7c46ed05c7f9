//! Inbound event definitions and decoding.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use ridelink_core::error::{AppError, ErrorKind};
use ridelink_core::result::AppResult;

use crate::events::signal::EventKind;
use crate::presence::status::{PresenceRecord, UserType};

/// A position report for a driver or ride.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    /// Ride the location belongs to.
    pub ride_id: Option<String>,
    /// Driver reporting the location.
    pub driver_id: Option<String>,
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Heading in degrees clockwise from north.
    pub heading: Option<f64>,
    /// Speed in meters per second.
    pub speed: Option<f64>,
    /// When the position was sampled.
    pub timestamp: Option<DateTime<Utc>>,
}

/// Ride lifecycle status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideStatusUpdate {
    /// Ride identifier.
    pub ride_id: String,
    /// New status, e.g. `driver_arriving`.
    pub status: String,
    /// Estimated seconds until the next milestone.
    pub eta_seconds: Option<u32>,
    /// Human-readable detail.
    pub message: Option<String>,
}

/// Driver profile or availability change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverUpdate {
    /// Driver identifier.
    pub driver_id: String,
    /// Availability status, if included.
    pub status: Option<String>,
    /// Remaining fields (vehicle, rating, ...), passed through untouched.
    #[serde(flatten)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

/// A chat line inside a ride.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Message identifier.
    pub id: Option<String>,
    /// Ride the conversation belongs to.
    pub ride_id: String,
    /// Author.
    pub sender_id: String,
    /// Author's side of the ride.
    pub sender_type: Option<UserType>,
    /// Message body.
    pub text: String,
    /// Server timestamp.
    pub sent_at: Option<DateTime<Utc>>,
}

/// Payload shared by `ride_request`, `ride_accepted`, `ride_started`,
/// `ride_completed`, and `ride_cancelled`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideEvent {
    /// Ride identifier.
    pub ride_id: String,
    /// Assigned driver.
    pub driver_id: Option<String>,
    /// Requesting rider.
    pub rider_id: Option<String>,
    /// Cancellation reason.
    pub reason: Option<String>,
    /// Final or quoted fare.
    pub fare: Option<f64>,
    /// Remaining fields (pickup, dropoff, ...).
    #[serde(flatten)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

/// Several presence records in one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceBatch {
    /// Records in server order.
    pub users: Vec<PresenceRecord>,
}

/// Heartbeat reply.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pong {
    /// Echoed ping timestamp (ms since epoch).
    pub timestamp: Option<i64>,
}

/// The server's advertised protocol version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerVersion {
    /// Version string, e.g. `2.1.0`.
    pub version: String,
}

/// Every event the server may push.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// `location_update`
    LocationUpdate(LocationUpdate),
    /// `ride_status_update`
    RideStatusUpdate(RideStatusUpdate),
    /// `driver_update`
    DriverUpdate(DriverUpdate),
    /// `chat_message`
    ChatMessage(ChatMessage),
    /// `ride_request`
    RideRequest(RideEvent),
    /// `ride_accepted`
    RideAccepted(RideEvent),
    /// `ride_started`
    RideStarted(RideEvent),
    /// `ride_completed`
    RideCompleted(RideEvent),
    /// `ride_cancelled`
    RideCancelled(RideEvent),
    /// `presence_update`
    PresenceUpdate(PresenceRecord),
    /// `presence_batch`
    PresenceBatch(PresenceBatch),
    /// `pong`
    Pong(Pong),
    /// `protocol_version`
    ProtocolVersion(ServerVersion),
}

impl InboundEvent {
    /// Decode a named frame.
    ///
    /// Returns `Ok(None)` for event names this client does not know and a
    /// [`ErrorKind::Protocol`] error for known names with a malformed payload.
    pub fn decode(event: &str, payload: serde_json::Value) -> AppResult<Option<Self>> {
        let decoded = match event {
            "location_update" => Self::LocationUpdate(parse(event, payload)?),
            "ride_status_update" => Self::RideStatusUpdate(parse(event, payload)?),
            "driver_update" => Self::DriverUpdate(parse(event, payload)?),
            "chat_message" => Self::ChatMessage(parse(event, payload)?),
            "ride_request" => Self::RideRequest(parse(event, payload)?),
            "ride_accepted" => Self::RideAccepted(parse(event, payload)?),
            "ride_started" => Self::RideStarted(parse(event, payload)?),
            "ride_completed" => Self::RideCompleted(parse(event, payload)?),
            "ride_cancelled" => Self::RideCancelled(parse(event, payload)?),
            "presence_update" => Self::PresenceUpdate(parse(event, payload)?),
            "presence_batch" => Self::PresenceBatch(parse(event, payload)?),
            "pong" if payload.is_null() => Self::Pong(Pong::default()),
            "pong" => Self::Pong(parse(event, payload)?),
            "protocol_version" => Self::ProtocolVersion(parse(event, payload)?),
            _ => return Ok(None),
        };
        Ok(Some(decoded))
    }

    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::LocationUpdate(_) => "location_update",
            Self::RideStatusUpdate(_) => "ride_status_update",
            Self::DriverUpdate(_) => "driver_update",
            Self::ChatMessage(_) => "chat_message",
            Self::RideRequest(_) => "ride_request",
            Self::RideAccepted(_) => "ride_accepted",
            Self::RideStarted(_) => "ride_started",
            Self::RideCompleted(_) => "ride_completed",
            Self::RideCancelled(_) => "ride_cancelled",
            Self::PresenceUpdate(_) => "presence_update",
            Self::PresenceBatch(_) => "presence_batch",
            Self::Pong(_) => "pong",
            Self::ProtocolVersion(_) => "protocol_version",
        }
    }

    /// Subscriber channel for this event. Control frames (`pong`,
    /// `protocol_version`) are consumed internally and have none.
    pub fn kind(&self) -> Option<EventKind> {
        let kind = match self {
            Self::LocationUpdate(_) => EventKind::LocationUpdate,
            Self::RideStatusUpdate(_) => EventKind::RideStatusUpdate,
            Self::DriverUpdate(_) => EventKind::DriverUpdate,
            Self::ChatMessage(_) => EventKind::ChatMessage,
            Self::RideRequest(_) => EventKind::RideRequest,
            Self::RideAccepted(_) => EventKind::RideAccepted,
            Self::RideStarted(_) => EventKind::RideStarted,
            Self::RideCompleted(_) => EventKind::RideCompleted,
            Self::RideCancelled(_) => EventKind::RideCancelled,
            Self::PresenceUpdate(_) => EventKind::PresenceUpdate,
            Self::PresenceBatch(_) => EventKind::PresenceBatch,
            Self::Pong(_) | Self::ProtocolVersion(_) => return None,
        };
        Some(kind)
    }
}

/// Extract the de-duplication identifier from a raw payload.
///
/// Looks at `eventId` first, then `id`. Numeric ids are accepted.
pub fn event_id(payload: &serde_json::Value) -> Option<String> {
    ["eventId", "id"]
        .iter()
        .filter_map(|field| payload.get(field))
        .find_map(|value| match value {
            serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

fn parse<T: DeserializeOwned>(event: &str, payload: serde_json::Value) -> AppResult<T> {
    serde_json::from_value(payload).map_err(|e| {
        AppError::with_source(
            ErrorKind::Protocol,
            format!("Malformed {event} payload: {e}"),
            e,
        )
    })
}
