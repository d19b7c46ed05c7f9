//! Outbound event definitions.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ridelink_core::error::AppError;
use ridelink_core::result::AppResult;

use crate::presence::status::PresenceStatus;

/// A position report sent by this device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationPing {
    /// Ride this ping belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ride_id: Option<String>,
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Heading in degrees clockwise from north.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    /// Speed in meters per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    /// Horizontal accuracy in meters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    /// Sample time (ms since epoch).
    pub timestamp: i64,
}

impl LocationPing {
    /// A ping sampled now.
    pub fn now(latitude: f64, longitude: f64) -> Self {
        Self {
            ride_id: None,
            latitude,
            longitude,
            heading: None,
            speed: None,
            accuracy: None,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Attach the ride this ping belongs to.
    pub fn for_ride(mut self, ride_id: impl Into<String>) -> Self {
        self.ride_id = Some(ride_id.into());
        self
    }
}

/// Every event this client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum OutboundEvent {
    /// Version announcement sent right after the socket opens.
    ProtocolVersionRequest {
        /// Client protocol version.
        version: String,
    },
    /// Heartbeat probe.
    Ping {
        /// Send time (ms since epoch).
        timestamp: i64,
    },
    /// Start receiving a ride's events.
    JoinRide {
        /// Ride identifier.
        ride_id: String,
    },
    /// Stop receiving a ride's events.
    LeaveRide {
        /// Ride identifier.
        ride_id: String,
    },
    /// Rider position.
    LocationUpdate(LocationPing),
    /// Driver position.
    DriverLocationUpdate(LocationPing),
    /// Chat line inside a ride.
    ChatMessage {
        /// Ride identifier.
        ride_id: String,
        /// Message body.
        text: String,
        /// Client-generated id so the server can drop resent copies.
        client_message_id: String,
    },
    /// Driver availability change.
    DriverStatusUpdate {
        /// New availability, e.g. `available`.
        status: String,
    },
    /// Driver accepts an offered ride.
    AcceptRide {
        /// Ride identifier.
        ride_id: String,
    },
    /// Driver declines an offered ride.
    RejectRide {
        /// Ride identifier.
        ride_id: String,
        /// Optional reason.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Driver picked up the rider.
    StartRide {
        /// Ride identifier.
        ride_id: String,
    },
    /// Driver dropped off the rider.
    CompleteRide {
        /// Ride identifier.
        ride_id: String,
        /// Final fare, if computed on device.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fare: Option<f64>,
    },
    /// This user's own presence.
    PresenceUpdate {
        /// New status.
        status: PresenceStatus,
        /// Ride the user is on.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ride_id: Option<String>,
    },
    /// Register interest in peers' presence.
    PresenceSubscribe {
        /// Peers to follow.
        user_ids: Vec<String>,
    },
    /// Drop interest in peers' presence.
    PresenceUnsubscribe {
        /// Peers to stop following.
        user_ids: Vec<String>,
    },
    /// Free-form application message.
    Message(serde_json::Value),
}

impl OutboundEvent {
    /// A chat line with a fresh client message id.
    pub fn chat(ride_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::ChatMessage {
            ride_id: ride_id.into(),
            text: text.into(),
            client_message_id: Uuid::new_v4().to_string(),
        }
    }

    /// A ping stamped with the current time.
    pub fn ping() -> Self {
        Self::Ping {
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ProtocolVersionRequest { .. } => "protocol_version_request",
            Self::Ping { .. } => "ping",
            Self::JoinRide { .. } => "join_ride",
            Self::LeaveRide { .. } => "leave_ride",
            Self::LocationUpdate(_) => "location_update",
            Self::DriverLocationUpdate(_) => "driver_location_update",
            Self::ChatMessage { .. } => "chat_message",
            Self::DriverStatusUpdate { .. } => "driver_status_update",
            Self::AcceptRide { .. } => "accept_ride",
            Self::RejectRide { .. } => "reject_ride",
            Self::StartRide { .. } => "start_ride",
            Self::CompleteRide { .. } => "complete_ride",
            Self::PresenceUpdate { .. } => "presence_update",
            Self::PresenceSubscribe { .. } => "presence_subscribe",
            Self::PresenceUnsubscribe { .. } => "presence_unsubscribe",
            Self::Message(_) => "message",
        }
    }

    /// Whether the event may wait in the offline queue.
    ///
    /// Control frames only make sense on the connection they were built for.
    pub fn is_queueable(&self) -> bool {
        !matches!(
            self,
            Self::ProtocolVersionRequest { .. }
                | Self::Ping { .. }
                | Self::PresenceSubscribe { .. }
                | Self::PresenceUnsubscribe { .. }
        )
    }

    /// Split into the transport's `(event name, payload)` pair.
    pub fn to_frame(&self) -> AppResult<(String, serde_json::Value)> {
        let mut value = serde_json::to_value(self)?;
        let object = value
            .as_object_mut()
            .ok_or_else(|| AppError::internal("Outbound event did not serialize to an object"))?;
        let payload = object.remove("data").unwrap_or(serde_json::Value::Null);
        Ok((self.name().to_string(), payload))
    }
}
