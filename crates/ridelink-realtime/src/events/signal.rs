//! Events delivered to application subscribers.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::message::inbound::InboundEvent;
use crate::transport::CloseReason;

/// Lifecycle and diagnostic signals raised by the channel itself.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    /// A connection is open and negotiated.
    Connected,
    /// The connection went away.
    Disconnected {
        /// Why it closed.
        reason: CloseReason,
    },
    /// A reconnect attempt succeeded.
    Reconnected {
        /// Attempt number that succeeded.
        attempt: u32,
    },
    /// A reconnect attempt has been scheduled.
    ReconnectScheduled {
        /// Attempt number about to run.
        attempt: u32,
        /// Delay before it runs.
        delay: Duration,
    },
    /// Reconnection gave up; the application must call `connect` again.
    ReconnectFailed {
        /// Attempts made before giving up.
        attempts: u32,
    },
    /// A pong arrived.
    Heartbeat {
        /// Ping round-trip time.
        latency: Duration,
    },
    /// A ping went unanswered.
    HeartbeatMissed {
        /// Consecutive misses so far.
        count: u32,
    },
    /// The server speaks an older major protocol version.
    ProtocolMismatch {
        /// This client's version.
        client_version: String,
        /// The server's version.
        server_version: String,
    },
    /// An outbound event went to the offline queue.
    MessageQueued {
        /// Event name.
        event: String,
        /// Queue length after the append.
        queue_size: usize,
    },
    /// The offline queue was drained after connecting.
    QueueFlushed {
        /// Entries delivered.
        success_count: usize,
        /// Entries re-queued for another attempt.
        failed_count: usize,
    },
}

impl Signal {
    /// Subscriber channel for this signal.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connected => EventKind::Connected,
            Self::Disconnected { .. } => EventKind::Disconnected,
            Self::Reconnected { .. } => EventKind::Reconnected,
            Self::ReconnectScheduled { .. } => EventKind::ReconnectScheduled,
            Self::ReconnectFailed { .. } => EventKind::ReconnectFailed,
            Self::Heartbeat { .. } => EventKind::Heartbeat,
            Self::HeartbeatMissed { .. } => EventKind::HeartbeatMissed,
            Self::ProtocolMismatch { .. } => EventKind::ProtocolMismatch,
            Self::MessageQueued { .. } => EventKind::MessageQueued,
            Self::QueueFlushed { .. } => EventKind::QueueFlushed,
        }
    }
}

/// Anything a subscriber can receive.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// An event pushed by the server.
    Inbound(InboundEvent),
    /// A signal raised by the channel.
    Signal(Signal),
}

impl ChannelEvent {
    /// Subscriber channel for this event, if it has one.
    pub fn kind(&self) -> Option<EventKind> {
        match self {
            Self::Inbound(event) => event.kind(),
            Self::Signal(signal) => Some(signal.kind()),
        }
    }
}

impl From<Signal> for ChannelEvent {
    fn from(signal: Signal) -> Self {
        Self::Signal(signal)
    }
}

impl From<InboundEvent> for ChannelEvent {
    fn from(event: InboundEvent) -> Self {
        Self::Inbound(event)
    }
}

/// Tag identifying a subscriber channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    LocationUpdate,
    RideStatusUpdate,
    DriverUpdate,
    ChatMessage,
    RideRequest,
    RideAccepted,
    RideStarted,
    RideCompleted,
    RideCancelled,
    PresenceUpdate,
    PresenceBatch,
    Connected,
    Disconnected,
    Reconnected,
    ReconnectScheduled,
    ReconnectFailed,
    Heartbeat,
    HeartbeatMissed,
    ProtocolMismatch,
    MessageQueued,
    QueueFlushed,
}

impl EventKind {
    /// Every kind, in declaration order.
    pub const ALL: [EventKind; 21] = [
        Self::LocationUpdate,
        Self::RideStatusUpdate,
        Self::DriverUpdate,
        Self::ChatMessage,
        Self::RideRequest,
        Self::RideAccepted,
        Self::RideStarted,
        Self::RideCompleted,
        Self::RideCancelled,
        Self::PresenceUpdate,
        Self::PresenceBatch,
        Self::Connected,
        Self::Disconnected,
        Self::Reconnected,
        Self::ReconnectScheduled,
        Self::ReconnectFailed,
        Self::Heartbeat,
        Self::HeartbeatMissed,
        Self::ProtocolMismatch,
        Self::MessageQueued,
        Self::QueueFlushed,
    ];

    /// Converts to string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocationUpdate => "location_update",
            Self::RideStatusUpdate => "ride_status_update",
            Self::DriverUpdate => "driver_update",
            Self::ChatMessage => "chat_message",
            Self::RideRequest => "ride_request",
            Self::RideAccepted => "ride_accepted",
            Self::RideStarted => "ride_started",
            Self::RideCompleted => "ride_completed",
            Self::RideCancelled => "ride_cancelled",
            Self::PresenceUpdate => "presence_update",
            Self::PresenceBatch => "presence_batch",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnected => "reconnected",
            Self::ReconnectScheduled => "reconnect_scheduled",
            Self::ReconnectFailed => "reconnect_failed",
            Self::Heartbeat => "heartbeat",
            Self::HeartbeatMissed => "heartbeat_missed",
            Self::ProtocolMismatch => "protocol_mismatch",
            Self::MessageQueued => "message_queued",
            Self::QueueFlushed => "queue_flushed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
