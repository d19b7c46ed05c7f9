//! # ridelink-realtime
//!
//! Client side of the RideLink real-time channel. Provides:
//!
//! - A connection supervisor with exponential-backoff reconnection
//! - Ping/pong heartbeats that detect silently dead sockets
//! - Protocol version negotiation on every connect
//! - Duplicate suppression for at-least-once inbound delivery
//! - A bounded, age-limited, durably persisted offline outbox
//! - Presence tracking for subscribed riders and drivers
//! - A typed publish/subscribe API for inbound events and channel signals

pub mod connection;
pub mod events;
pub mod message;
pub mod outbox;
pub mod presence;
pub mod storage;
pub mod transport;

pub use connection::state::ConnectionState;
pub use connection::supervisor::{RealtimeClient, SendOutcome};
pub use events::registry::{HandlerRegistry, SubscriptionId};
pub use events::signal::{ChannelEvent, EventKind, Signal};
pub use message::inbound::InboundEvent;
pub use message::outbound::OutboundEvent;
pub use outbox::queue::OfflineQueue;
pub use presence::tracker::PresenceTracker;
pub use transport::{CloseReason, Transport, TransportConnection, TransportEvent, TransportSink};
