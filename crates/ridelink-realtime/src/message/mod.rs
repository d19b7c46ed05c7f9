//! Typed inbound/outbound events, validation, and protocol versions.

pub mod inbound;
pub mod outbound;
pub mod validator;
pub mod version;

pub use inbound::{event_id, InboundEvent};
pub use outbound::{LocationPing, OutboundEvent};
pub use version::{NegotiatedProtocol, ProtocolVersion, CLIENT_PROTOCOL_VERSION};
