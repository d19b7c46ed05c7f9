//! Subscriber-facing events: signals, the handler registry, and duplicate
//! suppression for inbound delivery.

pub mod dedup;
pub mod registry;
pub mod signal;

pub use dedup::IdempotencyFilter;
pub use registry::{EventHandler, HandlerRegistry, SubscriptionId};
pub use signal::{ChannelEvent, EventKind, Signal};
