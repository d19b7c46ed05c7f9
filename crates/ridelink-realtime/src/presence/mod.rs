//! Presence sub-protocol: status records for subscribed riders and drivers.

pub mod status;
pub mod tracker;

pub use status::{PresenceRecord, PresenceStatus, UserType};
pub use tracker::PresenceTracker;
