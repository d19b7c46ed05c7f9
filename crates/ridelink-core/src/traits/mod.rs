//! Core traits defined in `ridelink-core` and implemented by other crates.

pub mod store;

pub use store::KeyValueStore;
