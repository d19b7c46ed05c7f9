//! Offline send queue.

pub mod queue;

pub use queue::{EnqueueOutcome, FlushReport, OfflineQueue, QueuedMessage};
