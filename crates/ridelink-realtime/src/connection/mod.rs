//! Connection lifecycle: supervisor, backoff, heartbeat, timers.

pub mod backoff;
pub mod heartbeat;
pub mod state;
pub mod supervisor;
pub mod timer;

pub use backoff::Backoff;
pub use heartbeat::{HeartbeatEvent, HeartbeatMonitor};
pub use state::ConnectionState;
pub use supervisor::{RealtimeClient, SendOutcome};
pub use timer::{ScheduledTask, TimerSlot};
