//! Real-time channel configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Real-time event channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Socket endpoint of the ride backend.
    #[serde(default = "default_url")]
    pub url: String,
    /// How long to wait for the transport's open acknowledgment.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Liveness probing.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    /// Reconnection policy for unexpected disconnects.
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// Offline send queue.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Inbound duplicate suppression.
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    /// Protocol version negotiation.
    #[serde(default)]
    pub protocol: ProtocolConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            connect_timeout_ms: default_connect_timeout(),
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
            queue: QueueConfig::default(),
            idempotency: IdempotencyConfig::default(),
            protocol: ProtocolConfig::default(),
        }
    }
}

impl ChannelConfig {
    /// Connect timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Rejects values that would make the channel misbehave at runtime.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.url.trim().is_empty() {
            return Err(AppError::configuration("channel.url must not be empty"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(AppError::configuration(
                "channel.connect_timeout_ms must be positive",
            ));
        }
        if self.heartbeat.interval_seconds == 0 || self.heartbeat.timeout_seconds == 0 {
            return Err(AppError::configuration(
                "heartbeat interval and timeout must be positive",
            ));
        }
        if self.heartbeat.max_missed == 0 {
            return Err(AppError::configuration(
                "heartbeat.max_missed must be at least 1",
            ));
        }
        if self.reconnect.base_delay_ms == 0 {
            return Err(AppError::configuration(
                "reconnect.base_delay_ms must be positive",
            ));
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(AppError::configuration(
                "reconnect.max_delay_ms must not be below base_delay_ms",
            ));
        }
        if !(0.0..1.0).contains(&self.reconnect.jitter) {
            return Err(AppError::configuration(
                "reconnect.jitter must be within [0, 1)",
            ));
        }
        if self.queue.max_size == 0 || self.idempotency.max_entries == 0 {
            return Err(AppError::configuration(
                "queue.max_size and idempotency.max_entries must be positive",
            ));
        }
        if self.queue.storage_key.is_empty() {
            return Err(AppError::configuration("queue.storage_key must not be empty"));
        }
        Ok(())
    }
}

/// Ping/pong liveness settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Seconds between pings.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_seconds: u64,
    /// Seconds to wait for a pong before counting a miss.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_seconds: u64,
    /// Consecutive misses after which the connection is declared dead.
    #[serde(default = "default_max_missed")]
    pub max_missed: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_heartbeat_interval(),
            timeout_seconds: default_heartbeat_timeout(),
            max_missed: default_max_missed(),
        }
    }
}

impl HeartbeatConfig {
    /// Ping interval.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    /// Pong timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Exponential backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    /// Upper bound for any retry delay.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// Jitter factor `J`; delays are scaled by a uniform factor in `[1-J, 1+J]`.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Attempts before giving up with `reconnect_failed`.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Fixed RNG seed for reproducible jitter. Unset in production.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            jitter: default_jitter(),
            max_attempts: default_max_attempts(),
            seed: None,
        }
    }
}

impl ReconnectConfig {
    /// Base delay.
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Delay cap.
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Offline queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum queued messages; the oldest is evicted beyond this.
    #[serde(default = "default_queue_size")]
    pub max_size: usize,
    /// Messages older than this are never sent.
    #[serde(default = "default_max_age")]
    pub max_age_seconds: u64,
    /// Failed sends beyond this count drop the message.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Coalescing window for persistence writes.
    #[serde(default = "default_persist_debounce")]
    pub persist_debounce_ms: u64,
    /// Storage key holding the serialized queue.
    #[serde(default = "default_storage_key")]
    pub storage_key: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: default_queue_size(),
            max_age_seconds: default_max_age(),
            max_retries: default_max_retries(),
            persist_debounce_ms: default_persist_debounce(),
            storage_key: default_storage_key(),
        }
    }
}

impl QueueConfig {
    /// Maximum message age.
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_seconds)
    }

    /// Persistence debounce window.
    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }
}

/// Duplicate suppression settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// Identifiers remembered before the set is trimmed to its newest half.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
        }
    }
}

/// Protocol negotiation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Lowest server major version considered compatible.
    #[serde(default = "default_min_server_major")]
    pub min_server_major: u64,
    /// How long to wait for the server's `protocol_version` reply.
    #[serde(default = "default_negotiation_timeout")]
    pub negotiation_timeout_ms: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            min_server_major: default_min_server_major(),
            negotiation_timeout_ms: default_negotiation_timeout(),
        }
    }
}

impl ProtocolConfig {
    /// Negotiation timeout.
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }
}

fn default_url() -> String {
    "ws://localhost:3000/realtime".to_string()
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_heartbeat_interval() -> u64 {
    25
}

fn default_heartbeat_timeout() -> u64 {
    10
}

fn default_max_missed() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    1_000
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    0.1
}

fn default_max_attempts() -> u32 {
    10
}

fn default_queue_size() -> usize {
    100
}

fn default_max_age() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_persist_debounce() -> u64 {
    2_000
}

fn default_storage_key() -> String {
    "ridelink.offline_queue".to_string()
}

fn default_max_entries() -> usize {
    1000
}

fn default_min_server_major() -> u64 {
    2
}

fn default_negotiation_timeout() -> u64 {
    5_000
}
