//! Engine option types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// What to do with events for a user who has no deliverable connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OfflinePolicy {
    /// Hold events up to `offline_buffer_capacity` for `offline_buffer_window_ms`.
    #[default]
    Buffer,
    /// Discard immediately (still counted).
    Drop,
}

/// Options recognized by the relay engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Upper bound on one transport send.
    pub send_timeout_ms: u64,
    /// Interval between heartbeat checks.
    pub heartbeat_interval_ms: u64,
    /// Extra send attempts on one connection after a timeout.
    pub max_retry_per_connection: u32,
    /// Whether disconnected primaries fail over to backups.
    pub failover_enabled: bool,
    /// Consecutive missed heartbeats before a connection is marked degraded.
    pub heartbeat_degraded_after: u32,
    /// Consecutive missed heartbeats before a connection is marked disconnected.
    pub heartbeat_max_missed: u32,
    /// How long `wait_for_handshake` waits for a connection to leave `connecting`.
    pub handshake_timeout_ms: u64,
    /// Number of connection registry shards.
    pub registry_shards: usize,
    /// Capacity of each connection's outbound channel.
    pub connection_channel_capacity: usize,
    /// Offline handling.
    pub offline_policy: OfflinePolicy,
    /// Maximum buffered events per offline user.
    pub offline_buffer_capacity: usize,
    /// Maximum age of a buffered event.
    pub offline_buffer_window_ms: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            send_timeout_ms: 250,
            heartbeat_interval_ms: 15_000,
            max_retry_per_connection: 2,
            failover_enabled: true,
            heartbeat_degraded_after: 1,
            heartbeat_max_missed: 3,
            handshake_timeout_ms: 5_000,
            registry_shards: 16,
            connection_channel_capacity: 256,
            offline_policy: OfflinePolicy::Buffer,
            offline_buffer_capacity: 128,
            offline_buffer_window_ms: 30_000,
        }
    }
}

impl EngineOptions {
    /// Send timeout as a `Duration`.
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Heartbeat interval as a `Duration`.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Handshake timeout as a `Duration`.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Offline buffer window as a `Duration`.
    pub fn offline_buffer_window(&self) -> Duration {
        Duration::from_millis(self.offline_buffer_window_ms)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("send_timeout_ms", self.send_timeout_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("registry_shards", self.registry_shards as u64),
            ("connection_channel_capacity", self.connection_channel_capacity as u64),
            ("heartbeat_max_missed", u64::from(self.heartbeat_max_missed)),
        ];
        for (key, value) in nonzero {
            if value == 0 {
                return Err(SettingsError::InvalidValue(format!("{key} must be > 0")));
            }
        }
        if self.heartbeat_degraded_after > self.heartbeat_max_missed {
            return Err(SettingsError::InvalidValue(
                "heartbeat_degraded_after must not exceed heartbeat_max_missed".into(),
            ));
        }
        Ok(())
    }
}
