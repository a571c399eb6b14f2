//! Session configuration
//!
//! All timing knobs for the heartbeat supervisor, join handshake and
//! rendezvous reconnection live here. Durations are written as integer
//! milliseconds when serialized, so a JSON config file looks like:
//!
//! ```json
//! { "heartbeat_interval_ms": 2000, "peer_timeout_ms": 6000 }
//! ```
//!
//! Missing fields fall back to [`SessionConfig::default`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Default cap on the chat transcript
pub const DEFAULT_MAX_CHAT_MESSAGES: usize = 200;

/// Default capacity for event broadcast channels
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Exponential backoff schedule for restoring the local rendezvous link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    #[serde(rename = "base_delay_ms", with = "duration_ms")]
    pub base_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Delay before the given attempt (1-based): base, 2x base, 4x base, ... capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 8,
        }
    }
}

/// Configuration for one [`crate::Session`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Interval between heartbeats on every active connection
    #[serde(rename = "heartbeat_interval_ms", with = "duration_ms")]
    pub heartbeat_interval: Duration,
    /// Silence after which a peer is marked `Reconnecting`
    #[serde(rename = "peer_timeout_ms", with = "duration_ms")]
    pub peer_timeout: Duration,
    /// Silence after which a peer is marked `Offline` and its connection dropped
    #[serde(rename = "offline_timeout_ms", with = "duration_ms")]
    pub offline_timeout: Duration,
    /// Upper bound on waiting for a JOIN_RESPONSE
    #[serde(rename = "join_timeout_ms", with = "duration_ms")]
    pub join_timeout: Duration,
    /// Chat transcript cap, oldest evicted first
    pub max_chat_messages: usize,
    /// Capacity of the session and document event channels
    pub event_capacity: usize,
    /// Retry with a random suffix when the preferred identity is taken
    pub identity_fallback: bool,
    pub reconnect: ReconnectPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(2),
            peer_timeout: Duration::from_secs(6),
            offline_timeout: Duration::from_secs(30),
            join_timeout: Duration::from_secs(15),
            max_chat_messages: DEFAULT_MAX_CHAT_MESSAGES,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            identity_fallback: false,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl SessionConfig {
    /// Load a config from a JSON file, then validate it
    pub fn from_json_file(path: impl AsRef<Path>) -> SyncResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: SessionConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check timing relationships the supervisor relies on
    pub fn validate(&self) -> SyncResult<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(SyncError::Config("heartbeat_interval must be non-zero".into()));
        }
        if self.peer_timeout <= self.heartbeat_interval {
            return Err(SyncError::Config(
                "peer_timeout must be longer than heartbeat_interval".into(),
            ));
        }
        if self.offline_timeout <= self.peer_timeout {
            return Err(SyncError::Config(
                "offline_timeout must be longer than peer_timeout".into(),
            ));
        }
        if self.max_chat_messages == 0 {
            return Err(SyncError::Config("max_chat_messages must be non-zero".into()));
        }
        if self.event_capacity == 0 {
            return Err(SyncError::Config("event_capacity must be non-zero".into()));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(SyncError::Config("reconnect.max_attempts must be non-zero".into()));
        }
        Ok(())
    }

    pub fn with_heartbeat(mut self, interval: Duration, peer_timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.peer_timeout = peer_timeout;
        self
    }

    pub fn with_offline_timeout(mut self, timeout: Duration) -> Self {
        self.offline_timeout = timeout;
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_identity_fallback(mut self, enabled: bool) -> Self {
        self.identity_fallback = enabled;
        self
    }

    pub fn with_max_chat_messages(mut self, cap: usize) -> Self {
        self.max_chat_messages = cap;
        self
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
