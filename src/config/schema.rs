use crate::store::ReconcilePolicy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ── Top-level ───────────────────────────────────────────────────

/// Root configuration, loaded from `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub topics: TopicConfig,
    pub sync: SyncConfig,
    pub position: PositionConfig,
}

// ── Broker ──────────────────────────────────────────────────────

/// MQTT broker connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// Fixed client id. A random `roadwatch-<uuid>` is used when unset.
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// MQTT keep-alive interval (minimum 5).
    pub keep_alive_secs: u64,
    /// How long to wait for CONNACK.
    pub connect_timeout_secs: u64,
    /// Outgoing request queue depth of the MQTT client.
    pub channel_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: None,
            username: None,
            password: None,
            keep_alive_secs: 20,
            connect_timeout_secs: 10,
            channel_capacity: 64,
        }
    }
}

// ── Topics ──────────────────────────────────────────────────────

/// Topic names for the two logical channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct TopicConfig {
    /// New-marker announcements.
    pub new_marker: String,
    /// Approval announcements.
    pub approval: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            new_marker: "WORLD".into(),
            approval: "ApproveWORLD".into(),
        }
    }
}

// ── Sync engine ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SyncConfig {
    /// Merge rule for events that hit an existing marker.
    pub policy: ReconcilePolicy,
    /// Extra publish attempts for an approval before rolling it back.
    pub publish_retries: u32,
    /// Delay between approval publish attempts.
    pub publish_retry_delay_ms: u64,
    /// Drop byte-identical events on the same topic seen within this window.
    /// `0` disables the window.
    pub dedup_window_secs: u64,
    /// Upper bound on remembered events in the dedup window.
    pub dedup_capacity: usize,
    /// Age after which an approval whose echo never arrived is reconciled.
    pub pending_timeout_secs: u64,
    pub backoff: BackoffConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            policy: ReconcilePolicy::LastWriteWins,
            publish_retries: 2,
            publish_retry_delay_ms: 250,
            dedup_window_secs: 0,
            dedup_capacity: 4096,
            pending_timeout_secs: 30,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Exponential backoff for connect attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    /// Give up after this many attempts. `0` retries forever.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 500,
            max_ms: 30_000,
            max_attempts: 10,
        }
    }
}

// ── Positioning ─────────────────────────────────────────────────

/// Fixed starting position for the viewport. Both fields must be set for the
/// position to be used.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PositionConfig {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}
