//! Engine configuration.
//!
//! Owned and persisted by the embedding application; the engine reads it once
//! at session start and never mutates it.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which topology the session runs over. Selected at session start, never
/// per message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// All traffic fans out through a central broker (STOMP over WebSocket).
    Relay,
    /// Direct peer data channels, with a signaling server for introduction.
    Mesh,
}

/// Locally configured size ceiling.
///
/// The legacy on-disk encoding overloaded one integer: `0` meant "use the
/// server ceiling" and any negative value meant "unlimited". Those are three
/// different states, so they get three explicit variants here; `from_raw`
/// keeps compatibility with the legacy encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "bytes")]
pub enum LocalSizeLimit {
    /// No local opinion; only the server-declared ceiling applies.
    Inherit,
    /// Accept any size locally (the mesh-mode convention).
    Unlimited,
    /// Hard local ceiling in bytes.
    Bytes(u64),
}

impl LocalSizeLimit {
    /// Normalize the legacy sentinel encoding.
    pub fn from_raw(raw: i64) -> Self {
        match raw {
            0 => LocalSizeLimit::Inherit,
            n if n < 0 => LocalSizeLimit::Unlimited,
            n => LocalSizeLimit::Bytes(n as u64),
        }
    }
}

impl Default for LocalSizeLimit {
    fn default() -> Self {
        LocalSizeLimit::Inherit
    }
}

/// Everything the engine needs to run one sync session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub mode: TransportMode,

    /// WebSocket endpoint: the broker socket in relay mode, the signaling
    /// server in mesh mode.
    pub websocket_url: String,

    /// Session cookie obtained at login, attached to every WebSocket connect.
    #[serde(default)]
    pub cookie: Option<String>,

    /// Whether payloads are wrapped in encrypted envelopes. Must match across
    /// the whole fleet.
    #[serde(default)]
    pub cipher_enabled: bool,

    /// Server-declared maximum payload size in bytes, if the server declared
    /// one.
    #[serde(default)]
    pub server_max_size: Option<u64>,

    #[serde(default)]
    pub local_size_limit: LocalSizeLimit,

    #[serde(default = "default_true")]
    pub enable_image_sharing: bool,

    #[serde(default = "default_true")]
    pub enable_file_sharing: bool,

    /// STUN server URL for ICE gathering (mesh mode only).
    #[serde(default)]
    pub stun_url: Option<String>,

    /// Broker destination the session subscribes to (relay mode).
    #[serde(default = "default_subscription_destination")]
    pub subscription_destination: String,

    /// Broker destination outbound messages are published to (relay mode).
    #[serde(default = "default_send_destination")]
    pub send_destination: String,

    /// Fragment size threshold for transports with frame limits.
    #[serde(default = "default_fragment_size")]
    pub fragment_size: usize,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,

    /// Inbound silence beyond this is treated as connection loss (relay mode).
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_subscription_destination() -> String {
    "/topic/cliptext".to_string()
}

fn default_send_destination() -> String {
    "/app/cliptext".to_string()
}

fn default_fragment_size() -> usize {
    15 * 1024
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_reconnect_delay_secs() -> u64 {
    10
}

fn default_heartbeat_timeout_secs() -> u64 {
    20
}

impl SyncConfig {
    pub fn new(mode: TransportMode, websocket_url: impl Into<String>) -> Self {
        Self {
            mode,
            websocket_url: websocket_url.into(),
            cookie: None,
            cipher_enabled: false,
            server_max_size: None,
            local_size_limit: LocalSizeLimit::default(),
            enable_image_sharing: true,
            enable_file_sharing: true,
            stun_url: None,
            subscription_destination: default_subscription_destination(),
            send_destination: default_send_destination(),
            fragment_size: default_fragment_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}
