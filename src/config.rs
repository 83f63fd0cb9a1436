use serde::Deserialize;

// ------------------------------------------------------------
// Root configuration
// ------------------------------------------------------------
//
// This is the top-level configuration structure loaded from
// `config.json` by the demo binary.
//
// It defines:
// - The server to connect to
// - Channels to subscribe on startup
// - Event names to watch and log
// - Optional debug configuration
//
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Connection settings for the WebsocketRails server
    pub server: ServerConfig,

    /// Channels subscribed right after the handshake
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,

    /// Global event names logged when they arrive
    #[serde(default)]
    pub watch: Vec<String>,

    /// Optional debug configuration
    pub debug: Option<DebugConfig>,
}

// ------------------------------------------------------------
// Server configuration
// ------------------------------------------------------------
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// WebSocket URL of the server (ws:// or wss://)
    pub url: String,

    /// Seconds to wait for the handshake before giving up
    pub connect_timeout_secs: Option<u64>,
}

// ------------------------------------------------------------
// Channel configuration
// ------------------------------------------------------------
//
// One entry per channel to join on startup. Private channels go
// through the server's authorization path; the demo forwards no
// auth payload.
//
#[derive(Debug, Deserialize, Clone)]
pub struct ChannelConfig {
    /// Channel name
    pub name: String,

    /// Subscribe through the private handshake
    #[serde(default)]
    pub private: bool,

    /// Event names on this channel logged when they arrive
    #[serde(default)]
    pub events: Vec<String>,
}

// ------------------------------------------------------------
// Debug configuration
// ------------------------------------------------------------
#[derive(Debug, Deserialize, Clone)]
pub struct DebugConfig {
    /// Enables logging of every raw frame decision at debug level
    pub log: Option<bool>,
}
