//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::*;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Transport configuration
    pub network: NetworkConfig,

    /// Session configuration
    pub session: SessionConfig,
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Local bind address for servers
    pub bind_address: String,

    /// UDP port the server listens on
    pub port: u16,

    /// Socket send buffer size
    pub send_buffer_size: usize,

    /// Socket receive buffer size
    pub recv_buffer_size: usize,

    /// Enable SO_REUSEADDR
    pub reuse_addr: bool,

    /// Peer slots allocated by a server host
    pub max_clients: usize,

    /// Initial retransmission timeout in ms
    pub retransmit_ms: u64,

    /// Keepalive interval in ms
    pub ping_interval_ms: u64,

    /// Drop a peer whose reliable traffic stays unacknowledged this long (ms)
    pub peer_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            send_buffer_size: 256 * 1024,
            recv_buffer_size: 256 * 1024,
            reuse_addr: false,
            max_clients: MAX_CLIENTS,
            retransmit_ms: DEFAULT_RETRANSMIT_MS,
            ping_interval_ms: DEFAULT_PING_INTERVAL_MS,
            peer_timeout_ms: DEFAULT_PEER_TIMEOUT_MS,
        }
    }
}

impl NetworkConfig {
    pub fn retransmit_timeout(&self) -> Duration {
        Duration::from_millis(self.retransmit_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Server host a client connects to
    pub server_host: String,

    /// Server port a client connects to
    pub server_port: u16,

    /// Bound on blocking connect and disconnect calls (ms)
    pub timeout_ms: u64,

    /// Received payloads are truncated to this many bytes
    pub max_message_len: usize,

    /// Demo loop period (ms)
    pub tick_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_host: DEFAULT_HOST.to_string(),
            server_port: DEFAULT_PORT,
            timeout_ms: TIMEOUT_MS,
            max_message_len: MAX_MESSAGE_LEN,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
        }
    }
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl AppConfig {
    /// Load configuration from file
    pub fn load(path: &PathBuf) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(e.to_string()))?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &PathBuf) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get default config file path
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "maze-netcode", "duplex-session")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from the default path, falling back to defaults when absent
    pub fn load_or_default() -> Self {
        match Self::default_path() {
            Some(path) if path.exists() => match Self::load(&path) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("Ignoring config at {}: {}", path.display(), e);
                    Self::default()
                }
            },
            _ => Self::default(),
        }
    }
}
