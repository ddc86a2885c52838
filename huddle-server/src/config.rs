//! Configuration loading for the huddle server.
//!
//! Configuration is loaded from a TOML file (default: `huddle.toml`);
//! every field has a default so a missing file or sparse sections work.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Protocol timeouts and frame limits.
    #[serde(default)]
    pub protocol: ProtocolConfig,
    /// Token lifetimes and the expiry sweeper.
    #[serde(default)]
    pub tokens: TokenConfig,
    /// Rate limiting.
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// HTTP/websocket bind configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the HTTP surface (default: 0.0.0.0:7070).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

/// Protocol timing configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolConfig {
    /// Deadline for outbound requests in seconds (default: 60).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Deadline for host approval of a join in seconds (default: 120).
    #[serde(default = "default_join_approval_timeout_secs")]
    pub join_approval_timeout_secs: u64,
    /// Deadline for `peer.init` after connect in seconds (default: 10).
    /// Connections that stay silent this long are dropped.
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
}

/// Token configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    /// Login token lifetime in seconds (default: 600).
    #[serde(default = "default_login_ttl_secs")]
    pub login_ttl_secs: u64,
    /// Join token lifetime in seconds (default: 300).
    #[serde(default = "default_join_ttl_secs")]
    pub join_ttl_secs: u64,
    /// Sweep interval for expired tokens in seconds (default: 60).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Enable the sweeper task (default: true).
    #[serde(default = "default_sweep_enabled")]
    pub sweep_enabled: bool,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Login attempts per public key per minute (default: 30).
    #[serde(default = "default_logins_per_minute")]
    pub logins_per_minute: u32,
    /// Join-token requests per user per minute (default: 30).
    #[serde(default = "default_sessions_per_minute")]
    pub sessions_per_minute: u32,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:7070".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_join_approval_timeout_secs() -> u64 {
    120
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_login_ttl_secs() -> u64 {
    600
}

fn default_join_ttl_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_sweep_enabled() -> bool {
    true
}

fn default_logins_per_minute() -> u32 {
    30
}

fn default_sessions_per_minute() -> u32 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            join_approval_timeout_secs: default_join_approval_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
        }
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            login_ttl_secs: default_login_ttl_secs(),
            join_ttl_secs: default_join_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            sweep_enabled: default_sweep_enabled(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            logins_per_minute: default_logins_per_minute(),
            sessions_per_minute: default_sessions_per_minute(),
        }
    }
}

impl ProtocolConfig {
    /// Request deadline as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Join approval deadline as a [`Duration`].
    pub fn join_approval_timeout(&self) -> Duration {
        Duration::from_secs(self.join_approval_timeout_secs)
    }

    /// Handshake deadline as a [`Duration`].
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse the configuration file.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}
