//! Configuration system for distribus.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $DISTRIBUS_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/distribus/config.toml
//!   3. ~/.config/distribus/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DistribusConfig {
    pub host: HostConfig,
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Address advertised in this host's url.
    pub address: String,
    /// WebSocket port. 0 = OS-assigned.
    pub port: u16,
    /// Urls of hosts to join at startup.
    pub join: Vec<String>,
    /// Ids of peers created at startup.
    pub peers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Logical network this host belongs to. Unset = adopt the first one seen.
    pub network_id: Option<String>,
    /// Give up reconnecting this long after a connection was lost.
    pub reconnect_timeout_ms: u64,
    /// Delay before the first reconnect attempt.
    pub reconnect_delay_ms: u64,
    /// Each failed attempt divides the delay by this factor.
    pub reconnect_decay: f64,
    /// How long a request waits for its response.
    pub request_timeout_ms: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            address: "localhost".to_string(),
            port: 3000,
            join: Vec::new(),
            peers: Vec::new(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            network_id: None,
            reconnect_timeout_ms: 5 * 60 * 1000,
            reconnect_delay_ms: 1000,
            reconnect_decay: 1.5,
            request_timeout_ms: 60_000,
        }
    }
}

impl NetworkConfig {
    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("distribus")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl DistribusConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            DistribusConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("DISTRIBUS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&DistribusConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply DISTRIBUS_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("DISTRIBUS_HOST__ADDRESS") {
            self.host.address = v;
        }
        if let Some(p) = var("DISTRIBUS_HOST__PORT").and_then(|v| v.parse().ok()) {
            self.host.port = p;
        }
        if let Some(v) = var("DISTRIBUS_HOST__JOIN") {
            self.host.join = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = var("DISTRIBUS_NETWORK__ID") {
            self.network.network_id = Some(v).filter(|id| !id.is_empty());
        }
        if let Some(ms) = var("DISTRIBUS_NETWORK__RECONNECT_DELAY_MS").and_then(|v| v.parse().ok()) {
            self.network.reconnect_delay_ms = ms;
        }
        if let Some(ms) =
            var("DISTRIBUS_NETWORK__RECONNECT_TIMEOUT_MS").and_then(|v| v.parse().ok())
        {
            self.network.reconnect_timeout_ms = ms;
        }
    }
}
