//! TOML configuration for the echo daemon.
//!
//! Every field has a default so the daemon runs without any config file:
//!
//! ```toml
//! [listen]
//! address = "127.0.0.1"
//! port = 8192
//!
//! [tls]
//! certificate = "/etc/netwire/cert.pem"
//! key = "/etc/netwire/key.pem"
//!
//! [session]
//! idle_timeout_ms = 30000
//! max_payload = 1048576
//! edge_triggered = true
//! ```
//!
//! TLS is enabled by supplying both `certificate` and `key`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("[tls] needs both certificate and key, or neither")]
    PartialTls,
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

/// Listener address settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListenConfig {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

/// Optional TLS key material.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TlsConfig {
    #[serde(default)]
    pub certificate: Option<PathBuf>,
    #[serde(default)]
    pub key: Option<PathBuf>,
}

/// Per-connection behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Connections idle for longer than this are dropped.  Negative
    /// disables the idle timeout.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: i64,
    /// Largest accepted frame payload in bytes; 0 disables the limit.
    #[serde(default = "default_max_payload")]
    pub max_payload: u64,
    /// Edge-triggered kernel notification (the default); level-triggered
    /// otherwise.
    #[serde(default = "default_edge_triggered")]
    pub edge_triggered: bool,
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8192
}

fn default_backlog() -> i32 {
    64
}

fn default_idle_timeout_ms() -> i64 {
    30_000
}

fn default_max_payload() -> u64 {
    1024 * 1024
}

fn default_edge_triggered() -> bool {
    true
}

impl Default for ListenConfig {
    fn default() -> Self {
        ListenConfig {
            address: default_address(),
            port: default_port(),
            backlog: default_backlog(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            idle_timeout_ms: default_idle_timeout_ms(),
            max_payload: default_max_payload(),
            edge_triggered: default_edge_triggered(),
        }
    }
}

impl TlsConfig {
    pub fn enabled(&self) -> bool {
        self.certificate.is_some() && self.key.is_some()
    }
}

impl AppConfig {
    /// Loads and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: AppConfig = toml::from_str(&text)?;
        if config.tls.certificate.is_some() != config.tls.key.is_some() {
            return Err(ConfigError::PartialTls);
        }
        Ok(config)
    }
}
