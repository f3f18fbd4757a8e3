//! Server configuration
//!
//! Settings come from an optional YAML file merged with explicit overrides
//! from the command line. Each option falls back individually: override
//! beats file, file beats default.

use crate::auth::TokenEntry;
use crate::hub::HubConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },

    #[error("invalid listen address {0:?}")]
    BadAddr(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Public listener accepting tunneled traffic.
    #[serde(default)]
    pub proxy: ProxySection,

    /// Control listener accepting agent WebSockets.
    #[serde(default)]
    pub manager: ManagerSection,

    #[serde(default)]
    pub auth: AuthSection,

    #[serde(default)]
    pub tunnel: TunnelSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySection {
    #[serde(default = "default_proxy_addr")]
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerSection {
    #[serde(default = "default_manager_addr")]
    pub addr: String,

    /// PEM-encoded certificate chain. TLS is enabled on the control port
    /// when both `cert` and `key` are present.
    #[serde(default)]
    pub cert: Option<String>,

    /// PEM-encoded private key.
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthSection {
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSection {
    /// How long a minted ticket waits for its data socket.
    #[serde(default = "default_ticket_timeout")]
    pub ticket_timeout_secs: u64,

    /// Drain allowance after one side of a splice finishes.
    #[serde(default = "default_linger")]
    pub linger_secs: u64,
}

fn default_proxy_addr() -> String {
    ":8080".to_string()
}

fn default_manager_addr() -> String {
    ":8081".to_string()
}

fn default_ticket_timeout() -> u64 {
    30
}

fn default_linger() -> u64 {
    5
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            addr: default_proxy_addr(),
        }
    }
}

impl Default for ManagerSection {
    fn default() -> Self {
        Self {
            addr: default_manager_addr(),
            cert: None,
            key: None,
        }
    }
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self {
            ticket_timeout_secs: default_ticket_timeout(),
            linger_secs: default_linger(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a YAML file. A missing path yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Apply command-line overrides, one option at a time.
    pub fn apply_overrides(&mut self, proxy_addr: Option<String>, manager_addr: Option<String>) {
        if let Some(addr) = proxy_addr {
            self.proxy.addr = addr;
        }
        if let Some(addr) = manager_addr {
            self.manager.addr = addr;
        }
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            ticket_timeout: Duration::from_secs(self.tunnel.ticket_timeout_secs),
            linger: Duration::from_secs(self.tunnel.linger_secs),
        }
    }
}

/// Resolve a listen address. A bare `:port` binds every interface.
pub fn parse_listen_addr(addr: &str) -> Result<SocketAddr, ConfigError> {
    let candidate = if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{}", port)
    } else {
        addr.to_string()
    };
    candidate
        .parse()
        .map_err(|_| ConfigError::BadAddr(addr.to_string()))
}
