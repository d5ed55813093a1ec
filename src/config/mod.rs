//! Configuration management

use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Which side of the tunnel this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Dials out and maintains the carrier pool.
    #[serde(alias = "client")]
    Initiator,
    /// Listens for carriers and validates the endpoint id.
    #[serde(alias = "server")]
    Responder,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Initiator => write!(f, "initiator"),
            Mode::Responder => write!(f, "responder"),
        }
    }
}

/// Main configuration
///
/// Both endpoints load the same file format; `mode` selects which of the
/// mode-specific fields are required.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Endpoint identifier shared by both peers (textual UUID).
    pub id: Uuid,
    /// `initiator` or `responder`.
    pub mode: Mode,

    /// TUN device name. Empty lets the system pick one.
    #[serde(default)]
    pub name: String,
    /// TUN MTU.
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    /// IPv4 prefixes assigned to the TUN device.
    #[serde(default)]
    pub ipv4: Vec<Ipv4Net>,
    /// IPv6 prefixes assigned to the TUN device.
    #[serde(default)]
    pub ipv6: Vec<Ipv6Net>,

    /// Number of workers draining the outbound queue.
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Remote `host:port` (initiator).
    pub endpoint: Option<String>,
    /// Skip TLS certificate verification (initiator).
    #[serde(default)]
    pub insecure: bool,
    /// Extra PEM trust anchors appended to the built-in roots (initiator).
    pub ca_bundle: Option<PathBuf>,
    /// Steady-state number of carriers to maintain (initiator).
    #[serde(default = "default_connection_count")]
    pub connection_count: usize,

    /// Bind address (responder).
    pub listen_addr: Option<IpAddr>,
    /// Bind port (responder).
    pub listen_port: Option<u16>,
    /// TLS certificate and key paths (responder).
    pub certificate: Option<CertificateConfig>,

    /// Outbound (device-to-remote) queue capacity.
    #[serde(default = "default_buffer_size")]
    pub device_to_remote_buffer_size: usize,
    /// Inbound (remote-to-device) queue capacity.
    #[serde(default = "default_buffer_size")]
    pub remote_to_device_buffer_size: usize,
}

/// TLS certificate material for the responder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateConfig {
    /// Certificate chain path (PEM).
    pub crt: PathBuf,
    /// Private key path (PEM).
    pub key: PathBuf,
}

fn default_mtu() -> u16 {
    1400
}

fn default_threads() -> usize {
    4
}

fn default_connection_count() -> usize {
    4
}

fn default_buffer_size() -> usize {
    512
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Check mode-dependent requirements up front so a bad file fails at
    /// startup rather than mid-run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ipv4.is_empty() && self.ipv6.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one ipv4 or ipv6 prefix is required".to_string(),
            ));
        }
        if self.threads == 0 {
            return Err(ConfigError::Invalid("threads must be at least 1".to_string()));
        }
        if self.device_to_remote_buffer_size == 0 || self.remote_to_device_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "queue buffer sizes must be at least 1".to_string(),
            ));
        }

        match self.mode {
            Mode::Initiator => {
                let endpoint = self.endpoint.as_deref().ok_or_else(|| {
                    ConfigError::Invalid("initiator requires an endpoint".to_string())
                })?;
                crate::transport::split_host_port(endpoint).map_err(|e| {
                    ConfigError::Invalid(format!("bad endpoint {:?}: {}", endpoint, e))
                })?;
                if self.connection_count == 0 {
                    return Err(ConfigError::Invalid(
                        "connection-count must be at least 1".to_string(),
                    ));
                }
            }
            Mode::Responder => {
                if self.listen_addr.is_none() {
                    return Err(ConfigError::Invalid(
                        "responder requires listen-addr".to_string(),
                    ));
                }
                if self.listen_port.is_none() {
                    return Err(ConfigError::Invalid(
                        "responder requires listen-port".to_string(),
                    ));
                }
                if self.certificate.is_none() {
                    return Err(ConfigError::Invalid(
                        "responder requires certificate.crt and certificate.key".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }
}
