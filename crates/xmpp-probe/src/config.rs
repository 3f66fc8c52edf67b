//! Probe configuration.
//!
//! A [`ProbeConfig`] can be built in code or loaded from TOML:
//!
//! ```toml
//! host = "example.com"
//! mode = "s2s"
//! force_starttls = true
//! timeout_secs = 5
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ProbeError;
use crate::parser::ns;

/// Default client-to-server port
pub const DEFAULT_CLIENT_PORT: u16 = 5222;
/// Default server-to-server port
pub const DEFAULT_SERVER_PORT: u16 = 5269;
/// Longest accepted overall timeout
pub const MAX_TIMEOUT_SECS: u64 = 3600;

/// Which kind of stream to open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionMode {
    /// Client-to-server (`jabber:client`)
    #[default]
    #[serde(rename = "c2s")]
    Client,
    /// Server-to-server (`jabber:server`)
    #[serde(rename = "s2s")]
    Server,
}

impl ConnectionMode {
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Client => DEFAULT_CLIENT_PORT,
            Self::Server => DEFAULT_SERVER_PORT,
        }
    }

    /// Default namespace of the opening stream header.
    pub fn namespace(&self) -> &'static str {
        match self {
            Self::Client => ns::JABBER_CLIENT,
            Self::Server => ns::JABBER_SERVER,
        }
    }
}

/// Address family preference for the connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    #[default]
    Any,
    Ipv4,
    Ipv6,
}

/// Settings for a single probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Domain used for the stream `to` attribute and TLS name verification
    pub host: String,
    /// Address to connect to, if different from `host`
    pub address: Option<String>,
    /// Port, defaults to the mode's standard port
    pub port: Option<u16>,
    pub mode: ConnectionMode,
    pub address_family: AddressFamily,
    /// Fail unless STARTTLS is offered, and use it even when optional
    pub force_starttls: bool,
    /// Verify the server certificate chain and name.
    /// Disabling this accepts any certificate and is only meant for testing.
    pub verify_certificates: bool,
    /// Report days until the server certificate expires
    pub check_certificate_expiry: bool,
    /// Additional PEM trust anchors
    pub ca_certificates: Option<PathBuf>,
    /// Overall deadline for the probe in seconds
    pub timeout_secs: u64,
    /// Upper bound for a single read wait in milliseconds
    pub read_wait_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            address: None,
            port: None,
            mode: ConnectionMode::Client,
            address_family: AddressFamily::Any,
            force_starttls: false,
            verify_certificates: true,
            check_certificate_expiry: true,
            ca_certificates: None,
            timeout_secs: 10,
            read_wait_ms: 100,
        }
    }
}

impl ProbeConfig {
    /// Create a configuration with defaults for the given host.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn read_wait(&self) -> Duration {
        Duration::from_millis(self.read_wait_ms)
    }

    /// Port to connect to.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.mode.default_port())
    }

    /// Name or address to resolve for the TCP connection.
    pub fn connect_address(&self) -> &str {
        self.address.as_deref().unwrap_or(&self.host)
    }

    /// Parse a configuration from TOML.
    pub fn from_toml_str(content: &str) -> Result<Self, ProbeError> {
        toml::from_str(content)
            .map_err(|e| ProbeError::config(format!("Failed to parse configuration: {}", e)))
    }

    /// Load a configuration file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ProbeError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProbeError::config(format!("Failed to read config file {:?}: {}", path, e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Reject settings a probe cannot run with.
    pub fn validate(&self) -> Result<(), ProbeError> {
        if self.host.trim().is_empty() {
            return Err(ProbeError::config("host must not be empty"));
        }
        if self.timeout_secs == 0 {
            return Err(ProbeError::config("timeout must be at least one second"));
        }
        if self.timeout_secs > MAX_TIMEOUT_SECS {
            return Err(ProbeError::config(format!(
                "timeout must not exceed {} seconds",
                MAX_TIMEOUT_SECS
            )));
        }
        if self.read_wait_ms == 0 {
            return Err(ProbeError::config("read wait must be greater than zero"));
        }
        Ok(())
    }
}
