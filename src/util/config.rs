//! Configuration structures

use std::path::Path;
use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::consts;
use crate::transport::{ClientAuth, TcpSettings, TlsSettings};
use crate::{NetError, Result};

/// Driver configuration, loadable from TOML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Selector thread settings
    #[serde(default)]
    pub selector: SelectorConfig,
    /// Task executor settings
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// TCP socket options
    #[serde(default)]
    pub tcp: TcpSettings,
    /// TLS parameters
    #[serde(default)]
    pub tls: TlsConfig,
}

/// Selector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// Interval between idle sweeps (ms)
    #[serde(default = "default_idle_interval")]
    pub idle_interval_ms: u64,
    /// Idle timeout applied to transports reporting a negative timeout (ms)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,
    /// Max readiness events handled per pass
    #[serde(default = "default_poll_capacity")]
    pub poll_capacity: usize,
}

fn default_idle_interval() -> u64 { consts::DEFAULT_IDLE_INTERVAL }
fn default_idle_timeout() -> u64 { consts::DEFAULT_IDLE_TIMEOUT }
fn default_poll_capacity() -> usize { consts::DEFAULT_POLL_CAPACITY }

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            idle_interval_ms: default_idle_interval(),
            idle_timeout_ms: default_idle_timeout(),
            poll_capacity: default_poll_capacity(),
        }
    }
}

impl SelectorConfig {
    pub fn idle_interval_duration(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    pub fn idle_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Executor configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Worker threads of the built-in runtime; 0 uses the number of CPUs
    #[serde(default)]
    pub worker_threads: usize,
}

/// TLS configuration values; certificates are supplied programmatically
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Client authentication: "none", "want" or "need"
    #[serde(default = "default_client_auth")]
    pub client_auth: String,
    /// Enabled protocol versions, e.g. "TLSv1.3"
    #[serde(default)]
    pub protocols: Vec<String>,
    /// Enabled cipher suites, e.g. "TLS13_AES_128_GCM_SHA256"
    #[serde(default)]
    pub cipher_suites: Vec<String>,
    /// Server name presented by clients
    #[serde(default)]
    pub server_name: Option<String>,
}

fn default_client_auth() -> String { "none".to_string() }

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            client_auth: default_client_auth(),
            protocols: Vec::new(),
            cipher_suites: Vec::new(),
            server_name: None,
        }
    }
}

impl TlsConfig {
    /// Convert into TLS settings, validating the client auth token
    pub fn to_settings(&self) -> Result<TlsSettings> {
        let client_auth: ClientAuth = self.client_auth.parse()?;
        let mut settings = TlsSettings::default()
            .with_client_auth(client_auth)
            .with_protocols(self.protocols.clone())
            .with_cipher_suites(self.cipher_suites.clone());
        if let Some(name) = &self.server_name {
            settings = settings.with_server_name(name.clone());
        }
        Ok(settings)
    }
}

impl DriverConfig {
    /// Parse a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| NetError::Config(format!("Invalid driver config: {}", e)))
    }

    /// Load a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            NetError::Config(format!("Failed to read config file: {}", e))
        })?;
        Self::from_toml_str(&text)
    }
}
