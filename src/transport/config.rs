//! Transport option values

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use serde::{Deserialize, Serialize};

use crate::consts;
use crate::{NetError, Result};
use super::tls;

/// TCP socket options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpSettings {
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// SO_RCVBUF; None keeps the OS default
    #[serde(default)]
    pub receive_buffer_size: Option<usize>,
    /// SO_SNDBUF; None keeps the OS default
    #[serde(default)]
    pub send_buffer_size: Option<usize>,
    /// SO_KEEPALIVE
    #[serde(default)]
    pub keep_alive: bool,
    /// TCP_NODELAY
    #[serde(default)]
    pub no_delay: bool,
}

fn default_backlog() -> i32 { consts::DEFAULT_BACKLOG }

impl Default for TcpSettings {
    fn default() -> Self {
        Self {
            backlog: default_backlog(),
            receive_buffer_size: None,
            send_buffer_size: None,
            keep_alive: false,
            no_delay: false,
        }
    }
}

impl TcpSettings {
    /// Set listen backlog
    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Set receive buffer size
    pub fn with_receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = Some(size);
        self
    }

    /// Set send buffer size
    pub fn with_send_buffer_size(mut self, size: usize) -> Self {
        self.send_buffer_size = Some(size);
        self
    }

    /// Set keep-alive
    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Set no-delay
    pub fn with_no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }

    /// Apply options to a connected or accepted stream
    pub(crate) fn apply_to_stream(&self, stream: &mio::net::TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(self.no_delay)?;
        let sock = socket2::SockRef::from(stream);
        sock.set_keepalive(self.keep_alive)?;
        if let Some(size) = self.receive_buffer_size {
            sock.set_recv_buffer_size(size)?;
        }
        if let Some(size) = self.send_buffer_size {
            sock.set_send_buffer_size(size)?;
        }
        Ok(())
    }
}

/// Client certificate requirement of a TLS server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientAuth {
    /// Never ask for a client certificate
    #[default]
    None,
    /// Ask for a certificate, accept clients without one
    Want,
    /// Require a trusted client certificate
    Need,
}

impl ClientAuth {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientAuth::None => "none",
            ClientAuth::Want => "want",
            ClientAuth::Need => "need",
        }
    }
}

impl FromStr for ClientAuth {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(ClientAuth::None),
            "want" => Ok(ClientAuth::Want),
            "need" => Ok(ClientAuth::Need),
            _ => Err(NetError::InvalidClientAuth(s.to_string())),
        }
    }
}

impl fmt::Display for ClientAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Certificate chain and private key presented to peers
pub(crate) struct Identity {
    pub(crate) certs: Vec<CertificateDer<'static>>,
    pub(crate) key: PrivateKeyDer<'static>,
}

/// TLS parameters.
///
/// Rustls configurations are built on first use and cached; every
/// `with_*` call starts a fresh cache.
#[derive(Clone, Default)]
pub struct TlsSettings {
    client_auth: ClientAuth,
    protocols: Vec<String>,
    cipher_suites: Vec<String>,
    server_name: Option<String>,
    identity: Option<Arc<Identity>>,
    trust: Option<Arc<RootCertStore>>,
    server_config: OnceCell<Arc<ServerConfig>>,
    client_config: OnceCell<Arc<ClientConfig>>,
}

impl TlsSettings {
    /// Create empty settings
    pub fn new() -> Self {
        Self::default()
    }

    fn reset(mut self) -> Self {
        self.server_config = OnceCell::new();
        self.client_config = OnceCell::new();
        self
    }

    /// Set client authentication requirement
    pub fn with_client_auth(mut self, client_auth: ClientAuth) -> Self {
        self.client_auth = client_auth;
        self.reset()
    }

    /// Restrict protocol versions ("TLSv1.2", "TLSv1.3")
    pub fn with_protocols(mut self, protocols: Vec<String>) -> Self {
        self.protocols = protocols;
        self.reset()
    }

    /// Restrict cipher suites by rustls suite name
    pub fn with_cipher_suites(mut self, suites: Vec<String>) -> Self {
        self.cipher_suites = suites;
        self.reset()
    }

    /// Override the server name sent by clients
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self.reset()
    }

    /// Set the local certificate chain and key
    pub fn with_identity(
        mut self,
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Self {
        self.identity = Some(Arc::new(Identity { certs, key }));
        self.reset()
    }

    /// Set the roots used to verify peers
    pub fn with_trust(mut self, roots: RootCertStore) -> Self {
        self.trust = Some(Arc::new(roots));
        self.reset()
    }

    /// Use a prebuilt server configuration
    pub fn with_server_config(mut self, config: Arc<ServerConfig>) -> Self {
        self.server_config = OnceCell::with_value(config);
        self
    }

    /// Use a prebuilt client configuration
    pub fn with_client_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.client_config = OnceCell::with_value(config);
        self
    }

    pub fn client_auth(&self) -> ClientAuth {
        self.client_auth
    }

    pub fn protocols(&self) -> &[String] {
        &self.protocols
    }

    pub fn cipher_suites(&self) -> &[String] {
        &self.cipher_suites
    }

    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    pub(crate) fn identity(&self) -> Option<&Identity> {
        self.identity.as_deref()
    }

    pub(crate) fn trust(&self) -> Option<&RootCertStore> {
        self.trust.as_deref()
    }

    /// Server-side rustls configuration
    pub fn server_config(&self) -> Result<Arc<ServerConfig>> {
        self.server_config
            .get_or_try_init(|| tls::build_server_config(self).map(Arc::new))
            .cloned()
    }

    /// Client-side rustls configuration
    pub fn client_config(&self) -> Result<Arc<ClientConfig>> {
        self.client_config
            .get_or_try_init(|| tls::build_client_config(self).map(Arc::new))
            .cloned()
    }
}

impl fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSettings")
            .field("client_auth", &self.client_auth)
            .field("protocols", &self.protocols)
            .field("cipher_suites", &self.cipher_suites)
            .field("server_name", &self.server_name)
            .field("has_identity", &self.identity.is_some())
            .field("has_trust", &self.trust.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_settings_builder() {
        let settings = TcpSettings::default()
            .with_backlog(8)
            .with_no_delay(true)
            .with_keep_alive(true)
            .with_receive_buffer_size(64 * 1024);

        assert_eq!(settings.backlog, 8);
        assert!(settings.no_delay);
        assert!(settings.keep_alive);
        assert_eq!(settings.receive_buffer_size, Some(64 * 1024));
        assert_eq!(settings.send_buffer_size, None);
    }

    #[test]
    fn test_client_auth_parse() {
        assert_eq!("none".parse::<ClientAuth>().unwrap(), ClientAuth::None);
        assert_eq!("Want".parse::<ClientAuth>().unwrap(), ClientAuth::Want);
        assert_eq!(" NEED ".parse::<ClientAuth>().unwrap(), ClientAuth::Need);
        assert!(matches!(
            "optional".parse::<ClientAuth>(),
            Err(NetError::InvalidClientAuth(token)) if token == "optional"
        ));
    }

    #[test]
    fn test_tls_settings_builder() {
        let settings = TlsSettings::new()
            .with_client_auth(ClientAuth::Want)
            .with_protocols(vec!["TLSv1.3".into()])
            .with_server_name("localhost");

        assert_eq!(settings.client_auth(), ClientAuth::Want);
        assert_eq!(settings.protocols(), ["TLSv1.3".to_string()]);
        assert_eq!(settings.server_name(), Some("localhost"));
        assert!(settings.identity().is_none());
    }

    #[test]
    fn test_server_config_requires_identity() {
        assert!(matches!(
            TlsSettings::new().server_config(),
            Err(NetError::Config(_))
        ));
    }

    #[test]
    fn test_client_config_is_cached() {
        let settings = TlsSettings::new();
        let a = settings.client_config().unwrap();
        let b = settings.client_config().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
