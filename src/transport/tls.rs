//! TLS utilities for secure transports
//!
//! This module loads certificates and builds rustls client and server
//! configurations from [`TlsSettings`].

use std::fs::File;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig, SupportedProtocolVersion};
use rustls_pemfile::{certs, private_key};

use crate::{NetError, Result};
use super::config::{ClientAuth, TlsSettings};

/// Load certificates from a PEM file
pub fn load_certs(path: impl AsRef<Path>) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path.as_ref()).map_err(|e| {
        NetError::Config(format!("Failed to open cert file: {}", e))
    })?;
    let mut reader = BufReader::new(file);

    let certs_result: std::result::Result<Vec<_>, _> = certs(&mut reader).collect();
    certs_result.map_err(|e| {
        NetError::Config(format!("Failed to parse certificates: {}", e))
    })
}

/// Load private key from a PEM file
pub fn load_private_key(path: impl AsRef<Path>) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path.as_ref()).map_err(|e| {
        NetError::Config(format!("Failed to open key file: {}", e))
    })?;
    let mut reader = BufReader::new(file);

    private_key(&mut reader)
        .map_err(|e| NetError::Config(format!("Failed to parse private key: {}", e)))?
        .ok_or_else(|| NetError::Config("No private key found in file".into()))
}

/// Root store holding the Mozilla root certificates
pub fn webpki_roots() -> RootCertStore {
    RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    }
}

/// Resolve protocol names to rustls versions; empty means the safe defaults
fn protocol_versions(names: &[String]) -> Result<Vec<&'static SupportedProtocolVersion>> {
    if names.is_empty() {
        return Ok(rustls::DEFAULT_VERSIONS.to_vec());
    }
    names
        .iter()
        .map(|name| match name.as_str() {
            "TLSv1.2" => Ok(&rustls::version::TLS12),
            "TLSv1.3" => Ok(&rustls::version::TLS13),
            other => Err(NetError::Config(format!("Unsupported TLS protocol '{}'", other))),
        })
        .collect()
}

/// Ring provider restricted to the named cipher suites; empty keeps all defaults
fn crypto_provider(suites: &[String]) -> Result<Arc<CryptoProvider>> {
    let mut provider = rustls::crypto::ring::default_provider();
    if !suites.is_empty() {
        provider
            .cipher_suites
            .retain(|suite| suites.iter().any(|name| *name == format!("{:?}", suite.suite())));
        if provider.cipher_suites.is_empty() {
            return Err(NetError::Config(format!(
                "No supported cipher suite among {:?}",
                suites
            )));
        }
    }
    Ok(Arc::new(provider))
}

/// Build the server configuration described by `settings`
pub(crate) fn build_server_config(settings: &TlsSettings) -> Result<ServerConfig> {
    let identity = settings
        .identity()
        .ok_or_else(|| NetError::Config("TLS server requires a certificate identity".into()))?;
    let versions = protocol_versions(settings.protocols())?;
    let builder = ServerConfig::builder_with_provider(crypto_provider(settings.cipher_suites())?)
        .with_protocol_versions(&versions)?;

    let builder = match settings.client_auth() {
        ClientAuth::None => builder.with_no_client_auth(),
        auth => {
            let roots = settings.trust().cloned().ok_or_else(|| {
                NetError::Config(format!("Client auth '{}' requires trust roots", auth))
            })?;
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots));
            let verifier = if auth == ClientAuth::Want {
                verifier.allow_unauthenticated()
            } else {
                verifier
            };
            let verifier = verifier.build().map_err(|e| {
                NetError::Config(format!("Failed to create client verifier: {}", e))
            })?;
            builder.with_client_cert_verifier(verifier)
        }
    };

    builder
        .with_single_cert(identity.certs.clone(), identity.key.clone_key())
        .map_err(|e| NetError::Config(format!("Failed to create server config: {}", e)))
}

/// Build the client configuration described by `settings`
pub(crate) fn build_client_config(settings: &TlsSettings) -> Result<ClientConfig> {
    let roots = settings.trust().cloned().unwrap_or_else(webpki_roots);
    let versions = protocol_versions(settings.protocols())?;
    let builder = ClientConfig::builder_with_provider(crypto_provider(settings.cipher_suites())?)
        .with_protocol_versions(&versions)?
        .with_root_certificates(roots);

    match settings.identity() {
        Some(identity) => builder
            .with_client_auth_cert(identity.certs.clone(), identity.key.clone_key())
            .map_err(|e| NetError::Config(format!("Failed to set client auth: {}", e))),
        None => Ok(builder.with_no_client_auth()),
    }
}

/// Server name a client presents: the configured name, else the peer IP
pub(crate) fn server_name(settings: &TlsSettings, remote: IpAddr) -> Result<ServerName<'static>> {
    match settings.server_name() {
        Some(name) => ServerName::try_from(name.to_string())
            .map_err(|e| NetError::Config(format!("Invalid server name '{}': {}", name, e))),
        None => Ok(ServerName::IpAddress(remote.into())),
    }
}
