//! TLS Configuration for both legs of an interception
//!
//! - Client-facing TLS (proxy ← client) presenting the minted leaf certificate
//! - Upstream TLS (proxy → origin) with real verification
//!
//! Only HTTP/1.1 is relayed, so both sides advertise `http/1.1` over ALPN.
//! TLS 1.2 and 1.3 only.

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::version::{TLS12, TLS13};
use rustls::{ClientConfig, RootCertStore, ServerConfig, SupportedProtocolVersion};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use webpki_roots::TLS_SERVER_ROOTS;

const ALPN_HTTP11: &[u8] = b"http/1.1";

static PROTOCOL_VERSIONS: &[&SupportedProtocolVersion] = &[&TLS12, &TLS13];

/// TLS configuration errors
#[derive(Debug, Error)]
pub enum TlsConfigError {
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("TLS configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid server name: {0}")]
    InvalidServerName(String),
}

/// Client-facing TLS config (proxy acts as server with the minted leaf)
#[derive(Clone)]
pub struct ClientTlsConfig {
    config: Arc<ServerConfig>,
}

impl ClientTlsConfig {
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Result<Self, TlsConfigError> {
        if cert_chain.is_empty() {
            return Err(TlsConfigError::InvalidCertificate(
                "empty certificate chain".to_string(),
            ));
        }

        let mut config = ServerConfig::builder_with_protocol_versions(PROTOCOL_VERSIONS)
            .with_no_client_auth()
            .with_single_cert(cert_chain, private_key)
            .map_err(|e| TlsConfigError::ConfigError(e.to_string()))?;

        config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];

        debug!("Client-facing TLS config created");

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Get rustls ServerConfig
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.config)
    }
}

/// Upstream TLS config (proxy acts as client with real verification)
pub struct UpstreamTlsConfig {
    config: Arc<ClientConfig>,
}

impl UpstreamTlsConfig {
    /// Build client config trusting the webpki roots plus `extra_roots`
    pub fn new(extra_roots: Vec<CertificateDer<'static>>) -> Result<Self, TlsConfigError> {
        let mut root_store = RootCertStore::empty();
        root_store.extend(TLS_SERVER_ROOTS.iter().cloned());

        let extra_count = extra_roots.len();
        for root in extra_roots {
            root_store
                .add(root)
                .map_err(|e| TlsConfigError::InvalidCertificate(e.to_string()))?;
        }

        let mut config = ClientConfig::builder_with_protocol_versions(PROTOCOL_VERSIONS)
            .with_root_certificates(root_store)
            .with_no_client_auth();

        config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];

        info!(
            roots_count = TLS_SERVER_ROOTS.len(),
            extra_roots = extra_count,
            "Upstream TLS config created"
        );

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Get rustls ClientConfig
    pub fn client_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.config)
    }
}

/// TLS material for one interception: both configs and the shared server name
#[derive(Clone)]
pub struct InterceptTls {
    server_name: ServerName<'static>,
    client_facing: ClientTlsConfig,
    upstream: Arc<ClientConfig>,
}

impl InterceptTls {
    pub fn new(
        server_name: ServerName<'static>,
        client_facing: ClientTlsConfig,
        upstream: Arc<ClientConfig>,
    ) -> Self {
        Self {
            server_name,
            client_facing,
            upstream,
        }
    }

    /// Name presented as SNI to the origin; matches the minted certificate
    pub fn server_name(&self) -> &ServerName<'static> {
        &self.server_name
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        self.client_facing.server_config()
    }

    pub fn client_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.upstream)
    }
}

/// SNI (Server Name Indication) utilities
pub struct SniUtils;

impl SniUtils {
    /// Parse hostname into ServerName for SNI
    pub fn parse_server_name(hostname: &str) -> Result<ServerName<'static>, TlsConfigError> {
        ServerName::try_from(hostname.to_owned())
            .map_err(|e| TlsConfigError::InvalidServerName(format!("{}", e)))
    }
}
