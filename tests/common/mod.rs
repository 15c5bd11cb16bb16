//! Shared fixtures: a throwaway root authority on disk, a TLS origin on
//! loopback and a client that trusts the test root.

#![allow(dead_code)]

use mitmtap::mitm::http_parser::{MessageReader, RelayLimits};
use mitmtap::mitm::tls_config::{ClientTlsConfig, UpstreamTlsConfig};
use mitmtap::tls::load_certs;
use mitmtap::{
    CertificateConfig, CertificateIssuer, CertificateProvider, IssueError, RcgenIssuer,
    RootAuthority,
};
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Root pair and shared leaf key laid out as `certGen/` under a temp dir
pub struct TestPki {
    pub dir: TempDir,
    pub config: CertificateConfig,
}

impl TestPki {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let config = CertificateConfig::in_dir(dir.path());
        std::fs::create_dir_all(&config.root_dir).unwrap();

        let ca_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, "mitmtap test root");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let ca_cert = params.self_signed(&ca_key).unwrap();

        let leaf_key = KeyPair::generate().unwrap();

        std::fs::write(config.ca_cert_path(), ca_cert.pem()).unwrap();
        std::fs::write(config.ca_key_path(), ca_key.serialize_pem()).unwrap();
        std::fs::write(config.leaf_key_path(), leaf_key.serialize_pem()).unwrap();

        Self { dir, config }
    }

    pub fn authority(&self) -> RootAuthority {
        RootAuthority::load(&self.config).unwrap()
    }

    /// Origin-facing TLS that trusts the test root
    pub fn upstream(&self) -> Arc<UpstreamTlsConfig> {
        let roots = load_certs(&self.config.ca_cert_path()).unwrap();
        Arc::new(UpstreamTlsConfig::new(roots).unwrap())
    }

    pub fn provider(&self, issuer: Arc<dyn CertificateIssuer>) -> CertificateProvider {
        CertificateProvider::new(self.config.clone(), issuer, self.upstream())
    }

    pub fn counting_issuer(&self) -> Arc<CountingIssuer> {
        Arc::new(CountingIssuer {
            inner: RcgenIssuer::new(self.authority()),
            calls: AtomicUsize::new(0),
        })
    }

    /// Connector a test client uses to talk TLS through the proxy
    pub fn client_connector(&self) -> TlsConnector {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(&self.config.ca_cert_path()).unwrap() {
            roots.add(cert).unwrap();
        }
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    }

    /// Server config for a mock origin presenting a leaf for `host`
    pub fn origin_acceptor(&self, host: &str) -> TlsAcceptor {
        let pem = self.authority().mint_leaf_pem(host).unwrap();
        let chain = rustls_pemfile::certs(&mut pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        let key = mitmtap::tls::load_private_key(&self.config.leaf_key_path()).unwrap();
        let config = ClientTlsConfig::new(chain, key).unwrap();
        TlsAcceptor::from(config.server_config())
    }
}

/// Builtin issuer that counts how often it ran
pub struct CountingIssuer {
    inner: RcgenIssuer,
    calls: AtomicUsize,
}

impl CountingIssuer {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl CertificateIssuer for CountingIssuer {
    async fn issue(&self, identity: &str, out_dir: &Path) -> Result<(), IssueError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // Widen the window for concurrent first requests
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        self.inner.issue(identity, out_dir).await
    }
}

/// Issuer that always fails
pub struct FailingIssuer;

#[async_trait::async_trait]
impl CertificateIssuer for FailingIssuer {
    async fn issue(&self, _identity: &str, _out_dir: &Path) -> Result<(), IssueError> {
        Err(IssueError::Command {
            status: "exit status: 1".to_string(),
            stderr: "root key unavailable".to_string(),
        })
    }
}

/// What the mock origin saw
#[derive(Default)]
pub struct OriginReport {
    pub request: Vec<u8>,
    /// Bytes received after the first request, until the proxy closed
    pub trailing: Vec<u8>,
}

/// TLS origin on 127.0.0.1 answering exactly one request with `response`
pub async fn spawn_origin(
    pki: &TestPki,
    response: &'static [u8],
) -> (SocketAddr, JoinHandle<OriginReport>) {
    spawn_origin_as(pki, "localhost", response).await
}

/// Like [`spawn_origin`], presenting a certificate for `host`
pub async fn spawn_origin_as(
    pki: &TestPki,
    host: &str,
    response: &'static [u8],
) -> (SocketAddr, JoinHandle<OriginReport>) {
    let acceptor = pki.origin_acceptor(host);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let Ok(mut tls) = acceptor.accept(tcp).await else {
            // Proxy rejected our certificate
            return OriginReport::default();
        };

        let parsed = {
            let mut reader = MessageReader::new(&mut tls, RelayLimits::default());
            let result = reader.read_request().await;
            match result {
                Ok(request) => Some((request.to_bytes().to_vec(), reader.into_buffered().to_vec())),
                Err(_) => None,
            }
        };
        let Some((request, mut trailing)) = parsed else {
            // Proxy closed without forwarding anything
            return OriginReport::default();
        };

        tls.write_all(response).await.unwrap();
        tls.flush().await.unwrap();

        // Drain until the proxy closes its side
        let mut rest = Vec::new();
        let _ = tls.read_to_end(&mut rest).await;
        trailing.extend_from_slice(&rest);

        OriginReport { request, trailing }
    });

    (addr, handle)
}

/// A loopback port with nothing listening on it
pub async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

pub fn localhost() -> ServerName<'static> {
    ServerName::try_from("localhost").unwrap()
}
