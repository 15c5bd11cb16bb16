use anyhow::{bail, Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::mitm::certificate_authority::RcgenIssuer;
use crate::mitm::certificate_provider::{CertificateIssuer, CertificateProvider, ScriptIssuer};
use crate::mitm::http_parser::RelayLimits;
use crate::mitm::tls_config::UpstreamTlsConfig;
use crate::tls::load_certs;

/// Shared leaf key every issued certificate is bound to
pub const LEAF_KEY_FILE: &str = "cert.key";
/// Issuance script, run from the certificate root
pub const ISSUE_SCRIPT: &str = "gen_cert.sh";
pub const CA_CERT_FILE: &str = "ca.crt";
pub const CA_KEY_FILE: &str = "ca.key";

pub const DEFAULT_MEMORY_CACHE_SIZE: usize = 1000;

/// Locations of the root authority and the leaf certificate cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateConfig {
    /// Holds cert.key, gen_cert.sh and the root pair
    pub root_dir: PathBuf,
    /// One `<identity>.crt` per intercepted host
    pub cache_dir: PathBuf,
    pub memory_cache_size: usize,
}

impl CertificateConfig {
    /// Standard layout under `base`: `certGen/` and `certs/`
    pub fn in_dir(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        Self {
            root_dir: base.join("certGen"),
            cache_dir: base.join("certs"),
            memory_cache_size: DEFAULT_MEMORY_CACHE_SIZE,
        }
    }

    pub fn leaf_key_path(&self) -> PathBuf {
        self.root_dir.join(LEAF_KEY_FILE)
    }

    pub fn script_path(&self) -> PathBuf {
        self.root_dir.join(ISSUE_SCRIPT)
    }

    pub fn ca_cert_path(&self) -> PathBuf {
        self.root_dir.join(CA_CERT_FILE)
    }

    pub fn ca_key_path(&self) -> PathBuf {
        self.root_dir.join(CA_KEY_FILE)
    }

    /// Cached leaf certificate for an identity label
    pub fn cert_path(&self, identity: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.crt", identity))
    }
}

/// How missing leaf certificates are produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssuerKind {
    /// External gen_cert.sh
    Script,
    /// In-process rcgen
    Builtin,
}

impl FromStr for IssuerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "script" => Ok(IssuerKind::Script),
            "builtin" => Ok(IssuerKind::Builtin),
            other => bail!("Unknown CERT_ISSUER '{}': expected 'script' or 'builtin'", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    // Server configuration
    pub host: String,
    pub port: u16,
    pub connect_read_timeout_seconds: u64,

    // Certificates
    pub workdir: PathBuf,
    pub certificates: CertificateConfig,
    pub issuer: IssuerKind,

    // Origin trust
    pub upstream_ca_file: Option<PathBuf>,

    // Relay buffering
    pub limits: RelayLimits,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if present
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup
    pub fn from_vars<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("PROXY_HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let port = lookup("PROXY_PORT")
            .unwrap_or_else(|| "8080".to_string())
            .parse()
            .context("Invalid PROXY_PORT")?;
        let connect_read_timeout_seconds = lookup("CONNECT_READ_TIMEOUT_SECONDS")
            .unwrap_or_else(|| "10".to_string())
            .parse()
            .context("Invalid CONNECT_READ_TIMEOUT_SECONDS")?;

        let workdir = match lookup("PROXY_WORKDIR") {
            Some(dir) => PathBuf::from(dir),
            None => env::current_dir().context("Cannot determine working directory")?,
        };

        let mut certificates = CertificateConfig::in_dir(&workdir);
        if let Some(dir) = lookup("CERT_ROOT_DIR") {
            certificates.root_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("CERT_CACHE_DIR") {
            certificates.cache_dir = PathBuf::from(dir);
        }
        certificates.memory_cache_size = lookup("CERT_MEMORY_CACHE_SIZE")
            .unwrap_or_else(|| DEFAULT_MEMORY_CACHE_SIZE.to_string())
            .parse()
            .context("Invalid CERT_MEMORY_CACHE_SIZE")?;
        if certificates.memory_cache_size == 0 {
            bail!("CERT_MEMORY_CACHE_SIZE must be greater than zero");
        }

        let issuer: IssuerKind = lookup("CERT_ISSUER")
            .unwrap_or_else(|| "script".to_string())
            .parse()?;

        let upstream_ca_file = lookup("UPSTREAM_CA_FILE")
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);

        let defaults = RelayLimits::default();
        let max_head_bytes: usize = lookup("MAX_HEAD_BYTES")
            .unwrap_or_else(|| defaults.max_head_bytes.to_string())
            .parse()
            .context("Invalid MAX_HEAD_BYTES")?;
        let max_body_bytes: usize = lookup("MAX_BODY_BYTES")
            .unwrap_or_else(|| defaults.max_body_bytes.to_string()) // 100MB default
            .parse()
            .context("Invalid MAX_BODY_BYTES")?;
        if max_head_bytes == 0 || max_body_bytes == 0 {
            bail!("MAX_HEAD_BYTES and MAX_BODY_BYTES must be greater than zero");
        }

        Ok(Config {
            host,
            port,
            connect_read_timeout_seconds,
            workdir,
            certificates,
            issuer,
            upstream_ca_file,
            limits: RelayLimits {
                max_head_bytes,
                max_body_bytes,
            },
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_read_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_read_timeout_seconds)
    }

    /// Origin-facing TLS trusting webpki roots plus `UPSTREAM_CA_FILE`
    pub fn upstream_tls(&self) -> Result<UpstreamTlsConfig> {
        let extra_roots = match &self.upstream_ca_file {
            Some(path) => load_certs(path)
                .with_context(|| format!("Failed to load UPSTREAM_CA_FILE {}", path.display()))?,
            None => Vec::new(),
        };

        UpstreamTlsConfig::new(extra_roots)
            .context("Failed to build upstream TLS config")
    }

    /// Certificate provider wired with the configured issuer
    pub fn certificate_provider(&self) -> Result<CertificateProvider> {
        let issuer: Arc<dyn CertificateIssuer> = match self.issuer {
            IssuerKind::Script => Arc::new(ScriptIssuer::from_config(&self.certificates)),
            IssuerKind::Builtin => Arc::new(
                RcgenIssuer::from_config(&self.certificates)
                    .context("Failed to load root authority for builtin issuer")?,
            ),
        };

        Ok(CertificateProvider::new(
            self.certificates.clone(),
            issuer,
            Arc::new(self.upstream_tls()?),
        ))
    }
}
