//! Certificate Provider - leaf certificates for intercepted targets
//!
//! Leaf certificates live on disk under the certificate cache directory, one
//! `<identity>.crt` per target. A missing file is produced by a pluggable
//! [`CertificateIssuer`]; an existing file is reused as is. The TLS server
//! configs built from those files are kept in a small LRU so repeated
//! sessions for the same target skip the disk.

use crate::config::CertificateConfig;
use crate::mitm::error::SessionError;
use crate::mitm::target::TargetIdentity;
use crate::mitm::tls_config::{ClientTlsConfig, InterceptTls, SniUtils, UpstreamTlsConfig};
use crate::tls::load_certs_and_key;
use lru::LruCache;
use std::collections::HashMap;
use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Errors reported by a certificate issuer
#[derive(Debug, Error)]
pub enum IssueError {
    #[error("Failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("Issuance command exited with {status}: {stderr}")]
    Command { status: String, stderr: String },

    #[error("Root authority unavailable: {0}")]
    RootAuthority(String),

    #[error("Certificate generation failed: {0}")]
    Generation(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Produces `<identity>.crt` inside `out_dir`, signed by the root authority
#[async_trait::async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn issue(&self, identity: &str, out_dir: &Path) -> Result<(), IssueError>;
}

/// Issuer backed by the external `gen_cert.sh` script
///
/// Invoked as `gen_cert.sh <identity> <out_dir>` from inside the root
/// authority directory, where the script finds the root key pair.
pub struct ScriptIssuer {
    script: PathBuf,
    root_dir: PathBuf,
}

impl ScriptIssuer {
    pub fn new(script: impl Into<PathBuf>, root_dir: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
            root_dir: root_dir.into(),
        }
    }

    pub fn from_config(config: &CertificateConfig) -> Self {
        Self::new(config.script_path(), config.root_dir.clone())
    }
}

#[async_trait::async_trait]
impl CertificateIssuer for ScriptIssuer {
    async fn issue(&self, identity: &str, out_dir: &Path) -> Result<(), IssueError> {
        tokio::fs::create_dir_all(out_dir).await?;

        // The script runs from root_dir, so hand it an absolute output path
        let out_dir = if out_dir.is_absolute() {
            out_dir.to_path_buf()
        } else {
            std::env::current_dir()?.join(out_dir)
        };

        debug!(
            identity = %identity,
            script = %self.script.display(),
            "Running certificate issuance script"
        );

        let output = Command::new(&self.script)
            .arg(identity)
            .arg(&out_dir)
            .current_dir(&self.root_dir)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| IssueError::Spawn {
                command: self.script.display().to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(IssueError::Command {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(())
    }
}

/// Resolves or issues leaf certificates and builds the session TLS configs
pub struct CertificateProvider {
    config: CertificateConfig,
    issuer: Arc<dyn CertificateIssuer>,
    upstream: Arc<UpstreamTlsConfig>,

    /// identity -> client-facing TLS config
    cache: Mutex<LruCache<String, ClientTlsConfig>>,

    /// identity -> issuance lock, so one process issues each identity once
    issuing: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CertificateProvider {
    pub fn new(
        config: CertificateConfig,
        issuer: Arc<dyn CertificateIssuer>,
        upstream: Arc<UpstreamTlsConfig>,
    ) -> Self {
        let cache_size = NonZeroUsize::new(config.memory_cache_size).unwrap_or(NonZeroUsize::MIN);

        Self {
            config,
            issuer,
            upstream,
            cache: Mutex::new(LruCache::new(cache_size)),
            issuing: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CertificateConfig {
        &self.config
    }

    /// Path of the cached leaf certificate for a target
    pub fn cert_path(&self, target: &TargetIdentity) -> PathBuf {
        self.config.cert_path(target.label())
    }

    /// Get the TLS material for intercepting `target`, issuing a leaf if needed
    pub async fn obtain(&self, target: &TargetIdentity) -> Result<InterceptTls, SessionError> {
        let label = target.label();
        let server_name =
            SniUtils::parse_server_name(label).map_err(|e| SessionError::Parse(e.to_string()))?;

        {
            let mut cache = self.cache.lock().await;
            if let Some(client_facing) = cache.get(label) {
                debug!(identity = %label, "TLS config cache hit");
                return Ok(InterceptTls::new(
                    server_name,
                    client_facing.clone(),
                    self.upstream.client_config(),
                ));
            }
        }

        self.ensure_certificate_file(label).await?;
        let client_facing = self.load_client_facing(label)?;

        {
            let mut cache = self.cache.lock().await;
            cache.put(label.to_string(), client_facing.clone());
        }

        Ok(InterceptTls::new(
            server_name,
            client_facing,
            self.upstream.client_config(),
        ))
    }

    /// Number of cached TLS configs and the cache capacity
    pub async fn cache_stats(&self) -> (usize, usize) {
        let cache = self.cache.lock().await;
        (cache.len(), cache.cap().get())
    }

    /// Drop all in-memory TLS configs; files on disk are kept
    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear();
    }

    async fn ensure_certificate_file(&self, label: &str) -> Result<(), SessionError> {
        let path = self.config.cert_path(label);
        if file_exists(&path).await? {
            debug!(identity = %label, path = %path.display(), "Reusing cached certificate");
            return Ok(());
        }

        let lock = {
            let mut issuing = self.issuing.lock().await;
            Arc::clone(
                issuing
                    .entry(label.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };

        let result = {
            let _guard = lock.lock().await;
            // Another session may have issued it while we waited
            if file_exists(&path).await? {
                Ok(())
            } else {
                info!(identity = %label, "Issuing leaf certificate");
                self.issuer
                    .issue(label, &self.config.cache_dir)
                    .await
                    .map_err(|e| {
                        warn!(identity = %label, error = %e, "Certificate issuance failed");
                        SessionError::issuance(label, e)
                    })
            }
        };

        {
            let mut issuing = self.issuing.lock().await;
            // Only the map and this call hold it: nobody else is waiting
            if Arc::strong_count(&lock) <= 2 {
                issuing.remove(label);
            }
        }

        result
    }

    fn load_client_facing(&self, label: &str) -> Result<ClientTlsConfig, SessionError> {
        let cert_path = self.config.cert_path(label);
        let key_path = self.config.leaf_key_path();

        let (chain, key) = load_certs_and_key(&cert_path, &key_path).map_err(|e| {
            SessionError::issuance(label, format!("unreadable certificate material: {}", e))
        })?;

        ClientTlsConfig::new(chain, key).map_err(|e| SessionError::issuance(label, e))
    }
}

async fn file_exists(path: &Path) -> Result<bool, SessionError> {
    tokio::fs::try_exists(path).await.map_err(|e| {
        SessionError::issuance(
            path.display().to_string(),
            format!("cannot stat certificate cache: {}", e),
        )
    })
}
