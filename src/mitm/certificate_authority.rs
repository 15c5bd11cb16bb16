//! Built-in certificate issuance
//!
//! Mints leaf certificates in-process with rcgen instead of shelling out to
//! `gen_cert.sh`. The root certificate and key come from the same
//! `ca.crt`/`ca.key` pair the script uses, and every leaf is issued for the
//! shared `cert.key` so the files are interchangeable with script output.

use crate::config::CertificateConfig;
use crate::mitm::certificate_provider::{CertificateIssuer, IssueError};
use rcgen::string::Ia5String;
use rcgen::{
    CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose,
    SanType, SerialNumber,
};
use std::net::IpAddr;
use std::path::Path;
use tracing::{debug, info};

/// Validity of minted leaves. Cached files are never re-issued.
const LEAF_VALIDITY_DAYS: i64 = 397;

/// Root key pair plus the shared leaf key
pub struct RootAuthority {
    issuer: Issuer<'static, KeyPair>,
    leaf_key: KeyPair,
}

impl RootAuthority {
    /// Load `ca.crt`, `ca.key` and `cert.key` from the certificate root
    pub fn load(config: &CertificateConfig) -> Result<Self, IssueError> {
        let ca_cert = read_pem(&config.ca_cert_path())?;
        let ca_key = read_pem(&config.ca_key_path())?;
        let leaf_key = read_pem(&config.leaf_key_path())?;
        Self::from_pem(&ca_cert, &ca_key, &leaf_key)
    }

    pub fn from_pem(ca_cert_pem: &str, ca_key_pem: &str, leaf_key_pem: &str) -> Result<Self, IssueError> {
        let ca_key = KeyPair::from_pem(ca_key_pem)
            .map_err(|e| IssueError::RootAuthority(format!("invalid CA key: {}", e)))?;
        let issuer = Issuer::from_ca_cert_pem(ca_cert_pem, ca_key)
            .map_err(|e| IssueError::RootAuthority(format!("invalid CA certificate: {}", e)))?;
        let leaf_key = KeyPair::from_pem(leaf_key_pem)
            .map_err(|e| IssueError::RootAuthority(format!("invalid leaf key: {}", e)))?;

        Ok(Self { issuer, leaf_key })
    }

    /// Mint a PEM leaf certificate for `identity` (DNS name or IP literal)
    pub fn mint_leaf_pem(&self, identity: &str) -> Result<String, IssueError> {
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, identity);
        params.subject_alt_names = vec![subject_alt_name(identity)?];
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
        params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(LEAF_VALIDITY_DAYS);
        params.serial_number = Some(SerialNumber::from(generate_serial_number()));

        let cert = params
            .signed_by(&self.leaf_key, &self.issuer)
            .map_err(|e| IssueError::Generation(e.to_string()))?;

        Ok(cert.pem())
    }
}

/// Crypto RNG in the low half, timestamp in the high half
fn generate_serial_number() -> u64 {
    use rand::Rng;
    let random_part: u32 = rand::thread_rng().gen();
    let timestamp_part = chrono::Utc::now().timestamp() as u32;
    ((timestamp_part as u64) << 32) | (random_part as u64)
}

fn subject_alt_name(identity: &str) -> Result<SanType, IssueError> {
    if let Ok(ip) = identity.parse::<IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    let name = Ia5String::try_from(identity.to_string())
        .map_err(|e| IssueError::Generation(format!("invalid DNS name {}: {}", identity, e)))?;
    Ok(SanType::DnsName(name))
}

fn read_pem(path: &Path) -> Result<String, IssueError> {
    std::fs::read_to_string(path)
        .map_err(|e| IssueError::RootAuthority(format!("{}: {}", path.display(), e)))
}

/// In-process issuer using a [`RootAuthority`]
pub struct RcgenIssuer {
    authority: RootAuthority,
}

impl RcgenIssuer {
    pub fn new(authority: RootAuthority) -> Self {
        Self { authority }
    }

    pub fn from_config(config: &CertificateConfig) -> Result<Self, IssueError> {
        let authority = RootAuthority::load(config)?;
        info!(root_dir = %config.root_dir.display(), "Loaded root authority");
        Ok(Self::new(authority))
    }
}

#[async_trait::async_trait]
impl CertificateIssuer for RcgenIssuer {
    async fn issue(&self, identity: &str, out_dir: &Path) -> Result<(), IssueError> {
        let pem = self.authority.mint_leaf_pem(identity)?;

        tokio::fs::create_dir_all(out_dir).await?;

        // Write then rename so readers never see a partial file
        let final_path = out_dir.join(format!("{}.crt", identity));
        let tmp_path = out_dir.join(format!(".{}.{:08x}.tmp", identity, rand::random::<u32>()));

        if let Err(e) = tokio::fs::write(&tmp_path, pem.as_bytes()).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        debug!(identity = %identity, path = %final_path.display(), "Leaf certificate written");
        Ok(())
    }
}
