//! mitmtap - single-shot TLS interception for CONNECT tunnels
//!
//! mitmtap takes over one CONNECT tunnel, terminates the client's TLS with a
//! certificate minted for the requested host, opens its own verified TLS
//! connection to the origin, relays exactly one HTTP/1.1 request and its
//! response byte for byte, and closes both sides.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use mitmtap::{handle_tunnel, Config, HijackableConnection};
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let provider = config.certificate_provider()?;
//!
//!     let listener = TcpListener::bind(config.bind_addr()).await?;
//!     let (stream, _) = listener.accept().await?;
//!
//!     // After reading "CONNECT example.com:443 HTTP/1.1" off `stream`
//!     let mut conn = HijackableConnection::new(stream);
//!     let exchange = handle_tunnel("example.com:443", &mut conn, &provider, config.limits).await?;
//!     println!("{} {} -> {}", exchange.method, exchange.target, exchange.status);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - `mitm` - interception core (certificates, tunnels, relay, session)
//! - `server` - CONNECT listener that hands tunnels to the core
//! - `config` - environment configuration
//! - `tls` - PEM loading helpers

// Core proxy modules
pub mod config;
pub mod server;

// MITM core
pub mod mitm;

// TLS utilities
pub mod tls;

// Re-export commonly used types

/// Configuration types
pub use config::{CertificateConfig, Config, IssuerKind};

/// Outer CONNECT server
pub use server::ProxyServer;

/// MITM types and functionality
pub use mitm::{
    // Session
    handle_tunnel,
    // Certificates
    CertificateIssuer,
    CertificateProvider,
    ClientTlsConfig,
    Hijack,
    HijackableConnection,
    InterceptTls,
    IssueError,
    RcgenIssuer,
    RelayExchange,
    RelayLimits,
    RootAuthority,
    ScriptIssuer,
    Session,
    SessionError,
    SessionState,
    TargetIdentity,
    UpstreamTlsConfig,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
