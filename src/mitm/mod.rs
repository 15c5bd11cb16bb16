//! MITM (Man-in-the-Middle) interception module
//!
//! Single-shot TLS interception of one CONNECT tunnel:
//! - Leaf certificate lookup and issuance per target host
//! - Client-facing TLS over the hijacked connection
//! - Verified TLS toward the origin
//! - One HTTP/1.1 request/response relayed verbatim, then both tunnels close

pub mod certificate_authority;
pub mod certificate_provider;
pub mod error;
pub mod http_parser;
pub mod relay;
pub mod session;
pub mod target;
pub mod tls_config;
pub mod tunnel;

// Re-export main types
pub use certificate_authority::{RcgenIssuer, RootAuthority};
pub use certificate_provider::{CertificateIssuer, CertificateProvider, IssueError, ScriptIssuer};
pub use error::{Direction, SessionError};
pub use http_parser::{
    BodyFraming, Header, HttpRequest, HttpResponse, MessageReader, ParseError as HttpParseError,
    RelayLimits,
};
pub use relay::{forward_request, forward_response, relay, RelayExchange};
pub use session::{handle_tunnel, Session, SessionState};
pub use target::{TargetIdentity, DEFAULT_TLS_PORT};
pub use tls_config::{
    ClientTlsConfig, InterceptTls, SniUtils, TlsConfigError, UpstreamTlsConfig,
};
pub use tunnel::{
    dial_origin, establish_client_tunnel, ClientTunnel, Hijack, HijackableConnection,
    OriginTunnel, Rewind, Tunnel, TunnelRole, CONNECT_ESTABLISHED,
};
