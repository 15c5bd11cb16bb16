//! Session error types
//!
//! Every variant is terminal to the session that produced it. None of them
//! are retried internally.

use crate::mitm::http_parser::ParseError;
use std::io;
use thiserror::Error;

/// Which side of the interception a failure happened on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client → origin (request leg)
    ToOrigin,
    /// Origin → client (response leg)
    ToClient,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::ToOrigin => f.write_str("origin"),
            Direction::ToClient => f.write_str("client"),
        }
    }
}

/// Interception session errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// Tunnel target could not be parsed into host and port
    #[error("Invalid tunnel target: {0}")]
    Parse(String),

    /// Leaf certificate could not be issued or loaded
    #[error("Certificate issuance failed for {identity}: {reason}")]
    CertificateIssuance { identity: String, reason: String },

    /// Raw connection could not be detached from the accepting layer
    #[error("Connection cannot be hijacked: {0}")]
    HijackUnsupported(String),

    /// Writing the tunnel acknowledgement failed
    #[error("Failed to acknowledge tunnel: {0}")]
    TunnelAck(#[source] io::Error),

    /// Client-facing TLS handshake failed
    #[error("TLS handshake with {peer} failed: {source}")]
    Handshake {
        peer: String,
        #[source]
        source: io::Error,
    },

    /// Origin could not be reached or refused the TLS handshake
    #[error("Origin {address} unreachable: {source}")]
    OriginUnreachable {
        address: String,
        #[source]
        source: io::Error,
    },

    /// Client sent a truncated or unparsable request
    #[error("Malformed request: {0}")]
    MalformedRequest(#[source] ParseError),

    /// Origin sent a truncated or unparsable response
    #[error("Malformed response: {0}")]
    MalformedResponse(#[source] ParseError),

    /// Writing relayed bytes failed
    #[error("Failed to forward to {direction}: {source}")]
    Forward {
        direction: Direction,
        #[source]
        source: io::Error,
    },

    /// Session already completed its single relay cycle
    #[error("Session is closed")]
    Closed,
}

impl SessionError {
    /// Create a certificate issuance error
    pub fn issuance(identity: impl Into<String>, reason: impl ToString) -> Self {
        Self::CertificateIssuance {
            identity: identity.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a client handshake error
    pub fn handshake(peer: impl Into<String>, source: io::Error) -> Self {
        Self::Handshake {
            peer: peer.into(),
            source,
        }
    }

    /// Create an origin connection error
    pub fn origin_unreachable(address: impl Into<String>, source: io::Error) -> Self {
        Self::OriginUnreachable {
            address: address.into(),
            source,
        }
    }

    /// Create a forwarding error
    pub fn forward(direction: Direction, source: io::Error) -> Self {
        Self::Forward { direction, source }
    }

    /// True when the failure happened before the client connection was hijacked,
    /// so the caller still owns it and may answer in plain HTTP.
    pub fn is_pre_hijack(&self) -> bool {
        matches!(
            self,
            Self::Parse(_) | Self::CertificateIssuance { .. } | Self::HijackUnsupported(_)
        )
    }
}
