//! Tunnel target parsing
//!
//! Turns the authority of a CONNECT request into the host/port pair that is
//! dialed and the label used to key the certificate cache.

use crate::mitm::error::SessionError;
use std::fmt;
use std::net::IpAddr;

/// Port assumed when the authority carries none
pub const DEFAULT_TLS_PORT: u16 = 443;

/// Immutable identity of the origin a tunnel was requested for
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetIdentity {
    host: String,
    port: u16,
}

impl TargetIdentity {
    /// Parse `host:port`, `[v6]:port` or a bare `host`
    pub fn parse(authority: &str) -> Result<Self, SessionError> {
        let authority = authority.trim();
        if authority.is_empty() {
            return Err(SessionError::Parse("empty authority".to_string()));
        }

        let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
            // Bracketed IPv6 literal
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| SessionError::Parse(format!("unterminated IPv6 literal: {}", authority)))?;
            let port = match tail {
                "" => DEFAULT_TLS_PORT,
                tail => match tail.strip_prefix(':') {
                    Some(port) => parse_port(port)?,
                    None => {
                        return Err(SessionError::Parse(format!(
                            "unexpected text after IPv6 literal: {}",
                            authority
                        )))
                    }
                },
            };
            if host.parse::<IpAddr>().is_err() {
                return Err(SessionError::Parse(format!("invalid IPv6 literal: {}", host)));
            }
            (host, port)
        } else if authority.matches(':').count() > 1 {
            // Unbracketed IPv6 literal, no port
            if authority.parse::<IpAddr>().is_err() {
                return Err(SessionError::Parse(format!("invalid host: {}", authority)));
            }
            (authority, DEFAULT_TLS_PORT)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, parse_port(port)?),
                None => (authority, DEFAULT_TLS_PORT),
            }
        };

        validate_host(host)?;

        Ok(Self {
            host: host.to_ascii_lowercase(),
            port,
        })
    }

    /// Host without brackets, lower-cased
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Label used to name the cached certificate and as the TLS server name
    pub fn label(&self) -> &str {
        &self.host
    }

    /// Address to dial for the origin connection
    pub fn dial_addr(&self) -> (&str, u16) {
        (&self.host, self.port)
    }

    /// True when the host is an IP literal rather than a DNS name
    pub fn is_ip(&self) -> bool {
        self.host.parse::<IpAddr>().is_ok()
    }
}

impl fmt::Display for TargetIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

fn parse_port(port: &str) -> Result<u16, SessionError> {
    let port: u16 = port.parse().map_err(|_| {
        SessionError::Parse(format!(
            "invalid port '{}': must be a number between 1 and 65535",
            port
        ))
    })?;

    if port == 0 {
        return Err(SessionError::Parse(
            "invalid port: must be between 1 and 65535".to_string(),
        ));
    }

    Ok(port)
}

/// The host doubles as a file name in the certificate cache
fn validate_host(host: &str) -> Result<(), SessionError> {
    if host.is_empty() {
        return Err(SessionError::Parse("host cannot be empty".to_string()));
    }
    if host.len() > 253 {
        return Err(SessionError::Parse(format!("host too long: {} bytes", host.len())));
    }
    if host.contains("..")
        || host.starts_with('.')
        || host
            .chars()
            .any(|c| c == '/' || c == '\\' || c == '\0' || c.is_whitespace() || c.is_control())
    {
        return Err(SessionError::Parse(format!("invalid host: {}", host)));
    }
    Ok(())
}
