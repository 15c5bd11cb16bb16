//! Single-shot interception session
//!
//! A session owns one target, the TLS tunnel toward the client and the TLS
//! tunnel toward the origin. It relays exactly one request/response pair and
//! then closes both tunnels. There is no loop and no reuse.
//!
//! ```text
//! Created → ConfigReady → ClientHandshakeDone → OriginConnected
//!         → RequestForwarded → ResponseForwarded → Closed
//! ```
//!
//! Any failure goes straight to `Closed` after releasing the tunnels that
//! were already open.

use crate::mitm::certificate_provider::CertificateProvider;
use crate::mitm::error::{Direction, SessionError};
use crate::mitm::http_parser::RelayLimits;
use crate::mitm::relay::{relay, RelayExchange};
use crate::mitm::target::TargetIdentity;
use crate::mitm::tunnel::{dial_origin, establish_client_tunnel, ClientTunnel, Hijack, OriginTunnel};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    ConfigReady,
    ClientHandshakeDone,
    OriginConnected,
    RequestForwarded,
    ResponseForwarded,
    Closed,
}

pub struct Session<S> {
    target: TargetIdentity,
    state: SessionState,
    client: ClientTunnel<S>,
    origin: OriginTunnel,
    limits: RelayLimits,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Bring up both tunnels for the CONNECT target `authority`
    ///
    /// The certificate is obtained before the connection is hijacked, so a
    /// parse or issuance failure leaves `conn` untouched for the caller.
    pub async fn create<H>(
        authority: &str,
        conn: &mut H,
        provider: &CertificateProvider,
        limits: RelayLimits,
    ) -> Result<Self, SessionError>
    where
        H: Hijack<Io = S>,
    {
        let target = TargetIdentity::parse(authority)?;
        debug!(origin = %target, state = ?SessionState::Created, "Session created");

        let tls = provider.obtain(&target).await?;
        debug!(origin = %target, state = ?SessionState::ConfigReady, "TLS config ready");

        let peer = format!("client of {}", target);
        let mut client = establish_client_tunnel(conn, &tls, &peer).await?;
        debug!(origin = %target, state = ?SessionState::ClientHandshakeDone, "Client tunnel established");

        let origin = match dial_origin(&target, &tls).await {
            Ok(origin) => origin,
            Err(e) => {
                warn!(origin = %target, error = %e, "Origin connection failed");
                client.close().await;
                return Err(e);
            }
        };

        info!(origin = %target, "Interception session established");

        Ok(Self {
            target,
            state: SessionState::OriginConnected,
            client,
            origin,
            limits,
        })
    }

    pub fn target(&self) -> &TargetIdentity {
        &self.target
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Relay one request and its response, then close both tunnels
    ///
    /// Returns `SessionError::Closed` if the session already ran or was closed.
    pub async fn run(&mut self) -> Result<RelayExchange, SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }

        let result = self.relay_once().await;
        if let Err(e) = &result {
            warn!(origin = %self.target, state = ?self.state, error = %e, "Session failed");
        }

        self.close().await;
        result
    }

    async fn relay_once(&mut self) -> Result<RelayExchange, SessionError> {
        let client = self.client.stream_mut()?;
        let origin = self.origin.stream_mut()?;

        match relay(client, origin, self.limits).await {
            Ok(exchange) => {
                self.state = SessionState::ResponseForwarded;
                info!(
                    origin = %self.target,
                    method = %exchange.method,
                    uri = %exchange.target,
                    status = exchange.status,
                    request_bytes = exchange.request_bytes,
                    response_bytes = exchange.response_bytes,
                    "Exchange relayed"
                );
                Ok(exchange)
            }
            Err(e) => {
                if request_was_forwarded(&e) {
                    self.state = SessionState::RequestForwarded;
                }
                Err(e)
            }
        }
    }

    /// Close both tunnels. Later calls do nothing.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.client.close().await;
        self.origin.close().await;
        self.state = SessionState::Closed;
        debug!(origin = %self.target, "Session closed");
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed && self.client.is_closed() && self.origin.is_closed()
    }
}

/// Whether a relay failure happened after the request reached the origin
fn request_was_forwarded(error: &SessionError) -> bool {
    matches!(
        error,
        SessionError::MalformedResponse(_)
            | SessionError::Forward {
                direction: Direction::ToClient,
                ..
            }
    )
}

/// Handle one CONNECT request end to end: create, relay once, close
pub async fn handle_tunnel<H>(
    authority: &str,
    conn: &mut H,
    provider: &CertificateProvider,
    limits: RelayLimits,
) -> Result<RelayExchange, SessionError>
where
    H: Hijack,
{
    let mut session = Session::create(authority, conn, provider, limits).await?;
    session.run().await
}
