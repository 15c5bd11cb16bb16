use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::mitm::certificate_provider::CertificateProvider;
use crate::mitm::error::SessionError;
use crate::mitm::http_parser::{MessageReader, RelayLimits};
use crate::mitm::session::handle_tunnel;
use crate::mitm::tunnel::HijackableConnection;

/// Accepts plain-HTTP CONNECT requests and hands each tunnel to a session
pub struct ProxyServer {
    provider: Arc<CertificateProvider>,
    limits: RelayLimits,
    connect_read_timeout: Duration,
}

impl ProxyServer {
    pub fn new(
        provider: Arc<CertificateProvider>,
        limits: RelayLimits,
        connect_read_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            limits,
            connect_read_timeout,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let provider = config
            .certificate_provider()
            .context("Failed to initialize certificate provider")?;

        Ok(Self::new(
            Arc::new(provider),
            config.limits,
            config.connect_read_timeout(),
        ))
    }

    /// Serve until ctrl-c
    pub async fn run(self, listener: TcpListener) -> Result<()> {
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve until `shutdown` completes
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let server = Arc::new(self);
        tokio::pin!(shutdown);

        if let Ok(addr) = listener.local_addr() {
            info!("Listening on {}", addr);
        }

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!("Accepted connection from {}", peer_addr);
                            let _ = stream.set_nodelay(true);

                            let server = Arc::clone(&server);
                            tokio::spawn(async move {
                                server.handle_connection(stream, peer_addr.to_string()).await;
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("Shutting down server...");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Read the CONNECT head from `stream` and run one interception session
    pub async fn handle_connection<S>(&self, mut stream: S, peer: String)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut reader = MessageReader::new(&mut stream, self.limits);
        let result = timeout(self.connect_read_timeout, reader.read_request()).await;
        let buffered = reader.into_buffered();

        let request = match result {
            Ok(Ok(request)) => request,
            Ok(Err(e)) => {
                warn!(peer = %peer, error = %e, "[CONNECT] Unreadable request");
                respond(&mut stream, 400, "Bad Request", "").await;
                return;
            }
            Err(_) => {
                warn!(peer = %peer, "[CONNECT] Timed out reading request");
                return;
            }
        };

        if !request.method.eq_ignore_ascii_case("CONNECT") {
            warn!(peer = %peer, method = %request.method, "[CONNECT] Method not allowed");
            respond(&mut stream, 405, "Method Not Allowed", "Allow: CONNECT\r\n").await;
            return;
        }

        info!(peer = %peer, authority = %request.target, "[CONNECT] Tunnel requested");

        let mut conn = HijackableConnection::with_buffered(stream, buffered);
        let result = handle_tunnel(&request.target, &mut conn, &self.provider, self.limits).await;

        match result {
            Ok(exchange) => {
                debug!(
                    peer = %peer,
                    authority = %request.target,
                    status = exchange.status,
                    "[CONNECT] Session complete"
                );
            }
            Err(e) if e.is_pre_hijack() => {
                warn!(peer = %peer, authority = %request.target, error = %e, "[CONNECT] Session rejected");
                if let Some(mut stream) = conn.into_inner() {
                    let (status, reason) = rejection_status(&e);
                    respond(&mut stream, status, reason, "").await;
                }
            }
            Err(e) => {
                error!(peer = %peer, authority = %request.target, error = %e, "[CONNECT] Session failed");
            }
        }
    }
}

fn rejection_status(err: &SessionError) -> (u16, &'static str) {
    match err {
        SessionError::Parse(_) => (400, "Bad Request"),
        SessionError::CertificateIssuance { .. } => (502, "Bad Gateway"),
        _ => (500, "Internal Server Error"),
    }
}

/// Plain HTTP answer on a connection that was never hijacked
async fn respond<S>(stream: &mut S, status: u16, reason: &str, extra_headers: &str)
where
    S: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {} {}\r\n{}Content-Length: 0\r\nConnection: close\r\n\r\n",
        status, reason, extra_headers
    );

    if let Err(e) = stream.write_all(response.as_bytes()).await {
        debug!("Failed to write {} response: {}", status, e);
        return;
    }
    let _ = stream.flush().await;
    let _ = stream.shutdown().await;
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
