//! Tunnel establishment for both legs of an interception
//!
//! The client leg starts from a hijacked plain connection: the CONNECT is
//! acknowledged and the proxy then accepts TLS on the same bytes using the
//! minted certificate. The origin leg is a fresh TCP connection wrapped in
//! verified client TLS.

use crate::mitm::error::SessionError;
use crate::mitm::target::TargetIdentity;
use crate::mitm::tls_config::InterceptTls;
use bytes::{Buf, Bytes, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};
use tracing::{debug, info};

/// Acknowledgement written to the client before the TLS handshake
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// A connection whose raw byte stream can be taken over
///
/// After a successful hijack the accepting layer must not touch the
/// connection again; the session owns the returned stream.
pub trait Hijack {
    type Io: AsyncRead + AsyncWrite + Unpin + Send;

    fn hijack(&mut self) -> Result<Self::Io, SessionError>;
}

/// Plain connection held by the accepting layer until a session takes it
pub struct HijackableConnection<S> {
    inner: Option<(S, BytesMut)>,
}

impl<S> HijackableConnection<S> {
    pub fn new(io: S) -> Self {
        Self::with_buffered(io, BytesMut::new())
    }

    /// `buffered` holds bytes already read past the CONNECT head
    pub fn with_buffered(io: S, buffered: BytesMut) -> Self {
        Self {
            inner: Some((io, buffered)),
        }
    }

    pub fn is_hijacked(&self) -> bool {
        self.inner.is_none()
    }

    /// Give the connection back to the accepting layer, if it was not hijacked
    pub fn into_inner(self) -> Option<S> {
        self.inner.map(|(io, _)| io)
    }
}

impl<S> Hijack for HijackableConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    type Io = Rewind<S>;

    fn hijack(&mut self) -> Result<Self::Io, SessionError> {
        let (io, buffered) = self.inner.take().ok_or_else(|| {
            SessionError::HijackUnsupported("connection was already hijacked".to_string())
        })?;
        Ok(Rewind::new(io, buffered.freeze()))
    }
}

/// Stream that replays already-read bytes before reading from `inner`
pub struct Rewind<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> Rewind<S> {
    pub fn new(inner: S, prefix: Bytes) -> Self {
        Self { prefix, inner }
    }

    pub fn into_inner(self) -> (S, Bytes) {
        (self.inner, self.prefix)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

/// Which end of TLS the proxy plays on a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelRole {
    /// Proxy is the TLS server (client leg)
    Server,
    /// Proxy is the TLS client (origin leg)
    Client,
}

/// An established TLS stream with one peer
pub struct Tunnel<S> {
    role: TunnelRole,
    peer: String,
    stream: Option<S>,
}

/// Client leg: proxy-terminated TLS over the hijacked connection
pub type ClientTunnel<S> = Tunnel<server::TlsStream<S>>;

/// Origin leg: verified TLS over TCP
pub type OriginTunnel = Tunnel<client::TlsStream<TcpStream>>;

impl<S> Tunnel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(role: TunnelRole, peer: impl Into<String>, stream: S) -> Self {
        Self {
            role,
            peer: peer.into(),
            stream: Some(stream),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// The live stream, or `Closed` once the tunnel has been shut down
    pub fn stream_mut(&mut self) -> Result<&mut S, SessionError> {
        self.stream.as_mut().ok_or(SessionError::Closed)
    }

    /// Send close_notify and release the connection. Safe to call twice.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!(peer = %self.peer, role = ?self.role, error = %e, "Tunnel shutdown error");
            }
        }
    }
}

/// Acknowledge the CONNECT and complete the client-facing TLS handshake
pub async fn establish_client_tunnel<H>(
    conn: &mut H,
    tls: &InterceptTls,
    peer: &str,
) -> Result<ClientTunnel<H::Io>, SessionError>
where
    H: Hijack,
{
    let mut raw = conn.hijack()?;

    if let Err(e) = write_ack(&mut raw).await {
        let _ = raw.shutdown().await;
        return Err(SessionError::TunnelAck(e));
    }

    let acceptor = TlsAcceptor::from(tls.server_config());
    let stream = acceptor
        .accept(raw)
        .await
        .map_err(|e| SessionError::handshake(peer, e))?;

    debug!(peer = %peer, "Client TLS handshake complete");
    Ok(Tunnel::new(TunnelRole::Server, peer, stream))
}

/// Dial the origin and complete a verified TLS handshake with it
pub async fn dial_origin(
    target: &TargetIdentity,
    tls: &InterceptTls,
) -> Result<OriginTunnel, SessionError> {
    let address = target.to_string();

    let tcp = TcpStream::connect(target.dial_addr())
        .await
        .map_err(|e| SessionError::origin_unreachable(&address, e))?;
    let _ = tcp.set_nodelay(true);

    let connector = TlsConnector::from(tls.client_config());
    let stream = connector
        .connect(tls.server_name().clone(), tcp)
        .await
        .map_err(|e| SessionError::origin_unreachable(&address, e))?;

    info!(origin = %address, "Connected to origin");
    Ok(Tunnel::new(TunnelRole::Client, address, stream))
}

async fn write_ack<W: AsyncWrite + Unpin>(io: &mut W) -> io::Result<()> {
    io.write_all(CONNECT_ESTABLISHED).await?;
    io.flush().await
}
