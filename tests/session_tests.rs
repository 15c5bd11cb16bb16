//! End-to-end interception sessions over a loopback TLS origin

mod common;

use common::{localhost, spawn_origin, spawn_origin_as, unused_port, FailingIssuer, TestPki};
use mitmtap::mitm::tunnel::CONNECT_ESTABLISHED;
use mitmtap::{
    handle_tunnel, Hijack, HijackableConnection, RelayLimits, Session, SessionError, SessionState,
};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{duplex, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

const REQUEST: &[u8] = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK";

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Client behind the proxy: expects the ack, handshakes, sends `request`,
/// and returns everything received until the proxy closes.
fn spawn_client(
    connector: TlsConnector,
    mut io: DuplexStream,
    request: &'static [u8],
) -> JoinHandle<Vec<u8>> {
    tokio::spawn(async move {
        let mut ack = vec![0u8; CONNECT_ESTABLISHED.len()];
        io.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack, CONNECT_ESTABLISHED);

        let mut tls = connector.connect(localhost(), io).await.unwrap();
        tls.write_all(request).await.unwrap();
        tls.flush().await.unwrap();

        let mut response = Vec::new();
        tls.read_to_end(&mut response).await.unwrap();
        response
    })
}

#[tokio::test]
async fn test_single_exchange_is_relayed_byte_identical() {
    let pki = TestPki::new();
    let issuer = pki.counting_issuer();
    let provider = pki.provider(issuer.clone());
    let (origin_addr, origin) = spawn_origin(&pki, RESPONSE).await;

    let (proxy_side, client_side) = duplex(64 * 1024);
    let client = spawn_client(pki.client_connector(), client_side, REQUEST);

    let mut conn = HijackableConnection::new(proxy_side);
    let authority = format!("localhost:{}", origin_addr.port());
    let exchange = timeout(
        TEST_TIMEOUT,
        handle_tunnel(&authority, &mut conn, &provider, RelayLimits::default()),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(client.await.unwrap(), RESPONSE);

    let report = origin.await.unwrap();
    assert_eq!(report.request, REQUEST);
    assert!(report.trailing.is_empty());

    assert_eq!(exchange.method, "GET");
    assert_eq!(exchange.target, "/");
    assert_eq!(exchange.status, 200);
    assert_eq!(exchange.request_bytes, REQUEST.len());
    assert_eq!(exchange.response_bytes, RESPONSE.len());

    assert!(conn.is_hijacked());
    assert_eq!(issuer.calls(), 1);
    assert!(pki.config.cert_path("localhost").exists());
}

#[tokio::test]
async fn test_second_request_on_tunnel_is_not_relayed() {
    const PIPELINED: &[u8] = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\nGET /again HTTP/1.1\r\nHost: example.com\r\n\r\n";

    let pki = TestPki::new();
    let provider = pki.provider(pki.counting_issuer());
    let (origin_addr, origin) = spawn_origin(&pki, RESPONSE).await;

    let (proxy_side, client_side) = duplex(64 * 1024);
    let client = spawn_client(pki.client_connector(), client_side, PIPELINED);

    let mut conn = HijackableConnection::new(proxy_side);
    let authority = format!("localhost:{}", origin_addr.port());
    let exchange = timeout(
        TEST_TIMEOUT,
        handle_tunnel(&authority, &mut conn, &provider, RelayLimits::default()),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(exchange.target, "/");
    assert_eq!(client.await.unwrap(), RESPONSE);

    let report = origin.await.unwrap();
    assert_eq!(report.request, REQUEST);
    assert!(report.trailing.is_empty(), "second request reached the origin");
}

#[tokio::test]
async fn test_certificate_is_reused_by_later_sessions() {
    let pki = TestPki::new();
    let issuer = pki.counting_issuer();
    let provider = pki.provider(issuer.clone());

    for _ in 0..2 {
        let (origin_addr, origin) = spawn_origin(&pki, RESPONSE).await;
        let (proxy_side, client_side) = duplex(64 * 1024);
        let client = spawn_client(pki.client_connector(), client_side, REQUEST);

        let mut conn = HijackableConnection::new(proxy_side);
        let authority = format!("localhost:{}", origin_addr.port());
        timeout(
            TEST_TIMEOUT,
            handle_tunnel(&authority, &mut conn, &provider, RelayLimits::default()),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(client.await.unwrap(), RESPONSE);
        origin.await.unwrap();
    }

    assert_eq!(issuer.calls(), 1);
}

#[tokio::test]
async fn test_unreachable_origin_closes_client_tunnel() {
    let pki = TestPki::new();
    let provider = pki.provider(pki.counting_issuer());
    let port = unused_port().await;

    let (proxy_side, mut client_side) = duplex(64 * 1024);
    let connector = pki.client_connector();
    let client = tokio::spawn(async move {
        let mut ack = vec![0u8; CONNECT_ESTABLISHED.len()];
        client_side.read_exact(&mut ack).await.unwrap();

        let mut tls = connector.connect(localhost(), client_side).await.unwrap();
        let mut received = Vec::new();
        tls.read_to_end(&mut received).await.unwrap();
        received
    });

    let mut conn = HijackableConnection::new(proxy_side);
    let err = timeout(
        TEST_TIMEOUT,
        handle_tunnel(&format!("localhost:{}", port), &mut conn, &provider, RelayLimits::default()),
    )
    .await
    .unwrap()
    .unwrap_err();

    assert!(
        matches!(err, SessionError::OriginUnreachable { .. }),
        "unexpected error: {err}"
    );

    // The client sees an orderly close and no relayed bytes
    let received = timeout(TEST_TIMEOUT, client).await.unwrap().unwrap();
    assert!(received.is_empty());
}

#[tokio::test]
async fn test_origin_certificate_mismatch_is_unreachable() {
    let pki = TestPki::new();
    let provider = pki.provider(pki.counting_issuer());
    // Origin presents a valid leaf, but for a different name
    let (origin_addr, origin) = spawn_origin_as(&pki, "other.test", RESPONSE).await;

    let (proxy_side, mut client_side) = duplex(64 * 1024);
    let connector = pki.client_connector();
    let client = tokio::spawn(async move {
        let mut ack = vec![0u8; CONNECT_ESTABLISHED.len()];
        client_side.read_exact(&mut ack).await.unwrap();

        let mut tls = connector.connect(localhost(), client_side).await.unwrap();
        let mut received = Vec::new();
        tls.read_to_end(&mut received).await.unwrap();
        received
    });

    let mut conn = HijackableConnection::new(proxy_side);
    let authority = format!("localhost:{}", origin_addr.port());
    let err = timeout(
        TEST_TIMEOUT,
        handle_tunnel(&authority, &mut conn, &provider, RelayLimits::default()),
    )
    .await
    .unwrap()
    .unwrap_err();

    match &err {
        SessionError::OriginUnreachable { address, .. } => assert_eq!(address, &authority),
        other => panic!("unexpected error: {other}"),
    }

    // Client tunnel was closed without relaying anything
    let received = timeout(TEST_TIMEOUT, client).await.unwrap().unwrap();
    assert!(received.is_empty());

    let report = timeout(TEST_TIMEOUT, origin).await.unwrap().unwrap();
    assert!(report.request.is_empty());
}

/// Transport that refuses every write and records whether it was read from
struct BrokenWriteIo {
    read_polled: Arc<AtomicBool>,
}

impl AsyncRead for BrokenWriteIo {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.read_polled.store(true, Ordering::SeqCst);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for BrokenWriteIo {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

struct BrokenWriteConnection {
    read_polled: Arc<AtomicBool>,
}

impl Hijack for BrokenWriteConnection {
    type Io = BrokenWriteIo;

    fn hijack(&mut self) -> Result<Self::Io, SessionError> {
        Ok(BrokenWriteIo {
            read_polled: Arc::clone(&self.read_polled),
        })
    }
}

#[tokio::test]
async fn test_failed_ack_skips_handshake() {
    let pki = TestPki::new();
    let issuer = pki.counting_issuer();
    let provider = pki.provider(issuer.clone());

    let read_polled = Arc::new(AtomicBool::new(false));
    let mut conn = BrokenWriteConnection {
        read_polled: Arc::clone(&read_polled),
    };

    let err = timeout(
        TEST_TIMEOUT,
        handle_tunnel("localhost:443", &mut conn, &provider, RelayLimits::default()),
    )
    .await
    .unwrap()
    .unwrap_err();

    assert!(matches!(err, SessionError::TunnelAck(_)), "{err}");
    assert!(!err.is_pre_hijack());
    // Certificate was ready, but no ClientHello was ever read
    assert_eq!(issuer.calls(), 1);
    assert!(!read_polled.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_issuance_failure_leaves_connection_untouched() {
    let pki = TestPki::new();
    let provider = pki.provider(Arc::new(FailingIssuer));

    let (proxy_side, mut client_side) = duplex(64 * 1024);
    let mut conn = HijackableConnection::new(proxy_side);

    let err = handle_tunnel("example.com:443", &mut conn, &provider, RelayLimits::default())
        .await
        .unwrap_err();

    match &err {
        SessionError::CertificateIssuance { identity, reason } => {
            assert_eq!(identity, "example.com");
            assert!(reason.contains("root key unavailable"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.is_pre_hijack());
    assert!(!conn.is_hijacked());
    assert!(!pki.config.cert_path("example.com").exists());

    // No acknowledgement and no handshake bytes were written
    drop(conn.into_inner());
    let mut received = Vec::new();
    client_side.read_to_end(&mut received).await.unwrap();
    assert!(received.is_empty());
}

#[tokio::test]
async fn test_invalid_authority_is_parse_error() {
    let pki = TestPki::new();
    let issuer = pki.counting_issuer();
    let provider = pki.provider(issuer.clone());

    let (proxy_side, _client_side) = duplex(1024);
    let mut conn = HijackableConnection::new(proxy_side);

    let err = handle_tunnel("example.com:notaport", &mut conn, &provider, RelayLimits::default())
        .await
        .unwrap_err();

    assert!(matches!(err, SessionError::Parse(_)));
    assert!(!conn.is_hijacked());
    assert_eq!(issuer.calls(), 0);
}

#[tokio::test]
async fn test_run_after_completion_reports_closed() {
    let pki = TestPki::new();
    let provider = pki.provider(pki.counting_issuer());
    let (origin_addr, origin) = spawn_origin(&pki, RESPONSE).await;

    let (proxy_side, client_side) = duplex(64 * 1024);
    let client = spawn_client(pki.client_connector(), client_side, REQUEST);

    let mut conn = HijackableConnection::new(proxy_side);
    let authority = format!("localhost:{}", origin_addr.port());
    let mut session = Session::create(&authority, &mut conn, &provider, RelayLimits::default())
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::OriginConnected);
    assert_eq!(session.target().port(), origin_addr.port());

    session.run().await.unwrap();
    assert_eq!(session.state(), SessionState::Closed);
    assert!(session.is_closed());

    assert!(matches!(session.run().await, Err(SessionError::Closed)));

    // Closing again is a no-op
    session.close().await;
    assert!(session.is_closed());

    assert_eq!(client.await.unwrap(), RESPONSE);
    origin.await.unwrap();
}

#[tokio::test]
async fn test_malformed_request_closes_both_tunnels() {
    let pki = TestPki::new();
    let provider = pki.provider(pki.counting_issuer());
    let (origin_addr, origin) = spawn_origin(&pki, RESPONSE).await;

    let (proxy_side, client_side) = duplex(64 * 1024);
    let client = spawn_client(pki.client_connector(), client_side, b"NOT AN HTTP REQUEST\r\n\r\n");

    let mut conn = HijackableConnection::new(proxy_side);
    let authority = format!("localhost:{}", origin_addr.port());
    let err = timeout(
        TEST_TIMEOUT,
        handle_tunnel(&authority, &mut conn, &provider, RelayLimits::default()),
    )
    .await
    .unwrap()
    .unwrap_err();

    assert!(matches!(err, SessionError::MalformedRequest(_)), "{err}");
    assert!(client.await.unwrap().is_empty());

    // Origin saw a connection but never a request
    let report = origin.await.unwrap();
    assert!(report.request.is_empty());
}

#[tokio::test]
async fn test_client_handshake_failure() {
    let pki = TestPki::new();
    let provider = pki.provider(pki.counting_issuer());

    let (proxy_side, mut client_side) = duplex(64 * 1024);
    let client = tokio::spawn(async move {
        let mut ack = vec![0u8; CONNECT_ESTABLISHED.len()];
        client_side.read_exact(&mut ack).await.unwrap();
        // Plain text where a ClientHello belongs
        client_side.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut rest = Vec::new();
        let _ = client_side.read_to_end(&mut rest).await;
    });

    let mut conn = HijackableConnection::new(proxy_side);
    let err = timeout(
        TEST_TIMEOUT,
        handle_tunnel("localhost:443", &mut conn, &provider, RelayLimits::default()),
    )
    .await
    .unwrap()
    .unwrap_err();

    assert!(matches!(err, SessionError::Handshake { .. }), "{err}");
    timeout(TEST_TIMEOUT, client).await.unwrap().unwrap();
}

struct DetachedConnection;

impl Hijack for DetachedConnection {
    type Io = DuplexStream;

    fn hijack(&mut self) -> Result<Self::Io, SessionError> {
        Err(SessionError::HijackUnsupported(
            "response writer does not expose its connection".to_string(),
        ))
    }
}

#[tokio::test]
async fn test_hijack_unsupported() {
    let pki = TestPki::new();
    let provider = pki.provider(pki.counting_issuer());

    let err = handle_tunnel(
        "localhost:443",
        &mut DetachedConnection,
        &provider,
        RelayLimits::default(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, SessionError::HijackUnsupported(_)));
    assert!(err.is_pre_hijack());
}
