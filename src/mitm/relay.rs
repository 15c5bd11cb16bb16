//! One-shot request/response relay between the two decrypted tunnels
//!
//! Exactly one request is read from the client and written to the origin,
//! then exactly one response is read from the origin and written back. Bytes
//! are forwarded as received; nothing is rewritten.

use crate::mitm::error::{Direction, SessionError};
use crate::mitm::http_parser::{HttpRequest, HttpResponse, MessageReader, RelayLimits};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Summary of a completed relay cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayExchange {
    pub method: String,
    pub target: String,
    pub status: u16,
    pub request_bytes: usize,
    pub response_bytes: usize,
}

impl RelayExchange {
    pub fn new(request: HttpRequest, response: &HttpResponse) -> Self {
        Self {
            request_bytes: request.wire_len(),
            response_bytes: response.wire_len(),
            method: request.method,
            target: request.target,
            status: response.status_code,
        }
    }
}

/// Read one request from `client` and write it to `origin`
pub async fn forward_request<C, O>(
    client: &mut C,
    origin: &mut O,
    limits: RelayLimits,
) -> Result<HttpRequest, SessionError>
where
    C: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let request = {
        let mut reader = MessageReader::new(client, limits);
        let request = reader
            .read_request()
            .await
            .map_err(SessionError::MalformedRequest)?;

        if !reader.buffered().is_empty() {
            // Only one exchange per session; pipelined bytes are dropped
            debug!(
                extra_bytes = reader.buffered().len(),
                "Ignoring bytes after the first request"
            );
        }
        request
    };

    write_message(origin, &request.to_bytes())
        .await
        .map_err(|e| SessionError::forward(Direction::ToOrigin, e))?;

    debug!(
        method = %request.method,
        uri = %request.target,
        bytes = request.wire_len(),
        "Request forwarded to origin"
    );

    Ok(request)
}

/// Read the response to `request` from `origin` and write it to `client`
pub async fn forward_response<O, C>(
    origin: &mut O,
    client: &mut C,
    request: &HttpRequest,
    limits: RelayLimits,
) -> Result<HttpResponse, SessionError>
where
    O: AsyncRead + Unpin,
    C: AsyncWrite + Unpin,
{
    let response = MessageReader::new(origin, limits)
        .read_response(&request.method)
        .await
        .map_err(SessionError::MalformedResponse)?;

    write_message(client, &response.to_bytes())
        .await
        .map_err(|e| SessionError::forward(Direction::ToClient, e))?;

    debug!(
        status = response.status_code,
        bytes = response.wire_len(),
        "Response forwarded to client"
    );

    Ok(response)
}

/// Relay a single request and its response
pub async fn relay<C, O>(
    client: &mut C,
    origin: &mut O,
    limits: RelayLimits,
) -> Result<RelayExchange, SessionError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    O: AsyncRead + AsyncWrite + Unpin,
{
    let request = forward_request(client, origin, limits).await?;
    let response = forward_response(origin, client, &request, limits).await?;
    Ok(RelayExchange::new(request, &response))
}

async fn write_message<W>(io: &mut W, bytes: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    io.write_all(bytes).await?;
    io.flush().await
}
