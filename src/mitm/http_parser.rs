//! HTTP/1.1 framing for intercepted traffic
//!
//! Reads exactly one request or response off a decrypted stream. The head is
//! parsed with httparse and the body is collected according to its declared
//! framing (Content-Length, chunked, or close-delimited for responses). The
//! bytes are retained as received so the message can be re-emitted verbatim
//! on the other tunnel.

use bytes::{Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

const READ_BUFFER_SIZE: usize = 8192;
const MAX_HEADERS: usize = 100;
/// Longest chunk-size or trailer line accepted
const MAX_LINE_SIZE: usize = 4096;

/// HTTP parsing errors
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Incomplete HTTP message: peer closed after {received} bytes")]
    Incomplete { received: usize },

    #[error("HTTP head exceeds {limit} bytes")]
    HeadTooLarge { limit: usize },

    #[error("HTTP body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("Invalid HTTP head: {0}")]
    InvalidHead(String),

    #[error("Invalid message framing: {0}")]
    InvalidFraming(String),

    #[error("Invalid chunked encoding: {0}")]
    InvalidChunk(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<httparse::Error> for ParseError {
    fn from(e: httparse::Error) -> Self {
        ParseError::InvalidHead(e.to_string())
    }
}

/// Buffering limits for one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayLimits {
    /// Maximum size of request line/status line plus headers
    pub max_head_bytes: usize,
    /// Maximum size of a buffered body (decoded size for chunked bodies)
    pub max_body_bytes: usize,
}

impl Default for RelayLimits {
    fn default() -> Self {
        Self {
            max_head_bytes: 32 * 1024,
            max_body_bytes: 100 * 1024 * 1024,
        }
    }
}

/// How a message body is delimited on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body follows the head
    Empty,
    /// Exactly this many bytes follow the head
    ContentLength(usize),
    /// Transfer-Encoding: chunked
    Chunked,
    /// Body runs until the sender closes (responses only)
    CloseDelimited,
}

/// One header as received
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: Vec<u8>,
}

impl Header {
    /// Value as text, if it is valid UTF-8
    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }
}

/// Parsed HTTP request with its original wire bytes
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// HTTP method (GET, POST, etc.)
    pub method: String,

    /// Request target (/path?query)
    pub target: String,

    /// Minor HTTP version (1 for HTTP/1.1)
    pub version: u8,

    /// Headers in received order, original case
    pub headers: Vec<Header>,

    /// How the body was framed
    pub framing: BodyFraming,

    head: Bytes,
    body: Bytes,
}

/// Parsed HTTP response with its original wire bytes
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    /// Minor HTTP version (1 for HTTP/1.1)
    pub version: u8,

    /// Status code (200, 404, etc.)
    pub status_code: u16,

    /// Reason phrase (OK, Not Found, etc.)
    pub reason: String,

    /// Headers in received order, original case
    pub headers: Vec<Header>,

    /// How the body was framed
    pub framing: BodyFraming,

    head: Bytes,
    body: Bytes,
}

impl HttpRequest {
    /// First header with this name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Host header
    pub fn host(&self) -> Option<&str> {
        self.header("host")
    }

    /// Body bytes exactly as framed on the wire (chunk framing included)
    pub fn raw_body(&self) -> &[u8] {
        &self.body
    }

    /// Serialize for the other tunnel; byte-identical to what was read
    pub fn to_bytes(&self) -> Bytes {
        join(&self.head, &self.body)
    }

    /// Size on the wire
    pub fn wire_len(&self) -> usize {
        self.head.len() + self.body.len()
    }
}

impl HttpResponse {
    /// First header with this name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Body bytes exactly as framed on the wire (chunk framing included)
    pub fn raw_body(&self) -> &[u8] {
        &self.body
    }

    /// Serialize for the other tunnel; byte-identical to what was read
    pub fn to_bytes(&self) -> Bytes {
        join(&self.head, &self.body)
    }

    /// Size on the wire
    pub fn wire_len(&self) -> usize {
        self.head.len() + self.body.len()
    }
}

/// Reads single HTTP/1 messages from a borrowed stream
///
/// Bytes read past the end of a message stay in the internal buffer; they are
/// never interpreted unless another read is issued.
pub struct MessageReader<'a, R> {
    io: &'a mut R,
    buf: BytesMut,
    limits: RelayLimits,
}

impl<'a, R> MessageReader<'a, R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(io: &'a mut R, limits: RelayLimits) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            limits,
        }
    }

    /// Read one complete request (head and body)
    pub async fn read_request(&mut self) -> Result<HttpRequest, ParseError> {
        let head_len = self.read_head().await?;

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        match request.parse(&self.buf[..head_len])? {
            httparse::Status::Complete(n) if n == head_len => {}
            _ => return Err(ParseError::InvalidHead("incomplete request head".to_string())),
        }

        let method = request
            .method
            .ok_or_else(|| ParseError::InvalidHead("missing method".to_string()))?
            .to_string();
        let target = request
            .path
            .ok_or_else(|| ParseError::InvalidHead("missing request target".to_string()))?
            .to_string();
        let version = request
            .version
            .ok_or_else(|| ParseError::InvalidHead("missing version".to_string()))?;
        let headers = collect_headers(request.headers);

        let framing = request_framing(&headers)?;
        let head = self.buf.split_to(head_len).freeze();
        let body = self.read_body(framing).await?;

        Ok(HttpRequest {
            method,
            target,
            version,
            headers,
            framing,
            head,
            body,
        })
    }

    /// Read one complete response to a request made with `request_method`
    pub async fn read_response(&mut self, request_method: &str) -> Result<HttpResponse, ParseError> {
        let head_len = self.read_head().await?;

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(&self.buf[..head_len])? {
            httparse::Status::Complete(n) if n == head_len => {}
            _ => return Err(ParseError::InvalidHead("incomplete response head".to_string())),
        }

        let status_code = response
            .code
            .ok_or_else(|| ParseError::InvalidHead("missing status code".to_string()))?;
        let reason = response.reason.unwrap_or_default().to_string();
        let version = response
            .version
            .ok_or_else(|| ParseError::InvalidHead("missing version".to_string()))?;
        let headers = collect_headers(response.headers);

        let framing = response_framing(request_method, status_code, &headers)?;
        let head = self.buf.split_to(head_len).freeze();
        let body = self.read_body(framing).await?;

        Ok(HttpResponse {
            version,
            status_code,
            reason,
            headers,
            framing,
            head,
            body,
        })
    }

    /// Bytes received past the last complete message
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Give up the reader, keeping whatever was read past the last message
    pub fn into_buffered(self) -> BytesMut {
        self.buf
    }

    async fn fill(&mut self) -> Result<usize, ParseError> {
        self.buf.reserve(READ_BUFFER_SIZE);
        Ok(self.io.read_buf(&mut self.buf).await?)
    }

    async fn fill_to(&mut self, len: usize) -> Result<(), ParseError> {
        while self.buf.len() < len {
            if self.fill().await? == 0 {
                return Err(ParseError::Incomplete {
                    received: self.buf.len(),
                });
            }
        }
        Ok(())
    }

    /// Returns the head length including the terminating blank line
    async fn read_head(&mut self) -> Result<usize, ParseError> {
        loop {
            if let Some(end) = find_header_end(&self.buf) {
                if end > self.limits.max_head_bytes {
                    return Err(ParseError::HeadTooLarge {
                        limit: self.limits.max_head_bytes,
                    });
                }
                return Ok(end);
            }
            if self.buf.len() > self.limits.max_head_bytes {
                return Err(ParseError::HeadTooLarge {
                    limit: self.limits.max_head_bytes,
                });
            }
            if self.fill().await? == 0 {
                return Err(ParseError::Incomplete {
                    received: self.buf.len(),
                });
            }
        }
    }

    async fn read_body(&mut self, framing: BodyFraming) -> Result<Bytes, ParseError> {
        match framing {
            BodyFraming::Empty => Ok(Bytes::new()),
            BodyFraming::ContentLength(len) => {
                if len > self.limits.max_body_bytes {
                    return Err(ParseError::BodyTooLarge {
                        limit: self.limits.max_body_bytes,
                    });
                }
                self.fill_to(len).await?;
                Ok(self.buf.split_to(len).freeze())
            }
            BodyFraming::Chunked => self.read_chunked().await,
            BodyFraming::CloseDelimited => {
                loop {
                    match self.fill().await {
                        Ok(0) => break,
                        Ok(_) => {}
                        // Peers commonly drop TCP without close_notify here
                        Err(ParseError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                        Err(e) => return Err(e),
                    }
                    if self.buf.len() > self.limits.max_body_bytes {
                        return Err(ParseError::BodyTooLarge {
                            limit: self.limits.max_body_bytes,
                        });
                    }
                }
                Ok(self.buf.split().freeze())
            }
        }
    }

    /// Collect a chunked body (RFC 9112 §7.1), keeping the framing as received
    async fn read_chunked(&mut self) -> Result<Bytes, ParseError> {
        let mut pos = 0;
        let mut decoded = 0usize;

        loop {
            let line_end = self.fill_line(pos).await?;
            let size = parse_chunk_size(&self.buf[pos..line_end])?;
            pos = line_end + 2;

            if size == 0 {
                // Trailer section, ends with an empty line
                let trailer_start = pos;
                loop {
                    let line_end = self.fill_line(pos).await?;
                    let is_last = line_end == pos;
                    pos = line_end + 2;
                    if is_last {
                        break;
                    }
                    if pos - trailer_start > self.limits.max_head_bytes {
                        return Err(ParseError::HeadTooLarge {
                            limit: self.limits.max_head_bytes,
                        });
                    }
                }
                return Ok(self.buf.split_to(pos).freeze());
            }

            decoded = decoded
                .checked_add(size)
                .filter(|total| *total <= self.limits.max_body_bytes)
                .ok_or(ParseError::BodyTooLarge {
                    limit: self.limits.max_body_bytes,
                })?;

            self.fill_to(pos + size + 2).await?;
            if &self.buf[pos + size..pos + size + 2] != b"\r\n" {
                return Err(ParseError::InvalidChunk(
                    "missing CRLF after chunk data".to_string(),
                ));
            }
            pos += size + 2;
        }
    }

    /// Returns the index of the CRLF ending the line that starts at `from`
    async fn fill_line(&mut self, from: usize) -> Result<usize, ParseError> {
        loop {
            if let Some(i) = find_crlf(&self.buf[from..]) {
                return Ok(from + i);
            }
            if self.buf.len() - from > MAX_LINE_SIZE {
                return Err(ParseError::InvalidChunk("line too long".to_string()));
            }
            if self.fill().await? == 0 {
                return Err(ParseError::Incomplete {
                    received: self.buf.len(),
                });
            }
        }
    }
}

fn collect_headers(raw: &[httparse::Header<'_>]) -> Vec<Header> {
    raw.iter()
        .map(|h| Header {
            name: h.name.to_string(),
            value: h.value.to_vec(),
        })
        .collect()
}

fn find_header<'h>(headers: &'h [Header], name: &str) -> Option<&'h str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .and_then(Header::value_str)
}

/// Framing of a request body
fn request_framing(headers: &[Header]) -> Result<BodyFraming, ParseError> {
    if let Some(chunked) = transfer_encoding_is_chunked(headers)? {
        reject_content_length_with_transfer_encoding(headers)?;
        if !chunked {
            return Err(ParseError::InvalidFraming(
                "request transfer-coding does not end in chunked".to_string(),
            ));
        }
        return Ok(BodyFraming::Chunked);
    }

    match content_length(headers)? {
        Some(0) | None => Ok(BodyFraming::Empty),
        Some(len) => Ok(BodyFraming::ContentLength(len)),
    }
}

/// Framing of a response body, which depends on the request method
fn response_framing(
    request_method: &str,
    status_code: u16,
    headers: &[Header],
) -> Result<BodyFraming, ParseError> {
    if request_method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status_code)
        || status_code == 204
        || status_code == 304
    {
        return Ok(BodyFraming::Empty);
    }

    if let Some(chunked) = transfer_encoding_is_chunked(headers)? {
        reject_content_length_with_transfer_encoding(headers)?;
        return Ok(if chunked {
            BodyFraming::Chunked
        } else {
            BodyFraming::CloseDelimited
        });
    }

    match content_length(headers)? {
        Some(0) => Ok(BodyFraming::Empty),
        Some(len) => Ok(BodyFraming::ContentLength(len)),
        None => Ok(BodyFraming::CloseDelimited),
    }
}

/// Both headers together would let the next hop pick a different body length
fn reject_content_length_with_transfer_encoding(headers: &[Header]) -> Result<(), ParseError> {
    if headers
        .iter()
        .any(|h| h.name.eq_ignore_ascii_case("content-length"))
    {
        return Err(ParseError::InvalidFraming(
            "both Transfer-Encoding and Content-Length present".to_string(),
        ));
    }
    Ok(())
}

/// `None` without Transfer-Encoding, otherwise whether the final coding is chunked
fn transfer_encoding_is_chunked(headers: &[Header]) -> Result<Option<bool>, ParseError> {
    let mut last_coding: Option<String> = None;
    for header in headers
        .iter()
        .filter(|h| h.name.eq_ignore_ascii_case("transfer-encoding"))
    {
        let value = header.value_str().ok_or_else(|| {
            ParseError::InvalidFraming("non-UTF-8 Transfer-Encoding".to_string())
        })?;
        if let Some(coding) = value.split(',').map(str::trim).filter(|c| !c.is_empty()).last() {
            last_coding = Some(coding.to_ascii_lowercase());
        }
    }
    Ok(last_coding.map(|coding| coding == "chunked"))
}

/// Content-Length, rejecting invalid or conflicting values
fn content_length(headers: &[Header]) -> Result<Option<usize>, ParseError> {
    let mut length: Option<usize> = None;
    for header in headers
        .iter()
        .filter(|h| h.name.eq_ignore_ascii_case("content-length"))
    {
        let value = header
            .value_str()
            .ok_or_else(|| ParseError::InvalidFraming("non-UTF-8 Content-Length".to_string()))?;
        for part in value.split(',') {
            let part = part.trim();
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ParseError::InvalidFraming(format!(
                    "invalid Content-Length: {}",
                    value
                )));
            }
            let parsed: usize = part.parse().map_err(|_| {
                ParseError::InvalidFraming(format!("Content-Length out of range: {}", part))
            })?;
            match length {
                Some(existing) if existing != parsed => {
                    return Err(ParseError::InvalidFraming(
                        "conflicting Content-Length values".to_string(),
                    ))
                }
                _ => length = Some(parsed),
            }
        }
    }
    Ok(length)
}

/// Parse chunk size (may have extensions like "A5;name=value")
fn parse_chunk_size(line: &[u8]) -> Result<usize, ParseError> {
    let line = std::str::from_utf8(line)
        .map_err(|_| ParseError::InvalidChunk("invalid chunk size encoding".to_string()))?;
    let size = line.split(';').next().unwrap_or(line).trim();
    if size.is_empty() {
        return Err(ParseError::InvalidChunk("empty chunk size".to_string()));
    }
    usize::from_str_radix(size, 16)
        .map_err(|_| ParseError::InvalidChunk(format!("invalid chunk size hex: {}", size)))
}

/// Find the end of HTTP headers (position after \r\n\r\n)
fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| i + 4)
}

/// Find CRLF position in buffer
fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

fn join(head: &Bytes, body: &Bytes) -> Bytes {
    if body.is_empty() {
        return head.clone();
    }
    let mut out = BytesMut::with_capacity(head.len() + body.len());
    out.extend_from_slice(head);
    out.extend_from_slice(body);
    out.freeze()
}
