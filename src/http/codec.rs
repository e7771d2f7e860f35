//! HTTP/1.x request framing over a raw byte stream.
//!
//! The request line is split by hand so that any `HTTP/<d>.<d>` version
//! reaches the caller intact; header lines are parsed with `httparse`.
//! Bytes read past the end of a head stay in the caller's buffer.

use bytes::{Buf, Bytes, BytesMut};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::security::limits::RequestLimits;

const READ_CHUNK: usize = 4096;

/// Errors produced while reading a request head or body.
#[derive(Debug, Error)]
pub enum HeadError {
    #[error("connection closed before a request was received")]
    Eof,
    #[error("connection closed mid-request")]
    UnexpectedEof,
    #[error("request head exceeds {0} bytes")]
    TooLarge(usize),
    #[error("request has more than {0} headers")]
    TooManyHeaders(usize),
    #[error("malformed request line")]
    RequestLine,
    #[error("malformed HTTP version")]
    Version,
    #[error("malformed header: {0}")]
    Header(String),
    #[error("invalid body framing: {0}")]
    Framing(&'static str),
    #[error("request body exceeds {0} bytes")]
    BodyTooLarge(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Declared protocol version of a request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    pub const HTTP_11: ProtocolVersion = ProtocolVersion { major: 1, minor: 1 };

    /// Parse `HTTP/<major>.<minor>` with single-digit components.
    pub fn parse(text: &str) -> Option<Self> {
        let digits = text.strip_prefix("HTTP/")?.as_bytes();
        match digits {
            [major, b'.', minor] if major.is_ascii_digit() && minor.is_ascii_digit() => Some(Self {
                major: major - b'0',
                minor: minor - b'0',
            }),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}

/// A parsed request head.
#[derive(Debug, Clone)]
pub struct Head {
    pub method: String,
    pub target: String,
    pub version: ProtocolVersion,
    pub headers: HeaderMap,
}

/// Read one request head from `io`, using `buf` for bytes already received.
///
/// On success the head's bytes are consumed from `buf`; anything after them
/// (pipelined body or next request) is left in place.
pub async fn read_head<R>(io: &mut R, buf: &mut BytesMut, limits: &RequestLimits) -> Result<Head, HeadError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some((head, consumed)) = parse_head(buf, limits)? {
            buf.advance(consumed);
            return Ok(head);
        }
        if !limits.head_fits(buf.len()) {
            return Err(HeadError::TooLarge(limits.max_head_bytes));
        }

        buf.reserve(READ_CHUNK);
        if io.read_buf(buf).await? == 0 {
            return Err(if buf.iter().all(|b| matches!(b, b'\r' | b'\n')) {
                HeadError::Eof
            } else {
                HeadError::UnexpectedEof
            });
        }
    }
}

/// Try to parse a complete head from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed.
pub fn parse_head(buf: &[u8], limits: &RequestLimits) -> Result<Option<(Head, usize)>, HeadError> {
    // Leading empty lines before the request line are ignored.
    let start = buf.iter().take_while(|b| matches!(b, b'\r' | b'\n')).count();
    let rest = &buf[start..];

    let Some(line_len) = rest.iter().position(|&b| b == b'\n') else {
        if !limits.head_fits(buf.len()) {
            return Err(HeadError::TooLarge(limits.max_head_bytes));
        }
        return Ok(None);
    };
    let line = rest[..line_len].strip_suffix(b"\r").unwrap_or(&rest[..line_len]);
    let line = std::str::from_utf8(line).map_err(|_| HeadError::RequestLine)?;

    let mut parts = line.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(HeadError::RequestLine);
    };
    if method.is_empty() || target.is_empty() || !method.bytes().all(is_token_byte) {
        return Err(HeadError::RequestLine);
    }
    let version = ProtocolVersion::parse(version).ok_or(HeadError::Version)?;

    let header_start = start + line_len + 1;
    let mut slots = vec![httparse::EMPTY_HEADER; limits.max_headers];
    let (header_len, parsed) = match httparse::parse_headers(&buf[header_start..], &mut slots) {
        Ok(httparse::Status::Complete(done)) => done,
        Ok(httparse::Status::Partial) => {
            if !limits.head_fits(buf.len()) {
                return Err(HeadError::TooLarge(limits.max_head_bytes));
            }
            return Ok(None);
        }
        Err(httparse::Error::TooManyHeaders) => return Err(HeadError::TooManyHeaders(limits.max_headers)),
        Err(e) => return Err(HeadError::Header(e.to_string())),
    };

    let consumed = header_start + header_len;
    if !limits.head_fits(consumed) {
        return Err(HeadError::TooLarge(limits.max_head_bytes));
    }

    let mut headers = HeaderMap::with_capacity(parsed.len());
    for h in parsed {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|_| HeadError::Header(h.name.to_string()))?;
        let value = HeaderValue::from_bytes(h.value).map_err(|_| HeadError::Header(h.name.to_string()))?;
        headers.append(name, value);
    }

    Ok(Some((
        Head {
            method: method.to_string(),
            target: target.to_string(),
            version,
            headers,
        },
        consumed,
    )))
}

/// Read the request body framed by `headers`.
///
/// `Transfer-Encoding: chunked` is decoded; otherwise `Content-Length` bytes
/// are read; a request with neither has an empty body.
pub async fn read_body<R>(
    io: &mut R,
    buf: &mut BytesMut,
    headers: &HeaderMap,
    limits: &RequestLimits,
) -> Result<Bytes, HeadError>
where
    R: AsyncRead + Unpin,
{
    if let Some(coding) = last_transfer_coding(headers)? {
        if !coding.eq_ignore_ascii_case("chunked") {
            return Err(HeadError::Framing("unsupported transfer-encoding"));
        }
        return read_chunked(io, buf, limits).await;
    }

    match content_length(headers)? {
        Some(0) | None => Ok(Bytes::new()),
        Some(len) => {
            if !limits.body_fits(len) {
                return Err(HeadError::BodyTooLarge(limits.max_body_bytes));
            }
            fill(io, buf, len).await?;
            Ok(buf.split_to(len).freeze())
        }
    }
}

fn last_transfer_coding(headers: &HeaderMap) -> Result<Option<String>, HeadError> {
    let mut last = None;
    for value in headers.get_all(header::TRANSFER_ENCODING) {
        let value = value.to_str().map_err(|_| HeadError::Framing("transfer-encoding is not ascii"))?;
        for coding in value.split(',').map(str::trim).filter(|c| !c.is_empty()) {
            last = Some(coding.to_string());
        }
    }
    Ok(last)
}

fn content_length(headers: &HeaderMap) -> Result<Option<usize>, HeadError> {
    let mut length = None;
    for value in headers.get_all(header::CONTENT_LENGTH) {
        let parsed = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .ok_or(HeadError::Framing("invalid content-length"))?;
        match length {
            Some(existing) if existing != parsed => return Err(HeadError::Framing("conflicting content-length")),
            _ => length = Some(parsed),
        }
    }
    Ok(length)
}

async fn read_chunked<R>(io: &mut R, buf: &mut BytesMut, limits: &RequestLimits) -> Result<Bytes, HeadError>
where
    R: AsyncRead + Unpin,
{
    let mut body = BytesMut::new();
    loop {
        let line = read_line(io, buf, limits.max_head_bytes).await?;
        let size_text = std::str::from_utf8(&line)
            .map_err(|_| HeadError::Framing("chunk size is not ascii"))?
            .split(';')
            .next()
            .unwrap_or_default()
            .trim();
        let size = usize::from_str_radix(size_text, 16).map_err(|_| HeadError::Framing("invalid chunk size"))?;

        if size == 0 {
            // Trailer section: discard fields up to the terminating empty line.
            while !read_line(io, buf, limits.max_head_bytes).await?.is_empty() {}
            return Ok(body.freeze());
        }

        if !limits.body_fits(body.len().saturating_add(size)) {
            return Err(HeadError::BodyTooLarge(limits.max_body_bytes));
        }
        fill(io, buf, size + 2).await?;
        body.extend_from_slice(&buf[..size]);
        if &buf[size..size + 2] != b"\r\n" {
            return Err(HeadError::Framing("chunk missing CRLF"));
        }
        buf.advance(size + 2);
    }
}

/// Read one CRLF (or bare LF) terminated line, without the terminator.
async fn read_line<R>(io: &mut R, buf: &mut BytesMut, max: usize) -> Result<BytesMut, HeadError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let mut line = buf.split_to(pos + 1);
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(pos - 1);
            }
            return Ok(line);
        }
        if buf.len() > max {
            return Err(HeadError::TooLarge(max));
        }
        buf.reserve(READ_CHUNK);
        if io.read_buf(buf).await? == 0 {
            return Err(HeadError::UnexpectedEof);
        }
    }
}

async fn fill<R>(io: &mut R, buf: &mut BytesMut, need: usize) -> Result<(), HeadError>
where
    R: AsyncRead + Unpin,
{
    while buf.len() < need {
        buf.reserve(need - buf.len());
        if io.read_buf(buf).await? == 0 {
            return Err(HeadError::UnexpectedEof);
        }
    }
    Ok(())
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}
