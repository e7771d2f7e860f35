//! Inner request parsing.
//!
//! # Responsibilities
//! - Read exactly one HTTP/1.x request from an established tunnel
//! - Resolve its destination URL (absolute-form target, `Host` header, or the
//!   outer CONNECT authority, in that order)
//! - Extract the `proxy-protocol` and `proxy-tls` directives
//!
//! # Design Decisions
//! - The URL is built with `http` as scheme, then switched to the directive
//!   scheme; an explicit port survives the switch unless it becomes the default
//! - The body is fully de-framed here, so the sanitizer may drop
//!   `Transfer-Encoding` without changing what is sent upstream
//! - A de-chunked body carries a `Content-Length` matching the decoded
//!   bytes; any length sent alongside `Transfer-Encoding` is discarded

use std::str::FromStr;

use bytes::{Bytes, BytesMut};
use http::header::{self, HeaderMap, HeaderValue};
use http::uri::Authority;
use http::Method;
use thiserror::Error;
use tokio::io::AsyncRead;
use url::Url;

use crate::http::codec::{read_body, read_head, HeadError, ProtocolVersion};
use crate::security::headers::{PROXY_PROTOCOL, PROXY_TLS};
use crate::security::limits::RequestLimits;

/// Scheme used when `proxy-protocol` is absent or not exactly `http`/`https`.
pub const DEFAULT_SCHEME: &str = "https";

/// Scheme used while building the URL from the request head.
const PARSE_SCHEME: &str = "http";

#[derive(Debug, Error)]
pub enum InnerRequestError {
    #[error(transparent)]
    Head(#[from] HeadError),
    #[error("invalid method '{0}'")]
    Method(String),
    #[error("no host in request")]
    MissingHost,
    #[error("invalid host '{0}'")]
    Host(String),
    #[error("cannot switch '{0}' to the directive scheme")]
    Scheme(String),
    #[error("invalid request target '{target}': {source}")]
    Url {
        target: String,
        #[source]
        source: url::ParseError,
    },
}

/// A request read from inside a tunnel.
#[derive(Debug, Clone)]
pub struct InnerRequest {
    pub method: Method,
    pub url: Url,
    pub version: ProtocolVersion,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Proxy directives carried by an inner request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directives {
    /// `http` or `https`.
    pub scheme: &'static str,
    /// Opaque fingerprint identifier; empty selects the default profile.
    pub fingerprint: String,
}

impl Directives {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let scheme = match headers.get(PROXY_PROTOCOL).map(|v| v.as_bytes()) {
            Some(b"http") => "http",
            Some(b"https") => "https",
            _ => DEFAULT_SCHEME,
        };
        let fingerprint = headers
            .get(PROXY_TLS)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        Self { scheme, fingerprint }
    }
}

/// Read one inner request from the tunnel.
///
/// `connect_authority` is the outer CONNECT target, used when the inner
/// request names no host of its own. Directive headers are left in place for
/// the sanitizer.
pub async fn read_inner_request<R>(
    io: &mut R,
    buf: &mut BytesMut,
    limits: &RequestLimits,
    connect_authority: &str,
) -> Result<(InnerRequest, Directives), InnerRequestError>
where
    R: AsyncRead + Unpin,
{
    let mut head = read_head(io, buf, limits).await?;
    let method =
        Method::from_bytes(head.method.as_bytes()).map_err(|_| InnerRequestError::Method(head.method.clone()))?;
    let mut url = request_url(&head.target, &head.headers, connect_authority)?;
    let body = read_body(io, buf, &head.headers, limits).await?;
    if head.headers.contains_key(header::TRANSFER_ENCODING) {
        head.headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    }

    let directives = Directives::from_headers(&head.headers);
    if url.set_scheme(directives.scheme).is_err() {
        return Err(InnerRequestError::Scheme(url.to_string()));
    }

    Ok((
        InnerRequest {
            method,
            url,
            version: head.version,
            headers: head.headers,
            body,
        },
        directives,
    ))
}

fn request_url(target: &str, headers: &HeaderMap, connect_authority: &str) -> Result<Url, InnerRequestError> {
    let url_error = |source| InnerRequestError::Url {
        target: target.to_string(),
        source,
    };

    if !target.starts_with('/') {
        let url = Url::parse(target).map_err(url_error)?;
        if url.host_str().map_or(true, str::is_empty) {
            return Err(InnerRequestError::MissingHost);
        }
        return Ok(url);
    }

    let host = match headers.get(header::HOST) {
        Some(value) => value
            .to_str()
            .map_err(|_| InnerRequestError::Host(String::from_utf8_lossy(value.as_bytes()).into_owned()))?,
        None => connect_authority,
    };
    if host.is_empty() {
        return Err(InnerRequestError::MissingHost);
    }
    // Reject anything that would change the URL structure (paths, userinfo, queries).
    let authority = Authority::from_str(host).map_err(|_| InnerRequestError::Host(host.to_string()))?;
    if authority.as_str().contains('@') {
        return Err(InnerRequestError::Host(host.to_string()));
    }

    Url::parse(&format!("{PARSE_SCHEME}://{authority}{target}")).map_err(url_error)
}
