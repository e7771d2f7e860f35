//! Inbound request model.
//!
//! # Responsibilities
//! - Turn a parsed head into an immutable `InboundRequest`
//! - Classify the request target (authority, origin, absolute, asterisk form)
//! - Resolve the effective host the way an HTTP/1 server does
//!
//! # Design Decisions
//! - The target URL host wins over the `Host` header
//! - Nothing here rejects requests; that is the tunnel validator's job

use std::net::SocketAddr;

use http::header::{self, HeaderMap};

use crate::http::codec::{Head, ProtocolVersion};

/// The request target split into the parts the tunnel validator checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTarget {
    /// The target exactly as it appeared on the request line.
    pub raw: String,
    /// URL scheme, empty for authority and origin forms.
    pub scheme: String,
    /// URL host (with port when present), empty for origin and asterisk forms.
    pub host: String,
}

impl RequestTarget {
    /// Classify `raw` as sent with a request of the given method.
    pub fn parse(is_connect: bool, raw: &str) -> Self {
        let (scheme, host) = if raw == "*" || raw.starts_with('/') {
            (String::new(), String::new())
        } else if is_connect {
            (String::new(), raw.to_string())
        } else {
            match url::Url::parse(raw) {
                Ok(url) => {
                    let host = match (url.host_str(), url.port()) {
                        (Some(host), Some(port)) => format!("{host}:{port}"),
                        (Some(host), None) => host.to_string(),
                        (None, _) => String::new(),
                    };
                    (url.scheme().to_string(), host)
                }
                Err(_) => (String::new(), String::new()),
            }
        };

        Self {
            raw: raw.to_string(),
            scheme,
            host,
        }
    }
}

impl std::fmt::Display for RequestTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// An inbound request as received by the proxy listener.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: String,
    pub target: RequestTarget,
    pub version: ProtocolVersion,
    pub headers: HeaderMap,
    pub remote_addr: SocketAddr,
}

impl InboundRequest {
    pub fn from_head(head: Head, remote_addr: SocketAddr) -> Self {
        let is_connect = head.method.eq_ignore_ascii_case("CONNECT");
        Self {
            target: RequestTarget::parse(is_connect, &head.target),
            method: head.method,
            version: head.version,
            headers: head.headers,
            remote_addr,
        }
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Effective host: the target's host, falling back to the `Host` header.
    pub fn host(&self) -> &str {
        if !self.target.host.is_empty() {
            return &self.target.host;
        }
        self.headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
    }
}
