//! Outbound transport subsystem.
//!
//! # Data Flow
//! ```text
//! fingerprint identifier (proxy-tls)
//!     → fingerprint.rs (JA3 string → TlsFingerprint, or the default profile)
//!     → cache.rs (copy-on-write map keyed on the parsed fingerprint)
//!     → fingerprint.rs (TlsFingerprint → rustls ClientConfig) on a miss
//!     → client.rs (one TCP/TLS connection, one HTTP/1.1 exchange)
//!     → OutboundResponse (head + streaming body + deadline)
//! ```
//!
//! # Design Decisions
//! - Transports hold TLS policy only, never a connection; nothing is pooled
//! - The factory does no I/O; dispatch does all of it under one deadline
//! - The tunnel core depends on the traits below, so tests swap in fakes

pub mod cache;
pub mod client;
pub mod fingerprint;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, StatusCode, Version};
use http_body_util::combinators::BoxBody;
use thiserror::Error;

use crate::resilience::timeouts::Deadline;
use crate::tunnel::inner::InnerRequest;

pub use cache::TransportCache;
pub use client::FingerprintedTransport;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Streaming upstream response body.
pub type ResponseBody = BoxBody<Bytes, BoxError>;

/// Errors from one outbound exchange.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("request URL has no host")]
    MissingHost,
    #[error("unsupported scheme '{0}'")]
    UnsupportedScheme(String),
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid TLS server name '{0}'")]
    ServerName(String),
    #[error("TLS handshake with {host} failed: {source}")]
    Tls {
        host: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid outbound request: {0}")]
    Request(#[from] http::Error),
    #[error("HTTP exchange failed: {0}")]
    Http(#[from] hyper::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Upstream response handed to the relay.
pub struct OutboundResponse {
    pub version: Version,
    pub status: StatusCode,
    /// Reason phrase as sent by the origin, when it differs from the canonical one.
    pub reason: Option<String>,
    pub headers: HeaderMap,
    pub body: ResponseBody,
    /// The body must be fully read before this passes.
    pub deadline: Deadline,
}

impl std::fmt::Debug for OutboundResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundResponse")
            .field("version", &self.version)
            .field("status", &self.status)
            .field("reason", &self.reason)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Performs one request/response exchange.
pub trait RoundTrip: Send + Sync + 'static {
    fn round_trip(
        &self,
        request: InnerRequest,
    ) -> impl Future<Output = Result<OutboundResponse, DispatchError>> + Send;
}

/// Produces the transport for a fingerprint identifier.
///
/// Must not perform network I/O.
pub trait TransportFactory: Send + Sync + 'static {
    type Transport: RoundTrip;

    fn transport(&self, fingerprint: &str) -> Arc<Self::Transport>;
}
