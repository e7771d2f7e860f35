//! Header sanitization for forwarded inner requests.
//!
//! # Responsibilities
//! - Strip the proxy directive headers (`proxy-protocol`, `proxy-tls`)
//! - Strip proxy authentication artefacts
//! - Strip hop-by-hop headers, including those nominated by `Connection`
//!
//! # Design Decisions
//! - Pure function over the header map, no I/O
//! - Directive headers are read by the inner request reader before this runs

use http::header::{self, HeaderMap, HeaderName};

/// Directive header selecting the destination scheme.
pub const PROXY_PROTOCOL: HeaderName = HeaderName::from_static("proxy-protocol");

/// Directive header carrying the TLS fingerprint identifier.
pub const PROXY_TLS: HeaderName = HeaderName::from_static("proxy-tls");

const PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");
const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");

/// Headers that never leave the proxy.
const SERVICE_HEADERS: [HeaderName; 11] = [
    PROXY_PROTOCOL,
    PROXY_TLS,
    header::PROXY_AUTHORIZATION,
    header::PROXY_AUTHENTICATE,
    PROXY_CONNECTION,
    header::CONNECTION,
    KEEP_ALIVE,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Remove directive and hop-by-hop headers before dispatching upstream.
pub fn remove_service_headers(headers: &mut HeaderMap) {
    let nominated: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in nominated {
        headers.remove(name);
    }
    for name in SERVICE_HEADERS {
        headers.remove(name);
    }
}
