//! Outbound dispatch and response serialization.
//!
//! # Responsibilities
//! - Send the sanitized inner request through its transport, once
//! - Turn the upstream response into the bytes a client would have read from
//!   the origin directly
//!
//! # Design Decisions
//! - No retries; a failed dispatch ends the tunnel
//! - The body is read under the dispatch deadline, then written in one piece
//! - Header order follows the upstream response; names get canonical casing
//! - A chunked upstream body is re-chunked as one chunk, so the framing
//!   headers stay truthful
//! - Responses that cannot carry a body (HEAD, 1xx, 204, 304) are emitted
//!   head only, whatever their framing headers say

use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{self, HeaderMap};
use http::{Method, StatusCode, Version};
use http_body_util::BodyExt;

use super::error::TunnelError;
use super::inner::InnerRequest;
use crate::observability::metrics;
use crate::transport::{OutboundResponse, RoundTrip};

/// Dispatch `request` through `transport`, recording the outcome.
pub async fn dispatch<T: RoundTrip>(transport: &T, request: InnerRequest) -> Result<OutboundResponse, TunnelError> {
    let started = Instant::now();
    let result = transport.round_trip(request).await;
    metrics::record_upstream(result.as_ref().ok().map(|r| r.status.as_u16()), started.elapsed());
    Ok(result?)
}

/// Serialize a complete upstream response to a `method` request.
pub async fn dump_response(response: OutboundResponse, method: &Method) -> Result<Bytes, TunnelError> {
    let OutboundResponse {
        version,
        status,
        reason,
        headers,
        body,
        deadline,
    } = response;

    let body = deadline
        .run(body.collect())
        .await
        .map_err(|e| TunnelError::ResponseSerializationFailure(Box::new(e)))?
        .map_err(TunnelError::ResponseSerializationFailure)?
        .to_bytes();

    let reason = reason.as_deref().or(status.canonical_reason()).unwrap_or_default();
    let mut out = BytesMut::with_capacity(256 + body.len());
    out.put_slice(version_text(version).as_bytes());
    out.put_slice(format!(" {}", status.as_u16()).as_bytes());
    if !reason.is_empty() {
        out.put_u8(b' ');
        out.put_slice(reason.as_bytes());
    }
    out.put_slice(b"\r\n");

    for (name, value) in headers.iter() {
        out.put_slice(canonical_header_name(name.as_str()).as_bytes());
        out.put_slice(b": ");
        out.put_slice(value.as_bytes());
        out.put_slice(b"\r\n");
    }
    out.put_slice(b"\r\n");

    if !has_body(method, status) {
        return Ok(out.freeze());
    }
    if is_chunked(&headers) {
        if !body.is_empty() {
            out.put_slice(format!("{:x}\r\n", body.len()).as_bytes());
            out.put_slice(&body);
            out.put_slice(b"\r\n");
        }
        out.put_slice(b"0\r\n\r\n");
    } else {
        out.put_slice(&body);
    }
    Ok(out.freeze())
}

fn version_text(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    }
}

fn has_body(method: &Method, status: StatusCode) -> bool {
    *method != Method::HEAD
        && !status.is_informational()
        && status != StatusCode::NO_CONTENT
        && status != StatusCode::NOT_MODIFIED
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .last()
        .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
}

/// `content-type` → `Content-Type`.
pub fn canonical_header_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c.to_ascii_lowercase());
        }
        upper = c == '-';
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::timeouts::Deadline;
    use crate::transport::BoxError;
    use http::HeaderValue;
    use http_body_util::Full;
    use hyper::body::{Body, Frame};
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;

    /// A body that never produces a frame.
    struct Stalled;

    impl Body for Stalled {
        type Data = Bytes;
        type Error = BoxError;

        fn poll_frame(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
            Poll::Pending
        }
    }

    fn response(status: StatusCode, headers: &[(&'static str, &'static str)], body: &'static [u8]) -> OutboundResponse {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(*name, HeaderValue::from_static(value));
        }
        OutboundResponse {
            version: Version::HTTP_11,
            status,
            reason: None,
            headers: map,
            body: Full::new(Bytes::from_static(body)).map_err(|never| match never {}).boxed(),
            deadline: Deadline::after(Duration::from_secs(10)),
        }
    }

    #[test]
    fn canonical_names() {
        assert_eq!(canonical_header_name("content-type"), "Content-Type");
        assert_eq!(canonical_header_name("x-request-id"), "X-Request-Id");
        assert_eq!(canonical_header_name("etag"), "Etag");
        assert_eq!(canonical_header_name("www-authenticate"), "Www-Authenticate");
    }

    #[tokio::test]
    async fn dumps_status_headers_and_body_in_order() {
        let bytes = dump_response(
            response(
                StatusCode::OK,
                &[("content-type", "text/html"), ("content-length", "5"), ("set-cookie", "a=1"), ("set-cookie", "b=2")],
                b"hello",
            ),
            &Method::GET,
        )
        .await
        .unwrap();

        assert_eq!(
            &bytes[..],
            &b"HTTP/1.1 200 OK\r\n\
               Content-Type: text/html\r\n\
               Content-Length: 5\r\n\
               Set-Cookie: a=1\r\n\
               Set-Cookie: b=2\r\n\
               \r\n\
               hello"[..]
        );
    }

    #[tokio::test]
    async fn keeps_origin_reason_phrase() {
        let mut upstream = response(StatusCode::NOT_FOUND, &[("content-length", "0")], b"");
        upstream.reason = Some("Nope".into());
        let bytes = dump_response(upstream, &Method::GET).await.unwrap();
        assert!(bytes.starts_with(b"HTTP/1.1 404 Nope\r\n"));
    }

    #[tokio::test]
    async fn rechunks_chunked_bodies() {
        let bytes = dump_response(
            response(StatusCode::OK, &[("transfer-encoding", "chunked")], b"hello world"),
            &Method::GET,
        )
        .await
        .unwrap();
        assert!(bytes.ends_with(b"\r\n\r\nb\r\nhello world\r\n0\r\n\r\n"), "{bytes:?}");
    }

    #[tokio::test]
    async fn head_response_gets_no_chunk_terminator() {
        let bytes = dump_response(response(StatusCode::OK, &[("transfer-encoding", "chunked")], b""), &Method::HEAD)
            .await
            .unwrap();
        assert_eq!(&bytes[..], &b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n"[..]);
    }

    #[tokio::test]
    async fn bodyless_statuses_are_head_only() {
        for status in [StatusCode::NO_CONTENT, StatusCode::NOT_MODIFIED, StatusCode::CONTINUE] {
            let bytes = dump_response(response(status, &[("transfer-encoding", "chunked")], b""), &Method::GET)
                .await
                .unwrap();
            assert!(bytes.ends_with(b"Transfer-Encoding: chunked\r\n\r\n"), "{status}: {bytes:?}");
        }
    }

    #[tokio::test]
    async fn head_response_keeps_declared_length_without_body() {
        let bytes = dump_response(response(StatusCode::OK, &[("content-length", "42")], b""), &Method::HEAD)
            .await
            .unwrap();
        assert_eq!(&bytes[..], &b"HTTP/1.1 200 OK\r\nContent-Length: 42\r\n\r\n"[..]);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_body_past_deadline_is_serialization_failure() {
        let upstream = OutboundResponse {
            version: Version::HTTP_11,
            status: StatusCode::OK,
            reason: None,
            headers: HeaderMap::new(),
            body: Stalled.boxed(),
            deadline: Deadline::after(Duration::from_secs(1)),
        };
        let err = dump_response(upstream, &Method::GET).await.unwrap_err();
        assert!(matches!(err, TunnelError::ResponseSerializationFailure(_)));
    }
}
