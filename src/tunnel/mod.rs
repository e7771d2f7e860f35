//! CONNECT tunnel state machine.
//!
//! # Data Flow
//! ```text
//! Inbound connection
//!     → http::codec (outer head)
//!     → validator.rs (CONNECT over HTTP/1.x only)
//!     → establish.rs (hijack, ack "HTTP/x.y 200 OK")
//!     → inner.rs (one request from inside the tunnel + directives)
//!     → security::headers (strip directives and hop-by-hop headers)
//!     → transport (fingerprinted transport, one dispatch)
//!     → relay.rs (serialize upstream response, write verbatim)
//!     → close
//! ```
//!
//! # Design Decisions
//! - One exchange per tunnel; the socket is closed after the relay, always
//! - Everything shared is in `TunnelContext`, passed in explicitly
//! - Before hijack errors are answered through `ResponseWriter`; after it only
//!   a best-effort raw reply is possible

pub mod error;
pub mod establish;
pub mod inner;
pub mod relay;
pub mod validator;

use std::fmt;
use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::http::codec::{read_head, HeadError};
use crate::http::request::InboundRequest;
use crate::http::response::ResponseWriter;
use crate::observability::metrics;
use crate::security::headers::remove_service_headers;
use crate::security::limits::RequestLimits;
use crate::transport::TransportFactory;

pub use error::TunnelError;
use establish::RawTunnel;

/// Where a tunnel is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Received,
    Validated,
    Hijacked,
    Acknowledged,
    InnerRequestParsed,
    Sanitized,
    Dispatched,
    Relayed,
    Closed,
    Failed,
}

impl TunnelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Validated => "validated",
            Self::Hijacked => "hijacked",
            Self::Acknowledged => "acknowledged",
            Self::InnerRequestParsed => "inner_request_parsed",
            Self::Sanitized => "sanitized",
            Self::Dispatched => "dispatched",
            Self::Relayed => "relayed",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only collaborators shared by every tunnel.
#[derive(Debug)]
pub struct TunnelContext<F> {
    pub transports: F,
    pub limits: RequestLimits,
}

impl<F: TransportFactory> TunnelContext<F> {
    pub fn new(transports: F, limits: RequestLimits) -> Self {
        Self { transports, limits }
    }
}

/// Serve one inbound connection from first byte to close.
///
/// A connection that closes before sending anything is not an error.
pub async fn serve_connection<S, F>(io: S, remote_addr: SocketAddr, ctx: &TunnelContext<F>) -> Result<(), TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    F: TransportFactory,
{
    let mut state = TunnelState::Received;
    let result = run(io, remote_addr, ctx, &mut state).await;

    match &result {
        Ok(()) if state == TunnelState::Closed => metrics::record_tunnel("relayed"),
        Ok(()) => {}
        Err(e) => {
            let failed_in = state;
            state = TunnelState::Failed;
            if e.is_post_hijack() {
                tracing::error!(error = %e, failed_in = %failed_in, state = %state, "Tunnel failed");
            } else {
                tracing::debug!(error = %e, failed_in = %failed_in, "Tunnel request rejected");
            }
            metrics::record_tunnel(e.kind());
        }
    }
    tracing::Span::current().record("state", state.as_str());
    result
}

async fn run<S, F>(
    mut io: S,
    remote_addr: SocketAddr,
    ctx: &TunnelContext<F>,
    state: &mut TunnelState,
) -> Result<(), TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    F: TransportFactory,
{
    let mut buf = BytesMut::new();
    let head = match read_head(&mut io, &mut buf, &ctx.limits).await {
        Ok(head) => head,
        Err(HeadError::Eof) => return Ok(()),
        Err(e) => {
            let err = TunnelError::MalformedTunnelRequest(e.to_string());
            reject(ResponseWriter::new(io, buf), &err).await;
            return Err(err);
        }
    };

    let request = InboundRequest::from_head(head, remote_addr);
    let writer = ResponseWriter::new(io, buf);
    if let Err(err) = validator::validate(&request) {
        reject(writer, &err).await;
        return Err(err);
    }
    *state = TunnelState::Validated;

    let mut tunnel = RawTunnel::hijack(writer).await?;
    *state = TunnelState::Hijacked;
    tunnel.acknowledge(request.version).await?;
    *state = TunnelState::Acknowledged;

    let result = exchange(&mut tunnel, &request, ctx, state).await;
    if let Err(err) = &result {
        if let Some(body) = err.client_message() {
            tunnel.report(err.status(), body).await;
        }
    }
    tunnel.close().await;
    if result.is_ok() {
        *state = TunnelState::Closed;
    }
    result
}

/// The post-acknowledgement half: one inner request, one upstream response.
async fn exchange<S, F>(
    tunnel: &mut RawTunnel<S>,
    outer: &InboundRequest,
    ctx: &TunnelContext<F>,
    state: &mut TunnelState,
) -> Result<(), TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    F: TransportFactory,
{
    let (io, buf) = tunnel.reader();
    let (mut inner, directives) = inner::read_inner_request(io, buf, &ctx.limits, outer.host()).await?;
    *state = TunnelState::InnerRequestParsed;

    remove_service_headers(&mut inner.headers);
    *state = TunnelState::Sanitized;

    let method = inner.method.clone();
    let url = inner.url.to_string();
    let transport = ctx.transports.transport(&directives.fingerprint);
    let response = relay::dispatch(transport.as_ref(), inner).await?;
    *state = TunnelState::Dispatched;

    tracing::info!(
        remote_addr = %outer.remote_addr,
        method = %method,
        url = %url,
        status = response.status.as_u16(),
        "Upstream response"
    );

    let bytes = relay::dump_response(response, &method).await?;
    tunnel.write(&bytes).await?;
    *state = TunnelState::Relayed;
    Ok(())
}

/// Answer a rejected request and close the connection.
async fn reject<S>(mut writer: ResponseWriter<S>, err: &TunnelError)
where
    S: AsyncWrite + Unpin,
{
    if let Some(body) = err.client_message() {
        if let Err(e) = writer.error(err.status(), body).await {
            tracing::debug!(error = %e, "Failed to write error response");
            return;
        }
    }
    if let Err(e) = writer.finish().await {
        tracing::debug!(error = %e, "Failed to close rejected connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::response::error_response;
    use crate::resilience::timeouts::Deadline;
    use crate::security::headers::{PROXY_PROTOCOL, PROXY_TLS};
    use crate::transport::{DispatchError, OutboundResponse, RoundTrip};
    use bytes::Bytes;
    use http::{HeaderMap, HeaderValue, StatusCode, Version};
    use http_body_util::{BodyExt, Full};
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadBuf};

    use super::inner::InnerRequest;

    const UPSTREAM: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 5\r\n\r\nhello";

    struct FakeTransport {
        fingerprint: String,
        fail: bool,
        requests: Mutex<Vec<InnerRequest>>,
    }

    impl RoundTrip for FakeTransport {
        async fn round_trip(&self, request: InnerRequest) -> Result<OutboundResponse, DispatchError> {
            self.requests.lock().unwrap().push(request);
            if self.fail {
                return Err(DispatchError::Timeout(Duration::from_secs(10)));
            }
            let mut headers = HeaderMap::new();
            headers.insert("content-type", HeaderValue::from_static("text/html"));
            headers.insert("content-length", HeaderValue::from_static("5"));
            Ok(OutboundResponse {
                version: Version::HTTP_11,
                status: StatusCode::OK,
                reason: None,
                headers,
                body: Full::new(Bytes::from_static(b"hello")).map_err(|never| match never {}).boxed(),
                deadline: Deadline::after(Duration::from_secs(10)),
            })
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        fail: bool,
        transports: Mutex<Vec<Arc<FakeTransport>>>,
    }

    impl FakeFactory {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn dispatched(&self) -> Vec<(String, InnerRequest)> {
            self.transports
                .lock()
                .unwrap()
                .iter()
                .flat_map(|t| {
                    let requests = t.requests.lock().unwrap();
                    requests.iter().map(|r| (t.fingerprint.clone(), r.clone())).collect::<Vec<_>>()
                })
                .collect()
        }
    }

    impl TransportFactory for FakeFactory {
        type Transport = FakeTransport;

        fn transport(&self, fingerprint: &str) -> Arc<FakeTransport> {
            let transport = Arc::new(FakeTransport {
                fingerprint: fingerprint.to_string(),
                fail: self.fail,
                requests: Mutex::new(Vec::new()),
            });
            self.transports.lock().unwrap().push(Arc::clone(&transport));
            transport
        }
    }

    /// Counts how often the server side of the connection is shut down and dropped.
    struct Tracked {
        inner: DuplexStream,
        shutdowns: Arc<AtomicUsize>,
        drops: Arc<AtomicUsize>,
    }

    impl AsyncRead for Tracked {
        fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for Tracked {
        fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            let result = Pin::new(&mut self.inner).poll_shutdown(cx);
            if result.is_ready() {
                self.shutdowns.fetch_add(1, Ordering::SeqCst);
            }
            result
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Outcome {
        result: Result<(), TunnelError>,
        output: Vec<u8>,
        shutdowns: usize,
        drops: usize,
    }

    async fn drive(factory: FakeFactory, input: &[u8]) -> (Outcome, FakeFactory) {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let drops = Arc::new(AtomicUsize::new(0));
        let io = Tracked {
            inner: server,
            shutdowns: Arc::clone(&shutdowns),
            drops: Arc::clone(&drops),
        };

        client.write_all(input).await.unwrap();
        client.shutdown().await.unwrap();

        let ctx = TunnelContext::new(factory, RequestLimits::default());
        let result = serve_connection(io, "127.0.0.1:40000".parse().unwrap(), &ctx).await;

        let mut output = Vec::new();
        client.read_to_end(&mut output).await.unwrap();
        let outcome = Outcome {
            result,
            output,
            shutdowns: shutdowns.load(Ordering::SeqCst),
            drops: drops.load(Ordering::SeqCst),
        };
        (outcome, ctx.transports)
    }

    fn tunnel_input(inner: &str) -> Vec<u8> {
        let mut input = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n".to_vec();
        input.extend_from_slice(inner.as_bytes());
        input
    }

    #[tokio::test]
    async fn relays_one_exchange_end_to_end() {
        let input = tunnel_input(
            "GET / HTTP/1.1\r\nHost: example.com\r\nproxy-protocol: https\r\nproxy-tls: abcd1234\r\nAccept: */*\r\n\r\n",
        );
        let (outcome, factory) = drive(FakeFactory::default(), &input).await;

        outcome.result.unwrap();
        let mut expected = b"HTTP/1.1 200 OK\r\n\r\n".to_vec();
        expected.extend_from_slice(UPSTREAM);
        assert_eq!(String::from_utf8(outcome.output).unwrap(), String::from_utf8(expected).unwrap());

        let dispatched = factory.dispatched();
        assert_eq!(dispatched.len(), 1);
        let (fingerprint, request) = &dispatched[0];
        assert_eq!(fingerprint, "abcd1234");
        assert_eq!(request.url.as_str(), "https://example.com/");
        assert!(!request.headers.contains_key(PROXY_PROTOCOL));
        assert!(!request.headers.contains_key(PROXY_TLS));
        assert_eq!(request.headers["accept"], "*/*");

        assert_eq!(outcome.shutdowns, 1);
        assert_eq!(outcome.drops, 1);
    }

    #[tokio::test]
    async fn non_connect_is_rejected_without_hijack() {
        let (outcome, factory) = drive(FakeFactory::default(), b"GET http://x/ HTTP/1.1\r\nHost: x\r\n\r\n").await;

        assert!(matches!(outcome.result, Err(TunnelError::MalformedTunnelRequest(_))));
        assert_eq!(outcome.output, error_response(StatusCode::BAD_REQUEST, "Bad Request\n"));
        assert!(factory.dispatched().is_empty());
        assert_eq!(outcome.drops, 1);
    }

    #[tokio::test]
    async fn http2_connect_is_unsupported() {
        let (outcome, factory) = drive(FakeFactory::default(), b"CONNECT example.com:443 HTTP/2.0\r\n\r\n").await;

        assert!(matches!(outcome.result, Err(TunnelError::UnsupportedProtocolVersion(_))));
        assert_eq!(
            outcome.output,
            error_response(StatusCode::BAD_REQUEST, "Unsupported protocol version.")
        );
        assert!(factory.dispatched().is_empty());
    }

    #[tokio::test]
    async fn garbled_outer_request_is_bad_request() {
        let (outcome, _) = drive(FakeFactory::default(), b"NOT A REQUEST LINE AT ALL\r\n\r\n").await;
        assert!(matches!(outcome.result, Err(TunnelError::MalformedTunnelRequest(_))));
        assert_eq!(outcome.output, error_response(StatusCode::BAD_REQUEST, "Bad Request\n"));
    }

    #[tokio::test]
    async fn ack_follows_request_version() {
        let mut input = b"CONNECT example.com:443 HTTP/1.0\r\n\r\n".to_vec();
        input.extend_from_slice(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");
        let (outcome, _) = drive(FakeFactory::default(), &input).await;
        outcome.result.unwrap();
        assert!(outcome.output.starts_with(b"HTTP/1.0 200 OK\r\n\r\nHTTP/1.1 200 OK\r\n"));
    }

    #[tokio::test]
    async fn unparseable_inner_request_is_server_read_error() {
        let (outcome, factory) = drive(FakeFactory::default(), &tunnel_input("garbage\r\n\r\n")).await;

        assert!(matches!(outcome.result, Err(TunnelError::InnerRequestParseFailure(_))));
        let mut expected = b"HTTP/1.1 200 OK\r\n\r\n".to_vec();
        expected.extend_from_slice(&error_response(StatusCode::INTERNAL_SERVER_ERROR, "Server Read Error\n"));
        assert_eq!(outcome.output, expected);
        assert!(factory.dispatched().is_empty());
        assert_eq!(outcome.shutdowns, 1);
        assert_eq!(outcome.drops, 1);
    }

    #[tokio::test]
    async fn client_closing_inside_tunnel_is_read_error() {
        let (outcome, factory) = drive(FakeFactory::default(), &tunnel_input("")).await;
        assert!(matches!(outcome.result, Err(TunnelError::InnerRequestParseFailure(_))));
        assert!(factory.dispatched().is_empty());
    }

    #[tokio::test]
    async fn dispatch_failure_is_server_request_error() {
        let input = tunnel_input("GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");
        let (outcome, factory) = drive(FakeFactory::failing(), &input).await;

        assert!(matches!(outcome.result, Err(TunnelError::OutboundDispatchFailure(_))));
        let mut expected = b"HTTP/1.1 200 OK\r\n\r\n".to_vec();
        expected.extend_from_slice(&error_response(StatusCode::INTERNAL_SERVER_ERROR, "Server Request Error\n"));
        assert_eq!(outcome.output, expected);
        assert_eq!(factory.dispatched().len(), 1);
        assert_eq!(outcome.shutdowns, 1);
        assert_eq!(outcome.drops, 1);
    }

    #[tokio::test]
    async fn chunked_inner_body_is_forwarded_with_its_decoded_length() {
        let input = tunnel_input(
            "POST /x HTTP/1.1\r\nHost: example.com\r\nContent-Length: 100\r\nTransfer-Encoding: chunked\r\n\r\n\
             5\r\nhello\r\n0\r\n\r\n",
        );
        let (outcome, factory) = drive(FakeFactory::default(), &input).await;
        outcome.result.unwrap();

        let dispatched = factory.dispatched();
        let request = &dispatched[0].1;
        assert_eq!(&request.body[..], b"hello");
        assert_eq!(request.headers["content-length"], "5");
        assert!(!request.headers.contains_key("transfer-encoding"));
    }

    #[tokio::test]
    async fn scheme_directive_defaults_to_https() {
        for directive in ["", "proxy-protocol: gopher\r\n"] {
            let input = tunnel_input(&format!("GET /p HTTP/1.1\r\nHost: example.com\r\n{directive}\r\n"));
            let (outcome, factory) = drive(FakeFactory::default(), &input).await;
            outcome.result.unwrap();

            let dispatched = factory.dispatched();
            let (fingerprint, request) = &dispatched[0];
            assert_eq!(request.url.as_str(), "https://example.com/p", "{directive:?}");
            assert!(fingerprint.is_empty());
        }
    }

    #[tokio::test]
    async fn http_directive_is_honoured() {
        let input = tunnel_input("GET /p HTTP/1.1\r\nproxy-protocol: http\r\n\r\n");
        let (outcome, factory) = drive(FakeFactory::default(), &input).await;
        outcome.result.unwrap();
        assert_eq!(factory.dispatched()[0].1.url.as_str(), "http://example.com:443/p");
    }

    #[tokio::test]
    async fn idle_connection_is_not_an_error() {
        let (outcome, factory) = drive(FakeFactory::default(), b"").await;
        outcome.result.unwrap();
        assert!(outcome.output.is_empty());
        assert!(factory.dispatched().is_empty());
    }

    #[test]
    fn state_names() {
        assert_eq!(TunnelState::Failed.to_string(), "failed");
        assert_eq!(TunnelState::InnerRequestParsed.to_string(), "inner_request_parsed");
    }
}
