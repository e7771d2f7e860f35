//! Fingerprinted outbound HTTP client.
//!
//! Every exchange opens a fresh TCP connection (wrapped in TLS for `https`),
//! sends one HTTP/1.1 request and hands back the response with its body still
//! streaming. Connect, handshake, request and body share one deadline.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{self, HeaderValue};
use http::Request;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::Builder;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use url::{Host, Url};

use super::{BoxError, DispatchError, OutboundResponse, RoundTrip};
use crate::resilience::timeouts::{Deadline, TimedOut};
use crate::tunnel::inner::InnerRequest;

/// An outbound transport bound to one TLS profile.
#[derive(Debug)]
pub struct FingerprintedTransport {
    tls: Arc<ClientConfig>,
    client_signature: HeaderValue,
    timeout: Duration,
}

impl FingerprintedTransport {
    pub fn new(tls: Arc<ClientConfig>, client_signature: HeaderValue, timeout: Duration) -> Self {
        Self {
            tls,
            client_signature,
            timeout,
        }
    }

    async fn send(&self, request: InnerRequest, deadline: Deadline) -> Result<OutboundResponse, DispatchError> {
        let scheme = request.url.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(DispatchError::UnsupportedScheme(scheme.to_string()));
        }
        let host = request.url.host().ok_or(DispatchError::MissingHost)?.to_owned();
        let port = request
            .url
            .port_or_known_default()
            .ok_or_else(|| DispatchError::UnsupportedScheme(scheme.to_string()))?;

        let addr = format!("{host}:{port}");
        let tcp = TcpStream::connect(addr.as_str())
            .await
            .map_err(|source| DispatchError::Connect { addr, source })?;
        if let Err(e) = tcp.set_nodelay(true) {
            tracing::debug!(error = %e, "Failed to set TCP_NODELAY on upstream socket");
        }

        if scheme == "http" {
            return self.exchange(tcp, request, deadline).await;
        }

        let server_name = match &host {
            Host::Domain(domain) => ServerName::try_from(domain.clone())
                .map_err(|_| DispatchError::ServerName(domain.clone()))?,
            Host::Ipv4(ip) => ServerName::from(IpAddr::V4(*ip)),
            Host::Ipv6(ip) => ServerName::from(IpAddr::V6(*ip)),
        };
        let tls = TlsConnector::from(self.tls.clone())
            .connect(server_name, tcp)
            .await
            .map_err(|source| DispatchError::Tls {
                host: host.to_string(),
                source,
            })?;
        self.exchange(tls, request, deadline).await
    }

    async fn exchange<T>(
        &self,
        io: T,
        request: InnerRequest,
        deadline: Deadline,
    ) -> Result<OutboundResponse, DispatchError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sender, conn) = Builder::new()
            .title_case_headers(true)
            .handshake(TokioIo::new(io))
            .await?;

        // The connection task never outlives the exchange deadline.
        tokio::spawn(async move {
            match deadline.run(conn).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(error = %e, "Upstream connection error"),
                Err(e) => tracing::debug!(error = %e, "Upstream connection dropped at deadline"),
            }
        });

        let response = sender.send_request(self.outbound_request(request)?).await?;
        let (parts, body) = response.into_parts();
        let reason = parts
            .extensions
            .get::<hyper::ext::ReasonPhrase>()
            .and_then(|reason| std::str::from_utf8(reason.as_bytes()).ok())
            .map(str::to_string);

        Ok(OutboundResponse {
            version: parts.version,
            status: parts.status,
            reason,
            headers: parts.headers,
            body: body.map_err(|e| Box::new(e) as BoxError).boxed(),
            deadline,
        })
    }

    fn outbound_request(&self, request: InnerRequest) -> Result<Request<Full<Bytes>>, DispatchError> {
        let InnerRequest {
            method,
            url,
            mut headers,
            body,
            ..
        } = request;

        if !headers.contains_key(header::HOST) {
            headers.insert(header::HOST, authority(&url)?);
        }
        headers
            .entry(header::USER_AGENT)
            .or_insert_with(|| self.client_signature.clone());

        let mut outbound = Request::builder()
            .method(method)
            .uri(origin_form(&url))
            .body(Full::new(body))?;
        *outbound.headers_mut() = headers;
        Ok(outbound)
    }
}

impl RoundTrip for FingerprintedTransport {
    async fn round_trip(&self, request: InnerRequest) -> Result<OutboundResponse, DispatchError> {
        let deadline = Deadline::after(self.timeout);
        deadline
            .run(self.send(request, deadline))
            .await
            .map_err(|TimedOut(budget)| DispatchError::Timeout(budget))?
    }
}

/// `Host` header value for `url`; the port is kept only when it is not the scheme default.
fn authority(url: &Url) -> Result<HeaderValue, DispatchError> {
    let host = url.host_str().ok_or(DispatchError::MissingHost)?;
    let value = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    HeaderValue::from_str(&value).map_err(|e| DispatchError::Request(e.into()))
}

fn origin_form(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}
