//! Response writing and connection hijacking.
//!
//! # Responsibilities
//! - Write complete plain-text error responses on the structured path
//! - Hand the raw connection over to a tunnel exactly once (hijack)
//! - Write best-effort error responses onto an already hijacked socket
//!
//! # Design Decisions
//! - `hijack` consumes the writer, so a second hijack cannot be expressed
//! - Error responses always close the connection (no keep-alive)
//! - Bodies are written verbatim; callers choose trailing newlines

use bytes::BytesMut;
use http::StatusCode;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Why a hijack was refused.
#[derive(Debug, Error)]
pub enum HijackError {
    #[error("response already started on this connection")]
    ResponseStarted,
}

/// A refused hijack; the writer is handed back so the caller can still answer.
#[derive(Debug)]
pub struct HijackRejected<S> {
    pub error: HijackError,
    pub writer: ResponseWriter<S>,
}

/// Structured response path for one inbound connection.
///
/// Owns the connection until either a response is written or the connection
/// is hijacked.
#[derive(Debug)]
pub struct ResponseWriter<S> {
    io: S,
    buffered: BytesMut,
    started: bool,
}

impl<S> ResponseWriter<S>
where
    S: AsyncWrite + Unpin,
{
    /// Wrap a connection together with bytes already read from it.
    pub fn new(io: S, buffered: BytesMut) -> Self {
        Self {
            io,
            buffered,
            started: false,
        }
    }

    /// Reply with a plain-text error and mark the response as started.
    pub async fn error(&mut self, status: StatusCode, body: &str) -> std::io::Result<()> {
        self.started = true;
        self.io.write_all(&error_response(status, body)).await?;
        self.io.flush().await
    }

    /// Close the write half once the response is out.
    pub async fn finish(mut self) -> std::io::Result<()> {
        self.io.shutdown().await
    }

    /// Take exclusive ownership of the raw connection and the buffered bytes.
    pub fn hijack(self) -> Result<(S, BytesMut), HijackRejected<S>> {
        if self.started {
            return Err(HijackRejected {
                error: HijackError::ResponseStarted,
                writer: self,
            });
        }
        Ok((self.io, self.buffered))
    }
}

/// Encode a minimal, complete plain-text error response.
pub fn error_response(status: StatusCode, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         X-Content-Type-Options: nosniff\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        body.len(),
        body
    )
    .into_bytes()
}

/// Best-effort error reply on a hijacked socket.
///
/// Failures are logged and swallowed; the caller closes the socket either way.
pub async fn write_raw_error<W>(io: &mut W, status: StatusCode, body: &str)
where
    W: AsyncWrite + Unpin,
{
    let result = async {
        io.write_all(&error_response(status, body)).await?;
        io.flush().await
    }
    .await;

    if let Err(e) = result {
        tracing::debug!(error = %e, status = %status, "Failed to write error onto tunnel");
    }
}
