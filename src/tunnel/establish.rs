//! Socket takeover and tunnel acknowledgement.
//!
//! # Responsibilities
//! - Hijack the raw socket (and its already-buffered bytes) from the inbound runtime
//! - Acknowledge the tunnel with `HTTP/<major>.<minor> 200 OK`
//! - Own the socket until it is released, exactly once
//!
//! # Design Decisions
//! - `RawTunnel` owns the stream by value; dropping it closes the socket, so
//!   early returns and unwinding release it too
//! - `close` is the graceful path (write-side shutdown first); it consumes the
//!   tunnel, so a second release cannot be written

use bytes::BytesMut;
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::error::TunnelError;
use crate::http::codec::ProtocolVersion;
use crate::http::response::{write_raw_error, HijackRejected, ResponseWriter};

/// The raw client socket after hijack.
#[derive(Debug)]
pub struct RawTunnel<S> {
    io: S,
    buffered: BytesMut,
    closed: bool,
}

impl<S> RawTunnel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Take the socket away from `writer`.
    ///
    /// If the runtime refuses, a 500 goes out through the writer, which is
    /// still usable at that point.
    pub async fn hijack(writer: ResponseWriter<S>) -> Result<Self, TunnelError> {
        match writer.hijack() {
            Ok((io, buffered)) => Ok(Self {
                io,
                buffered,
                closed: false,
            }),
            Err(HijackRejected { error, mut writer }) => {
                let err = TunnelError::HijackFailure(error);
                if let Some(body) = err.client_message() {
                    if let Err(e) = writer.error(err.status(), body).await {
                        tracing::debug!(error = %e, "Failed to report hijack failure");
                    }
                }
                Err(err)
            }
        }
    }

    /// Tell the client the tunnel is up.
    pub async fn acknowledge(&mut self, version: ProtocolVersion) -> Result<(), TunnelError> {
        let ack = format!("{version} 200 OK\r\n\r\n");
        self.write(ack.as_bytes()).await
    }

    /// The socket together with bytes read from it but not yet consumed.
    pub fn reader(&mut self) -> (&mut S, &mut BytesMut) {
        (&mut self.io, &mut self.buffered)
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), TunnelError> {
        async {
            self.io.write_all(bytes).await?;
            self.io.flush().await
        }
        .await
        .map_err(TunnelError::ResponseWriteFailure)
    }

    /// Best-effort error reply; failures are only logged.
    pub async fn report(&mut self, status: StatusCode, body: &str) {
        write_raw_error(&mut self.io, status, body).await;
    }

    /// Shut the socket down and release it.
    pub async fn close(mut self) {
        self.closed = true;
        if let Err(e) = self.io.shutdown().await {
            tracing::debug!(error = %e, "Tunnel shutdown failed");
        }
    }
}

impl<S> Drop for RawTunnel<S> {
    fn drop(&mut self) {
        if !self.closed {
            tracing::debug!("Tunnel released without graceful shutdown");
        }
    }
}
