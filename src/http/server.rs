//! Inbound tunnel server.
//!
//! # Responsibilities
//! - Run the accept loop until shutdown is signalled
//! - Spawn one task per connection, inside a span carrying its identity
//! - Hold the connection permit and drain guard for the task's lifetime
//!
//! # Design Decisions
//! - The server owns no protocol logic; each task runs `tunnel::serve_connection`
//! - Stopping the accept loop does not touch open tunnels; the caller drains
//!   them through the tracker

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::Instrument;

use crate::net::connection::ConnectionTracker;
use crate::net::listener::{ConnectionPermit, Listener, ListenerError};
use crate::transport::TransportFactory;
use crate::tunnel::{self, TunnelContext};

/// Pause after a failed accept, so a persistent error (e.g. EMFILE) does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

pub struct TunnelServer<F> {
    listener: Listener,
    context: Arc<TunnelContext<F>>,
    tracker: ConnectionTracker,
}

impl<F: TransportFactory> TunnelServer<F> {
    pub fn new(listener: Listener, context: Arc<TunnelContext<F>>) -> Self {
        Self {
            listener,
            context,
            tracker: ConnectionTracker::new(),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    /// Handle for draining connections after `run` returns.
    pub fn tracker(&self) -> ConnectionTracker {
        self.tracker.clone()
    }

    /// Accept connections until `shutdown` fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ListenerError> {
        tracing::info!(address = ?self.local_addr().ok(), "Tunnel server starting");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(active_connections = self.tracker.active_count(), "Stopped accepting connections");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote_addr, permit)) => self.spawn_connection(stream, remote_addr, permit),
                    Err(ListenerError::Accept(e)) => {
                        tracing::warn!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                    Err(e) => return Err(e),
                },
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, remote_addr: SocketAddr, permit: ConnectionPermit) {
        let guard = self.tracker.track();
        let context = Arc::clone(&self.context);
        let span = tracing::info_span!(
            "connection",
            connection_id = %guard.id(),
            remote_addr = %remote_addr,
            state = tracing::field::Empty,
        );

        tokio::spawn(
            async move {
                let _permit = permit;
                let _guard = guard;
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
                }
                // Failures are logged by the tunnel itself.
                let _ = tunnel::serve_connection(stream, remote_addr, &context).await;
            }
            .instrument(span),
        );
    }
}
