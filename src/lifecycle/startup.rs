//! Startup orchestration.
//!
//! # Responsibilities
//! - Initialize subsystems in dependency order
//! - Bind the listener and begin accepting traffic
//! - Drain open tunnels on shutdown, bounded by the grace period
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Subsystems initialize in order, not concurrently
//! - Listeners start last (traffic only when ready)
//! - Logging is installed by the binary before this runs, so startup
//!   failures are logged too

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;

use super::shutdown::Shutdown;
use super::signals;
use crate::config::ProxyConfig;
use crate::http::server::TunnelServer;
use crate::net::connection::ConnectionTracker;
use crate::net::listener::{Listener, ListenerError};
use crate::observability::metrics;
use crate::security::limits::RequestLimits;
use crate::transport::cache::CacheError;
use crate::transport::TransportCache;
use crate::tunnel::TunnelContext;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid metrics address '{0}'")]
    MetricsAddress(String),
    #[error("failed to start metrics exporter: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),
    #[error("failed to prepare upstream transports: {0}")]
    Transports(#[from] CacheError),
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error("server task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// A proxy that is bound and accepting connections.
pub struct RunningProxy {
    local_addr: SocketAddr,
    shutdown: Shutdown,
    tracker: ConnectionTracker,
    grace: Duration,
    server: JoinHandle<Result<(), ListenerError>>,
}

impl RunningProxy {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle that stops the accept loop when triggered.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn active_connections(&self) -> u64 {
        self.tracker.active_count()
    }

    /// Wait for the accept loop to stop, then drain open tunnels.
    pub async fn wait(self) -> Result<(), StartupError> {
        self.server.await??;

        if self.tracker.drain(self.grace).await {
            tracing::info!("All tunnels closed");
        } else {
            tracing::warn!(
                remaining = self.tracker.active_count(),
                grace_secs = self.grace.as_secs(),
                "Shutdown grace period elapsed with tunnels still open"
            );
        }
        Ok(())
    }
}

/// Bind and start serving `config`, without signal handling or metrics.
pub async fn start(config: &ProxyConfig) -> Result<RunningProxy, StartupError> {
    let transports = TransportCache::from_config(config)?;
    let context = Arc::new(TunnelContext::new(transports, RequestLimits::from(&config.limits)));

    let listener = Listener::bind(&config.listener).await?;
    let local_addr = listener.local_addr().map_err(ListenerError::Bind)?;

    let shutdown = Shutdown::new();
    let server = TunnelServer::new(listener, context);
    let tracker = server.tracker();
    let server = tokio::spawn(server.run(shutdown.subscribe()));

    Ok(RunningProxy {
        local_addr,
        shutdown,
        tracker,
        grace: config.timeouts.shutdown_grace(),
        server,
    })
}

/// Run the proxy until a termination signal arrives and tunnels have drained.
pub async fn run(config: ProxyConfig) -> Result<(), StartupError> {
    if config.observability.metrics_enabled {
        let addr = config
            .observability
            .metrics_address
            .parse()
            .map_err(|_| StartupError::MetricsAddress(config.observability.metrics_address.clone()))?;
        metrics::init_metrics(addr)?;
    }

    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        request_timeout_secs = config.timeouts.request_secs,
        "Configuration loaded"
    );

    let proxy = start(&config).await?;
    tracing::info!(address = %proxy.local_addr(), "Listening for tunnels");

    signals::spawn_signal_handler(proxy.shutdown_handle());
    proxy.wait().await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
