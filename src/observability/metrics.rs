//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_tunnels_total` (counter): finished tunnels by outcome
//! - `proxy_active_connections` (gauge): current connection count
//! - `proxy_upstream_requests_total` (counter): dispatches by upstream status
//!   (`error` when no response arrived)
//! - `proxy_upstream_duration_seconds` (histogram): time to response head
//! - `proxy_transport_cache_size` (gauge): cached fingerprinted transports
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op, so tests need no setup
//! - Prometheus exposition is opt-in (`observability.metrics_enabled`)

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and its scrape endpoint on `addr`.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_tunnel(outcome: &'static str) {
    counter!("proxy_tunnels_total", "outcome" => outcome).increment(1);
}

pub fn record_active_connections(count: u64) {
    gauge!("proxy_active_connections").set(count as f64);
}

/// Record one outbound dispatch; `status` is `None` when it failed.
pub fn record_upstream(status: Option<u16>, elapsed: Duration) {
    let status = status.map_or_else(|| "error".to_string(), |s| s.to_string());
    counter!("proxy_upstream_requests_total", "status" => status).increment(1);
    histogram!("proxy_upstream_duration_seconds").record(elapsed.as_secs_f64());
}

pub fn record_transport_cache_size(size: usize) {
    gauge!("proxy_transport_cache_size").set(size as f64);
}
