//! Fingerprinting CONNECT tunnel proxy.
//!
//! Accepts `CONNECT` requests, acknowledges the tunnel, then reads one more
//! HTTP request from inside it. That inner request is sent to its real
//! destination through a transport whose TLS ClientHello follows the
//! fingerprint named in its `proxy-tls` header, and the origin's response is
//! written back over the tunnel before it is closed.
//!
//! # Architecture Overview
//!
//! ```text
//!                  ┌────────────────────────────────────────────────────────┐
//!                  │                     TUNNEL PROXY                       │
//!                  │                                                        │
//!  CONNECT ────────┼─▶ net::listener ─▶ http::server ─▶ tunnel::validator   │
//!                  │                                          │             │
//!                  │                                          ▼             │
//!  200 OK ◀────────┼──────────────────────────────── tunnel::establish      │
//!                  │                                          │             │
//!  inner request ──┼─▶ tunnel::inner ─▶ security::headers ────┤             │
//!                  │                                          ▼             │
//!                  │                         transport::cache ─▶ client ────┼──▶ Origin
//!                  │                                                  │     │
//!  response ◀──────┼──────────────────────────── tunnel::relay ◀──────┘     │
//!                  │                                                        │
//!                  │  config · observability · lifecycle · resilience       │
//!                  └────────────────────────────────────────────────────────┘
//! ```

// Core subsystems
pub mod config;
pub mod http;
pub mod net;
pub mod transport;
pub mod tunnel;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod resilience;
pub mod security;

pub use crate::config::schema::ProxyConfig;
pub use crate::http::TunnelServer;
pub use crate::lifecycle::Shutdown;
pub use crate::tunnel::{serve_connection, TunnelContext, TunnelError};
