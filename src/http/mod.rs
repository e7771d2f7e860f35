//! Inbound HTTP/1.x runtime.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (accept loop, per-connection task and span)
//!     → codec.rs (request head framing, inner request bodies)
//!     → request.rs (InboundRequest: method, target, version, headers)
//!     → [tunnel state machine]
//!     → response.rs (error replies, or hijack of the raw socket)
//! ```
//!
//! # Design Decisions
//! - Hand-rolled head reader instead of a full server stack: the tunnel needs
//!   the raw socket, the exact acknowledgement bytes and any HTTP/x.y version
//! - Header lines are parsed with `httparse`

pub mod codec;
pub mod request;
pub mod response;
pub mod server;

pub use request::InboundRequest;
pub use response::ResponseWriter;
pub use server::TunnelServer;
