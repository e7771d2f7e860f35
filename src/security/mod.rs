//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Inbound / inner request:
//!     → limits.rs (cap head size, header count, body size while reading)
//!     → headers.rs (strip directives and hop-by-hop headers)
//!     → Pass to the outbound transport
//! ```
//!
//! # Design Decisions
//! - Fail closed: a request over any limit is rejected, never truncated
//! - Directive headers never reach an origin

pub mod headers;
pub mod limits;
