//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Outbound exchange:
//!     → timeouts.rs (one total deadline: connect, TLS, response head, body)
//!     → On expiry: the tunnel fails, no retry
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every outbound exchange has a deadline
//! - No retries: a tunnel carries exactly one exchange, failures are terminal

pub mod timeouts;
