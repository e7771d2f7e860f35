//! Timeout enforcement.
//!
//! # Responsibilities
//! - Give every outbound exchange one total deadline
//! - Share that deadline between dispatch and response body reading
//! - Cancel operations cleanly on expiry
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities
//! - Timeout errors are distinct from other errors
//! - A deadline is an absolute instant, so later phases only get what is left

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

/// The deadline passed before the operation finished.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("deadline of {0:?} exceeded")]
pub struct TimedOut(pub Duration);

/// A total time budget fixed at creation.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    /// A deadline `budget` from now.
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    /// Run `fut` until it completes or the deadline passes.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, TimedOut> {
        tokio::time::timeout_at(self.at, fut)
            .await
            .map_err(|_| TimedOut(self.budget))
    }
}
