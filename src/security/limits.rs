//! Request and connection limits.
//!
//! # Responsibilities
//! - Enforce maximum request head size
//! - Enforce maximum header count
//! - Enforce maximum inner request body size
//!
//! # Design Decisions
//! - Limits checked while reading (early rejection, nothing buffered past the cap)
//! - The same limits apply to the outer CONNECT head and the inner request head

use crate::config::LimitsConfig;

/// Read-side limits applied by the head and body readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestLimits {
    pub max_head_bytes: usize,
    pub max_headers: usize,
    pub max_body_bytes: usize,
}

impl RequestLimits {
    /// Whether a head of `len` buffered bytes is still allowed to grow.
    pub fn head_fits(&self, len: usize) -> bool {
        len <= self.max_head_bytes
    }

    /// Whether a body of `len` bytes is acceptable.
    pub fn body_fits(&self, len: usize) -> bool {
        len <= self.max_body_bytes
    }
}

impl From<&LimitsConfig> for RequestLimits {
    fn from(config: &LimitsConfig) -> Self {
        Self {
            max_head_bytes: config.max_head_bytes,
            max_headers: config.max_headers,
            max_body_bytes: config.max_body_bytes,
        }
    }
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self::from(&LimitsConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_are_inclusive() {
        let limits = RequestLimits {
            max_head_bytes: 10,
            max_headers: 2,
            max_body_bytes: 5,
        };
        assert!(limits.head_fits(10));
        assert!(!limits.head_fits(11));
        assert!(limits.body_fits(5));
        assert!(!limits.body_fits(6));
    }
}
