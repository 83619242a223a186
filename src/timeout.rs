//! Timeout resolution
//!
//! Timeouts are two-tier: a session carries read/write defaults, and a
//! request may carry a single `timeoutInterval` that overrides both for that
//! call only. Resolution is pure; nothing is written back to the session.

use std::time::Duration;

/// Default read/write timeout, in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Effective timeouts for a request.
///
/// The connect timeout is implicitly the read timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    /// Read (and connect) timeout
    pub read: Duration,
    /// Write timeout
    pub write: Duration,
}

impl TimeoutPolicy {
    /// Build a policy from millisecond values
    pub fn from_millis(read_ms: u64, write_ms: u64) -> Self {
        Self {
            read: Duration::from_millis(read_ms),
            write: Duration::from_millis(write_ms),
        }
    }

    /// Resolve the effective policy for one request.
    ///
    /// A per-request interval overrides both read and write; otherwise the
    /// session defaults apply unchanged.
    pub fn resolve(request_interval_ms: Option<u64>, session: TimeoutPolicy) -> Self {
        match request_interval_ms {
            Some(ms) => Self::from_millis(ms, ms),
            None => session,
        }
    }

    /// Upper bound covering both directions, used for the whole-request timer
    pub fn total(&self) -> Duration {
        self.read.max(self.write)
    }
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self::from_millis(DEFAULT_TIMEOUT_MS, DEFAULT_TIMEOUT_MS)
    }
}
