//! Bounded retry policy for outgoing sends.
//!
//! The client wraps digest uploads in this policy; a closed-peer failure
//! triggers a re-dial before the next attempt, any other failure just waits
//! out the delay.

use std::time::Duration;

use crate::constants::{RETRY_ATTEMPTS, RETRY_DELAY};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum attempts before giving up.
    pub attempts: u32,
    /// Pause between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: RETRY_ATTEMPTS,
            delay: RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    pub const fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// Whether `attempt` (1-indexed) leaves budget for another try.
    pub fn has_next(&self, attempt: u32) -> bool {
        attempt < self.attempts
    }
}
