//! Bounded exponential backoff for recognition reconnection

use std::time::{Duration, SystemTime};

/// Reconnection policy for the recognition channel
///
/// Controls how many times a failed channel is reopened and how long to
/// wait between attempts using exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of reconnection attempts before surfacing the failure
    pub max_retries: u32,
    /// Base delay between attempts (doubles each attempt)
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `attempt` failures
    #[must_use]
    pub const fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Compute the delay before the next reconnection attempt.
///
/// The delay follows exponential backoff:
/// `min(base_delay * 2^attempt + jitter, max_delay)`.
///
/// Jitter is 0-25% of the computed delay, derived from `SystemTime` to avoid
/// pulling in a full random number generator.
#[must_use]
pub fn delay_for_attempt(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt));
    let base = base.min(policy.max_delay);

    let jitter_nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();

    let jitter_fraction = f64::from(jitter_nanos % 250) / 1000.0;
    let jitter = base.mul_f64(jitter_fraction);

    (base + jitter).min(policy.max_delay)
}
