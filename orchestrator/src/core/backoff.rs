//! Exponential backoff with multiplicative jitter.

use std::time::Duration;

use crate::core::types::RetryPolicy;

/// Delay bound before jitter: `min(cap, base * 2^attempt)` seconds.
///
/// `attempt` is zero-based: the first retry waits roughly `base`.
pub fn backoff_ceiling(policy: &RetryPolicy, attempt: u32) -> f64 {
    let exp = 2f64.powi(attempt.min(62) as i32);
    (policy.backoff_base_secs * exp).min(policy.backoff_cap_secs)
}

/// Jittered delay. `jitter` is a factor drawn from `[0.5, 1.5)`.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32, jitter: f64) -> Duration {
    let secs = backoff_ceiling(policy, attempt) * jitter.clamp(0.5, 1.5);
    Duration::from_secs_f64(secs.max(0.0))
}
