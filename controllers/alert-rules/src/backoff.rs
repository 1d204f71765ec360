//! # Exponential Backoff
//!
//! Per-key retry delays for the work queue. A failing key is re-delivered
//! after `base * 2^(attempt-1)`, capped at a maximum, so a persistently
//! broken workload backs off quickly without starving the rest of the queue.

use std::time::Duration;

/// Delay before the first retry.
pub const BASE_DELAY: Duration = Duration::from_millis(500);

/// Upper bound on any single retry delay.
pub const MAX_DELAY: Duration = Duration::from_secs(60);

/// Backoff duration for a given retry attempt (1-indexed).
///
/// Attempt 1 waits `base`; each further attempt doubles, capped at `max`.
/// Large attempt counts saturate instead of overflowing.
#[must_use]
pub fn delay_for_attempt(attempt: u32, base: Duration, max: Duration) -> Duration {
    if attempt <= 1 {
        return base.min(max);
    }
    let doublings = attempt - 1;
    let factor = 2u32.saturating_pow(doublings);
    base.saturating_mul(factor).min(max)
}
