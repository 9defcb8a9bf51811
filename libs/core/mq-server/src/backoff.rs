//! Reconnect backoff for the control loop.
//!
//! After `n` consecutive subscription failures the loop waits a random delay
//! in `[n³, (n+1)³]` milliseconds, capped at [`MAX_BACKOFF`].

use rand::Rng;
use std::time::Duration;

pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Lower and upper bound in milliseconds for `continuous_errors`, before the cap
pub fn backoff_bounds_ms(continuous_errors: u32) -> (u64, u64) {
    if continuous_errors == 0 {
        return (0, 0);
    }
    let n = u64::from(continuous_errors);
    (n.saturating_pow(3), (n + 1).saturating_pow(3))
}

pub fn backoff_delay(continuous_errors: u32) -> Duration {
    backoff_delay_capped(continuous_errors, MAX_BACKOFF)
}

pub fn backoff_delay_capped(continuous_errors: u32, max: Duration) -> Duration {
    let (low, high) = backoff_bounds_ms(continuous_errors);
    if high == 0 {
        return Duration::ZERO;
    }

    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    let low = low.min(max_ms);
    let high = high.min(max_ms);

    Duration::from_millis(rand::rng().random_range(low..=high))
}
