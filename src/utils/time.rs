//! Epoch-second helpers used for packet timestamps and expiry.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current unix time in whole seconds. A clock set before the epoch reads as
/// zero.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// How long until `deadline` (epoch seconds) is reached, zero if it has passed.
pub fn until(deadline: u64) -> Duration {
    Duration::from_secs(deadline.saturating_sub(now_secs()))
}
