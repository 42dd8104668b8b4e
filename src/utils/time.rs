//! Time utilities
//!
//! Provides safe time operations that handle errors gracefully.

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Get current Unix timestamp (seconds since epoch)
///
/// Returns 0 if system time is before epoch.
pub fn current_timestamp() -> u64 {
    current_timestamp_duration().as_secs()
}

/// Get current Unix timestamp in milliseconds
pub fn current_timestamp_millis() -> u64 {
    current_timestamp_duration().as_millis() as u64
}

/// Get current Unix timestamp as Duration
///
/// Returns zero duration if system time is before epoch.
pub fn current_timestamp_duration() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| {
            warn!("System time is before UNIX epoch, using zero duration");
            Duration::from_secs(0)
        })
}
