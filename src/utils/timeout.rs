//! Timeout utilities
//!
//! Default timeouts for the operations that can hang on external input:
//! - Module load (file reads, decode, init hooks): 30 seconds
//! - Metrics probe sample: 5 seconds
//!
//! Configured values from [`crate::config::RuntimeConfig`] are passed to
//! [`with_custom_timeout`].

use std::time::Duration;
use tokio::time::timeout;

/// Default timeout for a full module load including its dependency closure
pub const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for a single metrics probe sample
pub const DEFAULT_SAMPLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Execute operation with custom timeout
pub async fn with_custom_timeout<F, T>(
    operation: F,
    duration: Duration,
) -> Result<T, tokio::time::error::Elapsed>
where
    F: std::future::Future<Output = T>,
{
    timeout(duration, operation).await
}
