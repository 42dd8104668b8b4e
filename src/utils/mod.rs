//! Utility modules for logging, fault tolerance and bounded storage

pub mod env;
pub mod logging;
pub mod retry;
pub mod ring;
pub mod time;
pub mod timeout;

// Re-export commonly used items
pub use env::{env_bool, env_list, env_opt};
pub use logging::{init_logging, init_logging_from_config, resolve_filter};
#[cfg(feature = "json-logging")]
pub use logging::init_json_logging;
pub use retry::{retry_if_retryable, IsRetryable, RetryConfig};
pub use ring::RingBuffer;
pub use time::{current_timestamp, current_timestamp_duration, current_timestamp_millis};
pub use timeout::{with_custom_timeout, DEFAULT_LOAD_TIMEOUT, DEFAULT_SAMPLE_TIMEOUT};
