//! Logging utilities for the loader and its embedders
//!
//! Provides simple logging initialization that:
//! - Respects RUST_LOG environment variable
//! - Allows configuration via the `[logging]` config section
//! - Supports JSON output behind the `json-logging` feature
//!
//! # Usage
//! ```rust,no_run
//! use native_loader::utils::init_logging;
//!
//! init_logging(None); // Uses RUST_LOG or defaults to "info"
//! ```

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Default filter when neither RUST_LOG nor the config supplies one
pub const DEFAULT_FILTER: &str = "info";

/// Build the effective filter. RUST_LOG always takes precedence over the
/// configured filter, which takes precedence over [`DEFAULT_FILTER`].
pub fn resolve_filter(filter: Option<&str>) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }
    EnvFilter::new(filter.unwrap_or(DEFAULT_FILTER))
}

/// Initialize human-readable logging on stderr.
///
/// Returns `false` when a global subscriber was already installed (tests,
/// embedding applications), in which case the existing one is kept.
pub fn init_logging(filter: Option<&str>) -> bool {
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_ansi(std::env::var("NO_COLOR").is_err()),
        )
        .with(resolve_filter(filter))
        .try_init()
        .is_ok()
}

/// Initialize logging with JSON output for log aggregation systems
#[cfg(feature = "json-logging")]
pub fn init_json_logging(filter: Option<&str>) -> bool {
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(true)
                .with_span_list(true),
        )
        .with(resolve_filter(filter))
        .try_init()
        .is_ok()
}

/// Initialize logging from the `[logging]` config section.
pub fn init_logging_from_config(config: &LoggingConfig) -> bool {
    let filter = config.filter.as_deref();

    if config.json_format {
        #[cfg(feature = "json-logging")]
        {
            return init_json_logging(filter);
        }
        #[cfg(not(feature = "json-logging"))]
        {
            tracing::warn!("json_format requested but json-logging feature is disabled");
        }
    }
    init_logging(filter)
}
