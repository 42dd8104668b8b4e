//! Environment variable utilities
//!
//! Provides helpers for reading environment variables with defaults.

/// Get environment variable as Option
///
/// Returns `Some(value)` if set and non-empty, `None` otherwise.
pub fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Get environment variable as boolean
///
/// Returns `Some(true)` for "true", "1", "yes", "on" and `Some(false)` for
/// "false", "0", "no", "off" (case-insensitive). Anything else, or an unset
/// variable, is `None`.
pub fn env_bool(key: &str) -> Option<bool> {
    let value = env_opt(key)?.to_lowercase();
    match value.as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Get environment variable as a list split on `separator`, skipping empty items
pub fn env_list(key: &str, separator: char) -> Option<Vec<String>> {
    let value = env_opt(key)?;
    Some(
        value
            .split(separator)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
    )
}
