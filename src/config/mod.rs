//! Configuration management for the native module runtime
//!
//! Handles configuration loading (TOML or JSON), environment overrides and
//! validation. Every field has a default so partial files are accepted.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::{env_bool, env_list, env_opt, RetryConfig};

/// Dynamic loader configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Directories searched for `<name>.native`, in order
    #[serde(default = "default_search_paths")]
    pub search_paths: Vec<PathBuf>,

    /// Extension of module image files
    #[serde(default = "default_extension")]
    pub file_extension: String,

    /// Defer full decoding until the first symbol lookup
    #[serde(default)]
    pub lazy_loading: bool,

    /// Global hot-swap switch
    #[serde(default = "default_true")]
    pub hot_swap_enabled: bool,

    /// Per-module hot-swap enablement, overriding the global switch
    #[serde(default)]
    pub hot_swap_overrides: HashMap<String, bool>,

    /// Timeout for resolving, decoding and initializing a dependency closure
    #[serde(default = "default_load_timeout_ms")]
    pub load_timeout_ms: u64,

    /// Upper bound on a single module's reference count
    #[serde(default = "default_max_reference_count")]
    pub max_reference_count: u32,

    /// Modules below this security level are rejected
    #[serde(default)]
    pub minimum_security_level: u32,

    /// Reject unsigned modules
    #[serde(default)]
    pub require_signatures: bool,

    /// Hex-encoded secp256k1 public keys trusted to sign modules
    #[serde(default)]
    pub trusted_keys: Vec<String>,

    /// Attempts for transient file read failures
    #[serde(default = "default_read_retry_attempts")]
    pub read_retry_attempts: u32,

    /// Initial backoff between file read attempts
    #[serde(default = "default_read_retry_delay_ms")]
    pub read_retry_delay_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_search_paths() -> Vec<PathBuf> {
    vec![PathBuf::from("./modules/"), PathBuf::from("./lib/")]
}

fn default_extension() -> String {
    crate::module::format::MODULE_EXTENSION.to_string()
}

fn default_load_timeout_ms() -> u64 {
    crate::utils::DEFAULT_LOAD_TIMEOUT.as_millis() as u64
}

fn default_max_reference_count() -> u32 {
    1000
}

fn default_read_retry_attempts() -> u32 {
    3
}

fn default_read_retry_delay_ms() -> u64 {
    50
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            search_paths: default_search_paths(),
            file_extension: default_extension(),
            lazy_loading: false,
            hot_swap_enabled: true,
            hot_swap_overrides: HashMap::new(),
            load_timeout_ms: default_load_timeout_ms(),
            max_reference_count: default_max_reference_count(),
            minimum_security_level: 0,
            require_signatures: false,
            trusted_keys: Vec::new(),
            read_retry_attempts: default_read_retry_attempts(),
            read_retry_delay_ms: default_read_retry_delay_ms(),
        }
    }
}

impl LoaderConfig {
    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    /// Whether `module` may be hot-swapped
    pub fn hot_swap_allowed(&self, module: &str) -> bool {
        self.hot_swap_overrides
            .get(module)
            .copied()
            .unwrap_or(self.hot_swap_enabled)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.read_retry_attempts,
            initial_delay: Duration::from_millis(self.read_retry_delay_ms),
            ..RetryConfig::file_io()
        }
    }
}

/// Symbol cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum cached symbols; the oldest entry is evicted beyond this
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,

    /// Initial bucket allocation
    #[serde(default = "default_bucket_hint")]
    pub bucket_hint: usize,
}

fn default_cache_capacity() -> usize {
    4096
}

fn default_bucket_hint() -> usize {
    1024
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            bucket_hint: default_bucket_hint(),
        }
    }
}

/// What a memory pool does when its active block is exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrowthPolicy {
    /// Add blocks up to `max_blocks`
    Grow,
    /// Never add a block beyond the first
    Fixed,
}

/// Loading-time bump allocator configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    #[serde(default = "default_max_blocks")]
    pub max_blocks: usize,

    #[serde(default = "default_growth")]
    pub growth: GrowthPolicy,
}

fn default_block_size() -> usize {
    1024 * 1024
}

fn default_max_blocks() -> usize {
    64
}

fn default_growth() -> GrowthPolicy {
    GrowthPolicy::Grow
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            max_blocks: default_max_blocks(),
            growth: default_growth(),
        }
    }
}

/// Resource caps for sandboxed candidate execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_max_memory")]
    pub max_memory_bytes: u64,

    #[serde(default = "default_max_instructions")]
    pub max_instructions: u64,

    #[serde(default = "default_max_wall_clock_ms")]
    pub max_wall_clock_ms: u64,

    /// Cap on files opened when file access is allowed
    #[serde(default = "default_max_file_descriptors")]
    pub max_file_descriptors: u32,

    /// Cap on connections opened when network access is allowed
    #[serde(default = "default_max_network_connections")]
    pub max_network_connections: u32,

    #[serde(default)]
    pub allow_syscalls: bool,

    #[serde(default)]
    pub allow_file_access: bool,

    #[serde(default)]
    pub allow_network_access: bool,
}

fn default_max_memory() -> u64 {
    128 * 1024 * 1024
}

fn default_max_instructions() -> u64 {
    1_000_000_000
}

fn default_max_wall_clock_ms() -> u64 {
    10_000
}

fn default_max_file_descriptors() -> u32 {
    16
}

fn default_max_network_connections() -> u32 {
    4
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: default_max_memory(),       // 128 MiB
            max_instructions: default_max_instructions(), // 1e9
            max_wall_clock_ms: default_max_wall_clock_ms(),
            max_file_descriptors: default_max_file_descriptors(),
            max_network_connections: default_max_network_connections(),
            allow_syscalls: false,
            allow_file_access: false,
            allow_network_access: false,
        }
    }
}

impl SandboxConfig {
    pub fn max_wall_clock(&self) -> Duration {
        Duration::from_millis(self.max_wall_clock_ms)
    }
}

/// Staged rollout configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Traffic fraction routed to the candidate during canary
    #[serde(default = "default_canary_fraction")]
    pub canary_fraction: f64,

    #[serde(default = "default_canary_window_ms")]
    pub canary_window_ms: u64,

    /// Ordered traffic fractions of the gradual phase; the last must be 1.0
    #[serde(default = "default_gradual_steps")]
    pub gradual_steps: Vec<f64>,

    #[serde(default = "default_gradual_window_ms")]
    pub gradual_window_ms: u64,

    /// Metrics sampling period inside a monitoring window
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,

    /// Bound on a single metrics probe call
    #[serde(default = "default_sample_timeout_ms")]
    pub sample_timeout_ms: u64,

    /// Candidate/baseline execution time ratio above which a phase fails
    #[serde(default = "default_max_regression_ratio")]
    pub max_regression_ratio: f64,

    /// Candidate error rate above which a phase fails
    #[serde(default = "default_max_error_rate")]
    pub max_error_rate: f64,

    #[serde(default = "default_rollback_capacity")]
    pub rollback_capacity: usize,

    #[serde(default = "default_violation_capacity")]
    pub violation_capacity: usize,

    /// Where rollback backups are written; none keeps them in memory only
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,
}

fn default_canary_fraction() -> f64 {
    0.01
}

fn default_canary_window_ms() -> u64 {
    5 * 60 * 1000
}

fn default_gradual_steps() -> Vec<f64> {
    vec![0.10, 0.50, 1.00]
}

fn default_gradual_window_ms() -> u64 {
    10 * 60 * 1000
}

fn default_sample_interval_ms() -> u64 {
    10_000
}

fn default_sample_timeout_ms() -> u64 {
    crate::utils::DEFAULT_SAMPLE_TIMEOUT.as_millis() as u64
}

fn default_max_regression_ratio() -> f64 {
    2.0
}

fn default_max_error_rate() -> f64 {
    0.05
}

fn default_rollback_capacity() -> usize {
    16
}

fn default_violation_capacity() -> usize {
    256
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            canary_fraction: default_canary_fraction(),
            canary_window_ms: default_canary_window_ms(),
            gradual_steps: default_gradual_steps(),
            gradual_window_ms: default_gradual_window_ms(),
            sample_interval_ms: default_sample_interval_ms(),
            sample_timeout_ms: default_sample_timeout_ms(),
            max_regression_ratio: default_max_regression_ratio(),
            max_error_rate: default_max_error_rate(),
            rollback_capacity: default_rollback_capacity(),
            violation_capacity: default_violation_capacity(),
            backup_dir: None,
        }
    }
}

impl DeploymentConfig {
    pub fn canary_window(&self) -> Duration {
        Duration::from_millis(self.canary_window_ms)
    }

    pub fn gradual_window(&self) -> Duration {
        Duration::from_millis(self.gradual_window_ms)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn sample_timeout(&self) -> Duration {
        Duration::from_millis(self.sample_timeout_ms)
    }

    /// Validate deployment configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.canary_fraction > 0.0 && self.canary_fraction <= 1.0) {
            anyhow::bail!("canary_fraction must be in (0, 1], got {}", self.canary_fraction);
        }
        if self.gradual_steps.is_empty() {
            anyhow::bail!("gradual_steps must not be empty");
        }
        let mut previous = 0.0;
        for &step in &self.gradual_steps {
            if !(step > previous && step <= 1.0) {
                anyhow::bail!("gradual_steps must increase strictly within (0, 1]: {:?}", self.gradual_steps);
            }
            previous = step;
        }
        if previous != 1.0 {
            anyhow::bail!("last gradual step must be 1.0, got {}", previous);
        }
        if self.max_regression_ratio < 1.0 {
            anyhow::bail!("max_regression_ratio must be at least 1.0");
        }
        if !(0.0..=1.0).contains(&self.max_error_rate) {
            anyhow::bail!("max_error_rate must be in [0, 1]");
        }
        if self.sample_interval_ms == 0 {
            anyhow::bail!("sample_interval_ms must be greater than 0");
        }
        if self.rollback_capacity == 0 || self.violation_capacity == 0 {
            anyhow::bail!("ring buffer capacities must be greater than 0");
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log filter (e.g. "info", "native_loader=debug"); RUST_LOG takes precedence
    #[serde(default)]
    pub filter: Option<String>,

    /// Emit JSON lines (requires the json-logging feature)
    #[serde(default)]
    pub json_format: bool,
}

/// Runtime configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub loader: LoaderConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub deployment: DeploymentConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RuntimeConfig {
    /// Load configuration from TOML file
    pub fn from_toml_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from JSON file
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Save configuration to JSON file
    pub fn to_json_file(&self, path: &Path) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply `NATIVE_LOADER_*` environment overrides
    pub fn apply_env_overrides(&mut self) {
        if let Some(paths) = env_list("NATIVE_LOADER_SEARCH_PATHS", ':') {
            self.loader.search_paths = paths.into_iter().map(PathBuf::from).collect();
        }
        if let Some(lazy) = env_bool("NATIVE_LOADER_LAZY") {
            self.loader.lazy_loading = lazy;
        }
        if let Some(hot_swap) = env_bool("NATIVE_LOADER_HOT_SWAP") {
            self.loader.hot_swap_enabled = hot_swap;
        }
        if let Some(filter) = env_opt("NATIVE_LOADER_LOG") {
            self.logging.filter = Some(filter);
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.loader.search_paths.is_empty() {
            anyhow::bail!("loader.search_paths must not be empty");
        }
        if self.loader.load_timeout_ms == 0 {
            anyhow::bail!("loader.load_timeout_ms must be greater than 0");
        }
        if self.loader.max_reference_count == 0 {
            anyhow::bail!("loader.max_reference_count must be greater than 0");
        }
        if self.pool.block_size == 0 || self.pool.max_blocks == 0 {
            anyhow::bail!("pool.block_size and pool.max_blocks must be greater than 0");
        }
        if self.cache.capacity == 0 {
            anyhow::bail!("cache.capacity must be greater than 0");
        }
        self.deployment.validate()
    }
}
