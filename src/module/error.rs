//! Module system error taxonomy
//!
//! Format, version and dependency errors are structural: they are returned
//! synchronously and never leave the registry partially mutated. State and
//! resource errors abort only the operation that raised them. Every error is
//! `Clone` so that one in-flight load can hand its outcome to every waiter.

use thiserror::Error;

use crate::module::deploy::DeploymentPhase;
use crate::module::deploy::EvolutionId;
use crate::module::registry::ModuleState;
use crate::utils::IsRetryable;

/// Malformed, truncated or tampered module images
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("Invalid module format: {0}")]
    InvalidFormat(String),

    #[error("Unsupported format version: {0}")]
    UnsupportedVersion(u32),

    #[error("Checksum mismatch: stored {stored:#018x}, computed {computed:#018x}")]
    ChecksumMismatch { stored: u64, computed: u64 },

    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("Truncated input: {needed} bytes needed at offset {offset}, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
}

/// Unparsable versions and constraints that no candidate satisfies
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    #[error("Cannot parse '{input}': {reason}")]
    Parse { input: String, reason: String },

    #[error("{module} requires {dependency} {constraint}, found {found}")]
    Unsatisfiable {
        module: String,
        dependency: String,
        constraint: String,
        found: String,
    },
}

/// Dependency graph problems
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DependencyError {
    #[error("Dependency {dependency} of {module} not found")]
    NotFound { module: String, dependency: String },

    #[error("Circular dependency: {}", members.join(" -> "))]
    Circular { members: Vec<String> },

    #[error("Module {module} targets {found}, host is {expected}")]
    PlatformIncompatible {
        module: String,
        expected: String,
        found: String,
    },
}

/// Registry lifecycle violations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("Invalid state transition for {module}: {from:?} -> {to:?}")]
    InvalidTransition {
        module: String,
        from: ModuleState,
        to: ModuleState,
    },

    #[error("Module id {id} already registered by {existing}")]
    IdCollision { id: String, existing: String },

    #[error("Module {0} already registered")]
    Duplicate(String),

    #[error("Module not found: {0}")]
    NotFound(String),

    #[error("Module {module} is still referenced ({count} references)")]
    StillReferenced { module: String, count: u32 },

    #[error("Module {0} holds no references")]
    NotReferenced(String),
}

/// Exhaustion and timeouts
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("Memory pool exhausted: requested {requested} bytes, {available} available")]
    PoolExhausted { requested: usize, available: usize },

    #[error("Reference limit reached for {module} ({limit})")]
    ReferenceLimit { module: String, limit: u32 },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("I/O error: {message}")]
    Io { message: String, transient: bool },
}

impl From<std::io::Error> for ResourceError {
    fn from(e: std::io::Error) -> Self {
        ResourceError::Io {
            transient: e.is_retryable(),
            message: e.to_string(),
        }
    }
}

impl IsRetryable for ResourceError {
    fn is_retryable(&self) -> bool {
        match self {
            ResourceError::Timeout(_) => true,
            ResourceError::Io { transient, .. } => *transient,
            ResourceError::PoolExhausted { .. } | ResourceError::ReferenceLimit { .. } => false,
        }
    }
}

/// Errors returned by load, preload and hot-swap
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("Module not found: {0}")]
    NotFound(String),

    #[error("Module already loaded: {0}")]
    AlreadyLoaded(String),

    #[error("Dependencies unsatisfied (missing: {missing:?}, conflicting: {conflicting:?})")]
    DependencyUnsatisfied {
        missing: Vec<String>,
        conflicting: Vec<String>,
    },

    #[error("Loading {module} timed out after {after_ms}ms")]
    LoadTimeout { module: String, after_ms: u64 },

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Module {module}: {source}")]
    Format {
        module: String,
        #[source]
        source: FormatError,
    },

    #[error(transparent)]
    Version(#[from] VersionError),

    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Resource(#[from] ResourceError),
}

impl IsRetryable for LoadError {
    fn is_retryable(&self) -> bool {
        match self {
            LoadError::Resource(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Errors returned by unload
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnloadError {
    #[error("Module not loaded: {0}")]
    NotLoaded(String),

    #[error("Module {module} still has dependents: {dependents:?}")]
    HasDependents {
        module: String,
        dependents: Vec<String>,
    },

    #[error(transparent)]
    State(#[from] StateError),
}

/// Errors returned by staged deployments
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeployError {
    #[error("Hot swap disabled for {0}")]
    Disabled(String),

    #[error("Deployment already in progress for {0}")]
    InProgress(String),

    #[error("Phase {phase} failed: {reason}")]
    PhaseFailed {
        phase: DeploymentPhase,
        reason: String,
    },

    #[error("Evolution {evolution_id} rolled back during {phase}: {reason}")]
    RolledBack {
        evolution_id: EvolutionId,
        phase: DeploymentPhase,
        reason: String,
    },

    #[error("Evolution {0} cancelled")]
    Cancelled(EvolutionId),

    #[error("Fatal deployment error: {0}")]
    Fatal(String),

    #[error(transparent)]
    Load(#[from] LoadError),
}

/// Result type for loader operations
pub type LoadResult<T> = Result<T, LoadError>;
