//! Native Loader - dynamic loading and staged hot-swap of native modules
//!
//! This crate loads modules in the `.native` binary format, resolves their
//! dependency closures, serves symbol lookups through a bounded cache, and
//! replaces live modules through a sandboxed, monitored rollout with
//! snapshot rollback.
//!
//! ## Design Principles
//!
//! 1. **All-or-Nothing Loads**: A dependency closure is committed in one registry transaction or not at all
//! 2. **Explicit Context**: Registries and caches are constructed values, never process globals
//! 3. **Pluggable Collaborators**: Code execution, metrics and event sinks sit behind traits
//! 4. **Bounded State**: Caches, violation logs and rollback points are fixed-capacity rings

// Memory allocator optimization using mimalloc (faster than default allocator)
#[cfg(all(feature = "mimalloc", not(target_os = "windows")))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod config;
pub mod module;
pub mod utils;

// Re-export config module
pub use config::*;

pub use module::error::{
    DependencyError, DeployError, FormatError, LoadError, LoadResult, ResourceError, StateError, UnloadError,
    VersionError,
};
pub use module::{ModuleManager, ModuleManagerBuilder};
