//! Module loading system
//!
//! Handles dependency-closure loading, unloading with reference counting,
//! garbage collection, and staged hot-swap replacement.

pub mod loader;
mod plan;
pub mod swap;

pub use loader::{LoaderBuilder, LoaderStats, ModuleLoader, LOADER_VERSION};
pub use swap::StagedSwap;
