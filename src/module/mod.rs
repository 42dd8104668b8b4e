//! Module system for native-loader
//!
//! This module provides loading, lookup and live replacement of native
//! modules: compiled code and data in a checksummed, optionally signed
//! binary container.
//!
//! ## Architecture
//!
//! - **Format**: `.native` codec with header validation, CRC-64 checksums and secp256k1 signatures
//! - **Resolver**: Semantic versions, constraints, and cycle-checked topological load order
//! - **Registry**: Transactional record table with lifecycle states and reference counts
//! - **Loader**: Single-flight, all-or-nothing loading of whole dependency closures
//! - **Cache**: djb2-keyed symbol cache purged on unload, swap and restore; per-module memory pools
//! - **Deploy**: Sandbox, canary and gradual rollout with snapshot rollback

pub mod cache;
pub mod deploy;
pub mod error;
pub mod format;
pub mod image;
pub mod loader;
pub mod manager;
pub mod registry;
pub mod resolver;
pub mod traits;

pub use error::{LoadError, LoadResult};
pub use format::{ModuleId, ModuleMetadata, NativeModule};
pub use image::{ImageSlot, ModuleImage};
pub use loader::{LoaderBuilder, ModuleLoader, StagedSwap};
pub use manager::{ManagerStats, ModuleManager, ModuleManagerBuilder};
pub use registry::{ModuleRegistry, ModuleState, RecordHandle, RecordView};
pub use resolver::{DependencySpec, ModuleVersion, VersionConstraint};
pub use traits::{CollaboratorError, EventSink, ExecutionEngine, ExecutionMetrics, MetricsProbe};
