//! Version & dependency resolver
//!
//! Parses versions and constraints, evaluates dependency filters against the
//! host, and turns a module set into a cycle-free, reproducible load order.

pub mod constraint;
pub mod dependency;
pub mod graph;
pub mod version;

pub use constraint::{satisfies, ConstraintKind, VersionConstraint};
pub use dependency::{DependencyKind, DependencySpec, HostTarget, Platform};
pub use graph::{dependency_closure, resolve_load_order, DependencyGraph, DependencyResolution, GraphNode};
pub use version::{compare, ModuleVersion};
