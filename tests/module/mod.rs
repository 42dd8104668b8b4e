//! Module system tests
//!
//! Tests for loading, dependency resolution, symbol lookup and staged
//! hot swaps through the public manager API.

pub mod deployment_tests;
pub mod loader_tests;
pub mod test_utils;
