//! Shared test utilities for hymnflow integration tests.
//!
//! This module provides:
//! - Scripted mock adapters that record what the pipeline asked of them
//! - `TestHarness` for starting an orchestrator in an isolated temp directory
//! - Builder patterns for creating test configurations programmatically

pub mod builders;
pub mod harness;
pub mod mocks;

pub use builders::*;
pub use harness::*;
pub use mocks::*;
