//! Shared test utilities for processor, integration and chaos tests.
//!
//! This module provides:
//! - Redis testcontainer setup
//! - Recording Publisher / TaskStore doubles sharing one event log
//! - Execution state fixtures

pub mod containers;
pub mod mocks;

#[allow(unused_imports)]
pub use containers::*;
pub use mocks::*;
