//! Testing utilities for medml experiments.
//!
//! This module provides:
//! - Mock toolkit, stores, and fitted models
//! - A counting node for graph-level tests
//! - Experiment fixtures and result assertions

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{assert_no_result_at, assert_progress_finished, assert_result_at};
pub use fixtures::{ConfigFixture, MockEnvironment};
pub use mocks::{
    CallLog, CountingNode, ExecutionLog, InMemoryArtifactStore, InMemoryDocumentStore, MockModel,
    MockSession, MockToolkit,
};
