//! Pipeline building and execution.
//!
//! This module provides:
//! - The node tree built from the `pipelines` adjacency map
//! - The depth-first execution engine with train-once reuse
//! - Progress tracking and the JSON results tree

mod engine;
mod graph;
mod progress;
mod results;

#[cfg(test)]
mod integration_tests;

pub use engine::{Experiment, RESULTS_LABEL};
pub use graph::{count_positions, BuildSummary, GraphBuilder, NodeResults, PipelineGraph, PipelineNodeState};
pub use progress::{Progress, ProgressTracker, FINISHED_LABEL};
pub use results::ResultsTree;
