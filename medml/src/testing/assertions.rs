//! Assertions over engine state.

use serde_json::Value;

use crate::pipeline::{ProgressTracker, ResultsTree};

/// Asserts that the tracker reports a finished run.
pub fn assert_progress_finished(tracker: &ProgressTracker) {
    let progress = tracker.snapshot();
    assert!(
        (progress.now - 100.0).abs() < f64::EPSILON,
        "Expected progress 100, got {} ({})",
        progress.now,
        progress.current_label
    );
}

/// Asserts that a node slot exists at `path` and returns its recorded data.
///
/// `path` lists node ids from a root down to the node.
pub fn assert_result_at<'a>(tree: &'a ResultsTree, path: &[&str]) -> &'a Value {
    match tree.data_at(path) {
        Some(data) => data,
        None => panic!("Expected results at {path:?}, tree is {}", tree.to_value()),
    }
}

/// Asserts that no slot was recorded at `path`.
pub fn assert_no_result_at(tree: &ResultsTree, path: &[&str]) {
    assert!(
        tree.data_at(path).is_none(),
        "Expected no results at {path:?}, tree is {}",
        tree.to_value()
    );
}
