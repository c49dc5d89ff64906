//! Run progress shared with pollers.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Label of a run that completed.
pub const FINISHED_LABEL: &str = "finished";

/// A point-in-time view of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// What the engine is doing.
    #[serde(rename = "currentLabel")]
    pub current_label: String,
    /// Percentage in `[0, 100]`, rounded to 2 decimals.
    pub now: f64,
}

#[derive(Debug, Default)]
struct TrackerState {
    progress: Progress,
    done: u64,
    total: u64,
}

/// Shared progress of one experiment.
///
/// Clones share state, so a poller on another thread sees every update.
/// Within a run the percentage never decreases.
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    state: Arc<RwLock<TrackerState>>,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

impl ProgressTracker {
    /// Creates a tracker at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new run of `total` steps.
    pub fn reset(&self, total: u64) {
        let mut state = self.state.write();
        state.done = 0;
        state.total = total;
        state.progress = Progress::default();
    }

    /// Replaces the label.
    pub fn set_label(&self, label: impl Into<String>) {
        self.state.write().progress.current_label = label.into();
    }

    /// Records one finished step.
    #[allow(clippy::cast_precision_loss)]
    pub fn advance(&self, label: impl Into<String>) {
        let mut state = self.state.write();
        state.done += 1;
        let ratio = state.done as f64 / state.total.max(1) as f64;
        let now = round2((ratio * 100.0).min(100.0));
        state.progress.now = state.progress.now.max(now);
        state.progress.current_label = label.into();
    }

    /// Updates whichever of the fields is given.
    pub fn set_progress(&self, now: Option<f64>, label: Option<&str>) {
        let mut state = self.state.write();
        if let Some(now) = now {
            state.progress.now = state.progress.now.max(round2(now.clamp(0.0, 100.0)));
        }
        if let Some(label) = label {
            state.progress.current_label = label.to_string();
        }
    }

    /// Marks the run complete.
    pub fn finish(&self) {
        let mut state = self.state.write();
        state.done = state.total;
        state.progress.now = 100.0;
        state.progress.current_label = FINISHED_LABEL.to_string();
    }

    /// Steps recorded since the last reset.
    pub fn done(&self) -> u64 {
        self.state.read().done
    }

    /// Steps expected in the current run.
    pub fn total(&self) -> u64 {
        self.state.read().total
    }

    /// Current progress.
    pub fn snapshot(&self) -> Progress {
        self.state.read().progress.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_advance_rounds_to_two_decimals() {
        let tracker = ProgressTracker::new();
        tracker.reset(3);
        tracker.advance("dataset");
        let progress = tracker.snapshot();
        assert_eq!(progress.now, 33.33);
        assert_eq!(progress.current_label, "dataset");
    }

    #[test]
    fn test_progress_never_decreases() {
        let tracker = ProgressTracker::new();
        tracker.reset(4);
        tracker.set_progress(Some(60.0), None);
        tracker.advance("clean");
        assert_eq!(tracker.snapshot().now, 60.0);
        tracker.set_progress(Some(10.0), Some("split"));
        assert_eq!(
            tracker.snapshot(),
            Progress { current_label: "split".into(), now: 60.0 }
        );
    }

    #[test]
    fn test_overshoot_is_clamped() {
        let tracker = ProgressTracker::new();
        tracker.reset(1);
        tracker.advance("a");
        tracker.advance("save");
        assert_eq!(tracker.snapshot().now, 100.0);
    }

    #[test]
    fn test_finish_and_reset() {
        let tracker = ProgressTracker::new();
        tracker.reset(10);
        tracker.advance("a");
        tracker.finish();
        assert_eq!(tracker.snapshot().now, 100.0);
        assert_eq!(tracker.snapshot().current_label, FINISHED_LABEL);
        assert_eq!(tracker.done(), 10);

        tracker.reset(2);
        assert_eq!(tracker.snapshot(), Progress::default());
        assert_eq!(tracker.total(), 2);
    }

    #[test]
    fn test_clones_share_state() {
        let tracker = ProgressTracker::new();
        let poller = tracker.clone();
        tracker.reset(2);
        tracker.advance("a");
        assert_eq!(poller.snapshot().now, 50.0);
    }

    #[test]
    fn test_serializes_with_wire_names() {
        let json = serde_json::to_value(Progress { current_label: "x".into(), now: 12.5 }).unwrap();
        assert_eq!(json, serde_json::json!({"currentLabel": "x", "now": 12.5}));
    }
}
