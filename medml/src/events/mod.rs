//! Lifecycle events emitted while an experiment runs.
//!
//! The engine reports node and experiment milestones to an [`EventSink`].
//! Sinks are called inline and must never fail the run.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink, RecordedEvent};

/// Event type names.
pub mod types {
    /// A node is about to execute.
    pub const NODE_STARTED: &str = "node.started";
    /// A node executed successfully.
    pub const NODE_COMPLETED: &str = "node.completed";
    /// A node had already run and was not executed again.
    pub const NODE_SKIPPED: &str = "node.skipped";
    /// A join node is waiting for more branches.
    pub const NODE_HELD: &str = "node.held";
    /// A `start()` pass began.
    pub const EXPERIMENT_STARTED: &str = "experiment.started";
    /// A `start()` pass finished.
    pub const EXPERIMENT_FINISHED: &str = "experiment.finished";
    /// A `start()` pass was aborted by an error.
    pub const EXPERIMENT_FAILED: &str = "experiment.failed";
    /// The save pass stored models.
    pub const MODEL_SAVED: &str = "model.saved";
}
