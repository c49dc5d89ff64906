//! # medml
//!
//! The execution engine behind a visual machine-learning pipeline builder.
//!
//! A user draws a graph of nodes (dataset loading, cleaning, splitting,
//! training, ensembling and model I/O). The engine turns the drawn graph into
//! a tree of executable nodes and runs it depth-first:
//!
//! - **Train-once reuse**: nodes whose settings did not change keep their
//!   results across runs; only changed subtrees execute again
//! - **Join barriers**: combine and group nodes wait for every branch they
//!   list before merging models
//! - **Progress and results**: a pollable progress percentage and a JSON
//!   results tree shaped like the drawn graph
//!
//! Model fitting and storage live behind the traits in [`toolkit`].
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use medml::prelude::*;
//!
//! let config = ExperimentConfig::from_json(&raw)?;
//! let mut experiment = Experiment::new(
//!     config,
//!     Arc::new(NodeRegistry::builtin()),
//!     services,
//!     EngineConfig::default(),
//! )?;
//! let results = experiment.start()?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod context;
pub mod core;
pub mod errors;
pub mod events;
pub mod nodes;
pub mod observability;
pub mod pipeline;
pub mod runner;
pub mod testing;
pub mod toolkit;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{EngineConfig, ExperimentConfig, LoggingConfig, NodeDefinition};
    pub use crate::context::{ExperimentContext, Table};
    pub use crate::core::{NodeId, NodeKind, NodeOutput, NodePayload};
    pub use crate::errors::{ConfigError, MedmlError, NodeError, StoreError};
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::nodes::{Node, NodeCore, NodeInput, NodeRegistry};
    pub use crate::observability::init_logging;
    pub use crate::pipeline::{Experiment, Progress, ProgressTracker, ResultsTree};
    pub use crate::runner::ExperimentRegistry;
    pub use crate::toolkit::{
        ArtifactStore, DocumentStore, FittedModel, ModelHandle, ModelSession, ModelToolkit, Services,
    };
}
