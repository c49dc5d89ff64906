//! Core domain types shared by nodes, the graph, and the engine.
//!
//! - Node ids and instance id parsing
//! - Node kinds
//! - Node payloads and outputs

mod ids;
mod kind;
mod output;

pub use ids::{
    association_branches, NodeId, ASSOCIATION_SEPARATOR, INSTANCE_SEPARATOR, SAVE_NODE_ID,
};
pub use kind::{NodeKind, UnknownNodeKind};
pub use output::{NodeOutput, NodePayload, ResultValue, PREV_NODE_COMPLETE};
