//! Pipeline nodes.
//!
//! Every node owns a [`NodeCore`] holding its identity, settings, run flags
//! and the payload it forwards to its children. Concrete nodes implement
//! [`Node::run`]; the engine only ever calls [`Node::execute`].

mod clean;
mod dataset;
mod join;
mod model_io;
mod registry;
mod split;
mod train;

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt::Debug;

use crate::config::{NodeDefinition, Settings};
use crate::context::ExperimentContext;
use crate::core::{NodeId, NodeKind, NodeOutput, NodePayload};
use crate::errors::{ConfigError, NodeError};

pub use clean::CleanNode;
pub use dataset::{DatasetNode, SETUP_KEYS};
pub use join::{JoinBarrier, JoinNode, COMBINE_METHODS, POST_ACTIONS};
pub use model_io::{LoadModelNode, SaveModelNode, MODEL_EXTENSION};
pub use registry::{BuildContext, NodeFactory, NodeRegistry};
pub use split::{SplitNode, SplitStrategy};
pub use train::TrainNode;

/// State shared by every node implementation.
#[derive(Debug, Clone)]
pub struct NodeCore {
    id: NodeId,
    kind: NodeKind,
    name: String,
    definition: NodeDefinition,
    fingerprint: String,
    sequence: u64,
    has_run: bool,
    just_run: bool,
    ran_with: Option<String>,
    info: NodePayload,
}

impl NodeCore {
    /// Creates the core of node `id`.
    pub fn new(id: NodeId, definition: NodeDefinition) -> Result<Self, ConfigError> {
        let kind = definition.kind(id.as_str())?;
        let name = definition.display_name(id.as_str()).to_string();
        let fingerprint = settings_fingerprint(&definition);
        Ok(Self {
            id,
            kind,
            name,
            definition,
            fingerprint,
            sequence: 0,
            has_run: false,
            just_run: false,
            ran_with: None,
            info: NodePayload::default(),
        })
    }

    /// Node id.
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Node kind.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The definition the node was built from.
    pub fn definition(&self) -> &NodeDefinition {
        &self.definition
    }

    /// Node settings.
    pub fn settings(&self) -> &Settings {
        self.definition.settings()
    }

    /// One setting.
    pub fn setting(&self, key: &str) -> Option<&Value> {
        self.settings().get(key)
    }

    /// One setting, or a configuration error when absent.
    pub fn require_setting(&self, key: &str) -> Result<&Value, ConfigError> {
        self.setting(key)
            .ok_or_else(|| ConfigError::missing_setting(self.id.as_str(), key))
    }

    /// A string setting; empty strings count as absent.
    pub fn str_setting(&self, key: &str) -> Option<&str> {
        self.setting(key).and_then(Value::as_str).filter(|s| !s.is_empty())
    }

    /// The associated id: instance suffix or join branch list.
    pub fn associated_id(&self) -> Option<&str> {
        self.definition.associated_id.as_deref().filter(|a| !a.is_empty())
    }

    /// SHA-256 of the serialized definition.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Build order of the node within the current graph.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Sets the build order.
    pub fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    /// Replaces the payload forwarded to children.
    pub fn publish(&mut self, info: NodePayload) {
        self.info = info;
    }

    /// The payload forwarded to children.
    pub fn info(&self) -> &NodePayload {
        &self.info
    }

    /// Creates an execution error for this node.
    pub fn fail(&self, message: impl Into<String>) -> NodeError {
        NodeError::new(self.id.as_str(), message)
    }

    fn mark_run(&mut self) {
        self.has_run = true;
        self.just_run = true;
        self.ran_with = Some(self.fingerprint.clone());
    }
}

fn settings_fingerprint(definition: &NodeDefinition) -> String {
    let bytes = serde_json::to_vec(definition).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// Everything a node receives when it executes.
pub struct NodeInput<'a> {
    /// The branch-local context; nodes may mutate it in place.
    pub experiment: &'a mut ExperimentContext,
    /// The parent's forwarded payload.
    pub upstream: &'a NodePayload,
    /// The parent's id; `None` for roots.
    pub upstream_id: Option<&'a NodeId>,
    /// Whether training nodes should finalize their models.
    pub finalize: bool,
    /// Shared arrival state, for join nodes.
    pub barrier: Option<&'a mut JoinBarrier>,
}

impl<'a> NodeInput<'a> {
    /// Creates an input with no parent.
    pub fn new(experiment: &'a mut ExperimentContext, upstream: &'a NodePayload) -> Self {
        Self {
            experiment,
            upstream,
            upstream_id: None,
            finalize: false,
            barrier: None,
        }
    }

    /// Sets the parent id.
    #[must_use]
    pub fn with_upstream_id(mut self, id: &'a NodeId) -> Self {
        self.upstream_id = Some(id);
        self
    }

    /// Sets the finalize flag.
    #[must_use]
    pub fn with_finalize(mut self, finalize: bool) -> Self {
        self.finalize = finalize;
        self
    }

    /// Attaches a join barrier.
    #[must_use]
    pub fn with_barrier(mut self, barrier: &'a mut JoinBarrier) -> Self {
        self.barrier = Some(barrier);
        self
    }

    /// The caller's branch id: the upstream `id` value, else the parent id.
    pub fn caller_id(&self) -> Option<NodeId> {
        self.upstream
            .get_str("id")
            .map(NodeId::from)
            .or_else(|| self.upstream_id.cloned())
    }
}

/// A node of the pipeline graph.
pub trait Node: Debug + Send {
    /// Shared state.
    fn core(&self) -> &NodeCore;

    /// Mutable shared state.
    fn core_mut(&mut self) -> &mut NodeCore;

    /// Performs the node's work.
    fn run(&mut self, input: NodeInput<'_>) -> Result<NodeOutput, NodeError>;

    /// Runs the node and records that it ran.
    fn execute(&mut self, input: NodeInput<'_>) -> Result<NodeOutput, NodeError> {
        let output = self.run(input)?;
        self.core_mut().mark_run();
        Ok(output)
    }

    /// Node id.
    fn id(&self) -> &NodeId {
        self.core().id()
    }

    /// Display name.
    fn name(&self) -> &str {
        self.core().name()
    }

    /// Node kind.
    fn kind(&self) -> NodeKind {
        self.core().kind()
    }

    /// True once the node executed successfully.
    fn has_run(&self) -> bool {
        self.core().has_run
    }

    /// True when the node executed during the current pass.
    fn just_run(&self) -> bool {
        self.core().just_run
    }

    /// Clears the current-pass flag.
    fn reset_just_run(&mut self) {
        self.core_mut().just_run = false;
    }

    /// True unless the node ran with exactly its current settings.
    fn has_changed(&self) -> bool {
        let core = self.core();
        core.ran_with.as_deref() != Some(core.fingerprint.as_str())
    }

    /// The payload forwarded to children.
    fn info_for_next_node(&self) -> &NodePayload {
        self.core().info()
    }

    /// True when both nodes are of the same kind with equal definitions.
    fn same_settings(&self, other: &dyn Node) -> bool {
        self.kind() == other.kind() && self.core().definition() == other.core().definition()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug)]
    struct Echo {
        core: NodeCore,
    }

    impl Node for Echo {
        fn core(&self) -> &NodeCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut NodeCore {
            &mut self.core
        }

        fn run(&mut self, input: NodeInput<'_>) -> Result<NodeOutput, NodeError> {
            if input.upstream.flag("fail") {
                return Err(self.core.fail("asked to fail"));
            }
            self.core.publish(input.upstream.clone());
            Ok(NodeOutput::new())
        }
    }

    fn echo(settings: Value) -> Echo {
        let definition = NodeDefinition::new("clean", serde_json::from_value(settings).unwrap());
        Echo {
            core: NodeCore::new(NodeId::from("clean"), definition).unwrap(),
        }
    }

    #[test]
    fn test_execute_marks_run() {
        let mut node = echo(json!({"a": 1}));
        assert!(!node.has_run());
        assert!(node.has_changed());

        let mut context = ExperimentContext::new();
        let upstream = NodePayload::new().with_value("target", "y");
        node.execute(NodeInput::new(&mut context, &upstream)).unwrap();

        assert!(node.has_run());
        assert!(node.just_run());
        assert!(!node.has_changed());
        assert_eq!(node.info_for_next_node().get_str("target"), Some("y"));

        node.reset_just_run();
        assert!(!node.just_run());
        assert!(node.has_run());
    }

    #[test]
    fn test_failed_execution_is_not_marked() {
        let mut node = echo(json!({}));
        let mut context = ExperimentContext::new();
        let upstream = NodePayload::new().with_value("fail", true);
        let err = node.execute(NodeInput::new(&mut context, &upstream)).unwrap_err();
        assert_eq!(err.node_id, "clean");
        assert!(!node.has_run());
    }

    #[test]
    fn test_same_settings() {
        assert!(echo(json!({"a": 1})).same_settings(&echo(json!({"a": 1}))));
        assert!(!echo(json!({"a": 1})).same_settings(&echo(json!({"a": 2}))));
    }

    #[test]
    fn test_caller_id_prefers_upstream_value() {
        let mut context = ExperimentContext::new();
        let parent = NodeId::from("train*rf");
        let upstream = NodePayload::new();
        let input = NodeInput::new(&mut context, &upstream).with_upstream_id(&parent);
        assert_eq!(input.caller_id(), Some(parent.clone()));

        let mut context = ExperimentContext::new();
        let upstream = NodePayload::new().with_value("id", "train*lr");
        let input = NodeInput::new(&mut context, &upstream).with_upstream_id(&parent);
        assert_eq!(input.caller_id(), Some(NodeId::from("train*lr")));
    }
}
