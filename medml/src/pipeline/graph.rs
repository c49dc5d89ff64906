//! The executable node tree.
//!
//! A [`PipelineGraph`] mirrors the nested `pipelines` adjacency map: every key
//! becomes one [`PipelineNodeState`] at that tree position. A node id may
//! occur at several positions; each position owns its own node.

use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::config::NodeDefinition;
use crate::context::ExperimentContext;
use crate::core::{NodeId, NodeOutput, INSTANCE_SEPARATOR, PREV_NODE_COMPLETE};
use crate::errors::ConfigError;
use crate::nodes::{BuildContext, Node, NodeRegistry};

/// What a node recorded the last time it executed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeResults {
    /// Id of the parent that fed the node; `None` for roots.
    pub prev_node_id: Option<NodeId>,
    /// The serializable part of the node output.
    pub data: Map<String, Value>,
}

impl NodeResults {
    /// Captures the serializable part of an output.
    #[must_use]
    pub fn from_output(prev_node_id: Option<&NodeId>, output: &NodeOutput) -> Self {
        Self {
            prev_node_id: prev_node_id.cloned(),
            data: output.json_data(),
        }
    }

    /// True when a join node reported it is still waiting.
    pub fn is_held(&self) -> bool {
        self.data.get(PREV_NODE_COMPLETE) == Some(&Value::Bool(false))
    }

    /// True when the node's children must not be visited.
    pub fn halts_branch(&self) -> bool {
        self.is_held() || self.data.contains_key("error")
    }

    /// The JSON form recorded in the results tree.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert(
            "prev_node_id".into(),
            self.prev_node_id
                .as_ref()
                .map_or(Value::Null, |id| Value::String(id.to_string())),
        );
        map.insert("data".into(), Value::Object(self.data.clone()));
        Value::Object(map)
    }
}

/// One position of the tree.
#[derive(Debug)]
pub struct PipelineNodeState {
    pub(super) node: Box<dyn Node>,
    pub(super) next_nodes: Vec<PipelineNodeState>,
    pub(super) results: Option<NodeResults>,
    pub(super) experiment: Option<ExperimentContext>,
    pub(super) saved: Option<NodeResults>,
}

impl PipelineNodeState {
    fn fresh(node: Box<dyn Node>) -> Self {
        Self {
            node,
            next_nodes: Vec::new(),
            results: None,
            experiment: None,
            saved: None,
        }
    }

    fn any_ran(states: &[Self], id: &str) -> bool {
        states
            .iter()
            .any(|s| (s.node.id().as_str() == id && s.node.has_run()) || Self::any_ran(&s.next_nodes, id))
    }

    /// The node at this position.
    pub fn node(&self) -> &dyn Node {
        self.node.as_ref()
    }

    /// Child positions in adjacency order.
    pub fn children(&self) -> &[PipelineNodeState] {
        &self.next_nodes
    }

    /// Results of the last execution at this position.
    pub fn results(&self) -> Option<&NodeResults> {
        self.results.as_ref()
    }

    /// The context cached after the last execution.
    pub fn experiment(&self) -> Option<&ExperimentContext> {
        self.experiment.as_ref()
    }

    /// Finds the child with the given id.
    pub fn child(&self, id: &str) -> Option<&PipelineNodeState> {
        self.next_nodes.iter().find(|c| c.node.id().as_str() == id)
    }
}

/// The tree of node positions built from the adjacency map.
#[derive(Debug, Default)]
pub struct PipelineGraph {
    roots: Vec<PipelineNodeState>,
}

impl PipelineGraph {
    /// Builds a graph from scratch.
    pub fn build(pipelines: &Map<String, Value>, builder: &mut GraphBuilder<'_>) -> Result<Self, ConfigError> {
        let roots = builder.build_level(pipelines, Vec::new())?;
        Ok(Self { roots })
    }

    /// Merges a new adjacency map into the existing tree.
    ///
    /// Positions whose node kept identical settings are reused with their
    /// results and cached context. A changed node is rebuilt together with
    /// its whole subtree. When one position of a join node is rebuilt, every
    /// other position of it is rebuilt too, so its barrier fills again from
    /// scratch. On error the graph is left empty.
    pub fn update(&mut self, pipelines: &Map<String, Value>, builder: &mut GraphBuilder<'_>) -> Result<(), ConfigError> {
        loop {
            let previous = std::mem::take(&mut self.roots);
            self.roots = builder.build_level(pipelines, previous)?;

            let stale: BTreeSet<String> = builder
                .rebuilt_joins
                .iter()
                .filter(|id| !builder.force_fresh.contains(*id) && PipelineNodeState::any_ran(&self.roots, id))
                .cloned()
                .collect();
            if stale.is_empty() {
                return Ok(());
            }
            debug!(joins = ?stale, "rebuilding every position of partially rebuilt joins");
            builder.force_fresh.extend(stale);
        }
    }

    /// Root positions in adjacency order.
    pub fn roots(&self) -> &[PipelineNodeState] {
        &self.roots
    }

    pub(super) fn roots_mut(&mut self) -> &mut [PipelineNodeState] {
        &mut self.roots
    }

    /// Follows `path` from a root down the tree.
    pub fn find(&self, path: &[&str]) -> Option<&PipelineNodeState> {
        let (first, rest) = path.split_first()?;
        let root = self.roots.iter().find(|r| r.node.id().as_str() == *first)?;
        rest.iter().try_fold(root, |state, id| state.child(id))
    }

    /// Number of tree positions.
    pub fn position_count(&self) -> u64 {
        fn count(states: &[PipelineNodeState]) -> u64 {
            states.iter().map(|s| 1 + count(&s.next_nodes)).sum()
        }
        count(&self.roots)
    }

    /// True when the graph has no positions.
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

/// Number of positions an adjacency map describes.
pub fn count_positions(pipelines: &Map<String, Value>) -> u64 {
    pipelines
        .values()
        .map(|children| 1 + children.as_object().map_or(0, count_positions))
        .sum()
}

/// What a build pass produced besides the tree itself.
#[derive(Debug, Default)]
pub struct BuildSummary {
    /// The last build-order number handed out.
    pub sequence: u64,
    /// Instance definitions derived while building.
    pub instances: BTreeMap<String, NodeDefinition>,
    /// Join node ids with at least one freshly built position.
    pub rebuilt_joins: BTreeSet<String>,
}

/// Turns adjacency maps into node positions.
///
/// Instance ids (`base*suffix`) are resolved to a copy of the base
/// definition; the copies are collected so the caller can register them.
pub struct GraphBuilder<'a> {
    registry: &'a NodeRegistry,
    ctx: BuildContext<'a>,
    instances: BTreeMap<String, NodeDefinition>,
    sequence: u64,
    rebuilt_joins: BTreeSet<String>,
    force_fresh: BTreeSet<String>,
}

impl<'a> GraphBuilder<'a> {
    /// Creates a builder.
    pub fn new(registry: &'a NodeRegistry, ctx: BuildContext<'a>) -> Self {
        Self {
            registry,
            ctx,
            instances: BTreeMap::new(),
            sequence: 0,
            rebuilt_joins: BTreeSet::new(),
            force_fresh: BTreeSet::new(),
        }
    }

    /// Continues build-order numbering after `sequence`.
    #[must_use]
    pub fn starting_at(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Ends the build.
    pub fn finish(self) -> BuildSummary {
        BuildSummary {
            sequence: self.sequence,
            instances: self.instances,
            rebuilt_joins: self.rebuilt_joins,
        }
    }

    /// Returns the definition for `key`, deriving instance definitions.
    fn resolve(&mut self, key: &str) -> Result<NodeDefinition, ConfigError> {
        if let Some(definition) = self.ctx.config.definition(key) {
            return Ok(definition.clone());
        }
        if let Some(definition) = self.instances.get(key) {
            return Ok(definition.clone());
        }

        let id = NodeId::from(key);
        let Some((base, suffix)) = id.instance_parts() else {
            return Err(ConfigError::unknown_node(key));
        };
        if base.is_empty() || suffix.is_empty() {
            return Err(ConfigError::bad_instance(key, "base id and suffix must both be non-empty"));
        }
        if suffix.contains(INSTANCE_SEPARATOR) {
            return Err(ConfigError::bad_instance(key, "suffix must not contain another separator"));
        }
        let base_definition = self
            .ctx
            .config
            .definition(base)
            .ok_or_else(|| ConfigError::bad_instance(key, &format!("base node '{base}' is not defined")))?;

        let definition = base_definition.instantiate(&id, suffix);
        debug!(instance_id = %key, base = %base, "derived instance definition");
        self.instances.insert(key.to_string(), definition.clone());
        Ok(definition)
    }

    fn build_level(
        &mut self,
        spec: &Map<String, Value>,
        mut previous: Vec<PipelineNodeState>,
    ) -> Result<Vec<PipelineNodeState>, ConfigError> {
        let mut level = Vec::with_capacity(spec.len());
        for (key, children) in spec {
            let children = children.as_object().ok_or_else(|| ConfigError::bad_adjacency(key))?;
            let definition = self.resolve(key)?;
            let candidate = self.registry.create(NodeId::from(key.as_str()), definition, &self.ctx)?;

            self.sequence += 1;
            let sequence = self.sequence;
            let reusable = if self.force_fresh.contains(key.as_str()) {
                None
            } else {
                previous
                    .iter()
                    .position(|p| p.node.id().as_str() == key && p.node.same_settings(candidate.as_ref()))
            };
            let mut state = match reusable {
                Some(index) => {
                    let mut old = previous.swap_remove(index);
                    let old_children = std::mem::take(&mut old.next_nodes);
                    old.next_nodes = self.build_level(children, old_children)?;
                    old
                }
                None => {
                    if candidate.kind().is_join() {
                        self.rebuilt_joins.insert(key.clone());
                    }
                    let mut state = PipelineNodeState::fresh(candidate);
                    state.next_nodes = self.build_level(children, Vec::new())?;
                    state
                }
            };

            state.node.reset_just_run();
            state.node.core_mut().set_sequence(sequence);
            level.push(state);
        }
        Ok(level)
    }
}
