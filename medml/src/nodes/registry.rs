//! Registry mapping node kinds to factories.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::{
    CleanNode, DatasetNode, JoinNode, LoadModelNode, Node, NodeCore, SaveModelNode, SplitNode,
    TrainNode,
};
use crate::config::{EngineConfig, ExperimentConfig, NodeDefinition};
use crate::core::{NodeId, NodeKind};
use crate::errors::ConfigError;
use crate::toolkit::Services;

/// What a factory can see while building a node.
#[derive(Debug, Clone, Copy)]
pub struct BuildContext<'a> {
    /// The experiment being built, with instance definitions expanded.
    pub config: &'a ExperimentConfig,
    /// Engine settings.
    pub engine: &'a EngineConfig,
    /// Collaborators.
    pub services: &'a Services,
}

/// Builds a node from its core.
pub type NodeFactory =
    Arc<dyn Fn(NodeCore, &BuildContext<'_>) -> Result<Box<dyn Node>, ConfigError> + Send + Sync>;

/// Maps each [`NodeKind`] to the factory that builds it.
#[derive(Clone)]
pub struct NodeRegistry {
    factories: HashMap<NodeKind, NodeFactory>,
}

impl NodeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Creates a registry holding every built-in node.
    #[must_use]
    pub fn builtin() -> Self {
        Self::new()
            .with(NodeKind::Dataset, |core, ctx| Ok(Box::new(DatasetNode::new(core, ctx)?)))
            .with(NodeKind::Clean, |core, ctx| Ok(Box::new(CleanNode::new(core, ctx))))
            .with(NodeKind::Split, |core, ctx| Ok(Box::new(SplitNode::new(core, ctx)?)))
            .with(NodeKind::TrainModel, |core, ctx| Ok(Box::new(TrainNode::new(core, ctx)?)))
            .with(NodeKind::CompareModels, |core, ctx| Ok(Box::new(TrainNode::new(core, ctx)?)))
            .with(NodeKind::CombineModels, |core, _| Ok(Box::new(JoinNode::new(core)?)))
            .with(NodeKind::GroupModels, |core, _| Ok(Box::new(JoinNode::new(core)?)))
            .with(NodeKind::SaveModel, |core, ctx| Ok(Box::new(SaveModelNode::new(core, ctx)?)))
            .with(NodeKind::LoadModel, |core, ctx| Ok(Box::new(LoadModelNode::new(core, ctx)?)))
    }

    /// Registers a factory, replacing any previous one for `kind`.
    pub fn register<F>(&mut self, kind: NodeKind, factory: F)
    where
        F: Fn(NodeCore, &BuildContext<'_>) -> Result<Box<dyn Node>, ConfigError> + Send + Sync + 'static,
    {
        self.factories.insert(kind, Arc::new(factory));
    }

    /// Builder form of [`NodeRegistry::register`].
    #[must_use]
    pub fn with<F>(mut self, kind: NodeKind, factory: F) -> Self
    where
        F: Fn(NodeCore, &BuildContext<'_>) -> Result<Box<dyn Node>, ConfigError> + Send + Sync + 'static,
    {
        self.register(kind, factory);
        self
    }

    /// True when `kind` has a factory.
    pub fn contains(&self, kind: NodeKind) -> bool {
        self.factories.contains_key(&kind)
    }

    /// Number of registered kinds.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Builds node `id` from `definition`.
    pub fn create(
        &self,
        id: NodeId,
        definition: NodeDefinition,
        ctx: &BuildContext<'_>,
    ) -> Result<Box<dyn Node>, ConfigError> {
        let core = NodeCore::new(id, definition)?;
        let factory = self
            .factories
            .get(&core.kind())
            .ok_or_else(|| ConfigError::unknown_type(core.id().as_str(), core.kind().as_str()))?;
        factory(core, ctx)
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.factories.keys().map(|k| k.as_str()).collect();
        kinds.sort_unstable();
        f.debug_struct("NodeRegistry").field("kinds", &kinds).finish()
    }
}
