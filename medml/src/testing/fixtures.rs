//! Test fixtures for building experiments.

use serde_json::{Map, Value};
use std::sync::Arc;

use crate::config::{ExperimentConfig, NodeDefinition};
use crate::pipeline::count_positions;
use crate::toolkit::Services;

use super::mocks::{InMemoryArtifactStore, InMemoryDocumentStore, MockToolkit};

/// Mock collaborators with typed access for assertions.
#[derive(Debug, Clone, Default)]
pub struct MockEnvironment {
    /// Modelling backend.
    pub toolkit: Arc<MockToolkit>,
    /// Dataset collections.
    pub documents: Arc<InMemoryDocumentStore>,
    /// Saved artifacts.
    pub artifacts: Arc<InMemoryArtifactStore>,
}

impl MockEnvironment {
    /// Creates an environment with empty stores.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The collaborators as engine services.
    #[must_use]
    pub fn services(&self) -> Services {
        Services::new(
            self.toolkit.clone(),
            self.documents.clone(),
            self.artifacts.clone(),
        )
    }
}

/// Builder for experiment documents.
#[derive(Debug, Clone, Default)]
pub struct ConfigFixture {
    config: ExperimentConfig,
    nb_nodes: Option<u64>,
}

impl ConfigFixture {
    /// Starts a fixture for the given page.
    #[must_use]
    pub fn new(page_id: impl Into<String>) -> Self {
        Self {
            config: ExperimentConfig {
                page_id: page_id.into(),
                ..ExperimentConfig::default()
            },
            nb_nodes: None,
        }
    }

    /// Adds a node with a type tag and settings.
    #[must_use]
    pub fn node(self, id: &str, type_tag: &str, settings: Value) -> Self {
        let settings = settings.as_object().cloned().unwrap_or_default();
        self.definition(id, NodeDefinition::new(type_tag, settings))
    }

    /// Adds a node carrying an associated id.
    #[must_use]
    pub fn associated(self, id: &str, type_tag: &str, associated_id: &str) -> Self {
        self.definition(
            id,
            NodeDefinition::new(type_tag, Map::new()).with_associated_id(associated_id),
        )
    }

    /// Adds a model definition selecting an estimator.
    #[must_use]
    pub fn model(self, id: &str, selection: &str) -> Self {
        self.definition(
            id,
            NodeDefinition::new("model", Map::new()).with_internal("selection", selection.into()),
        )
    }

    /// Adds a prepared definition.
    #[must_use]
    pub fn definition(mut self, id: &str, definition: NodeDefinition) -> Self {
        self.config.nodes.insert(id.to_string(), definition);
        self
    }

    /// Sets the adjacency map.
    #[must_use]
    pub fn pipelines(mut self, pipelines: Value) -> Self {
        self.config.pipelines = pipelines.as_object().cloned().unwrap_or_default();
        self
    }

    /// Overrides the announced number of positions.
    #[must_use]
    pub fn nb_nodes(mut self, nb: u64) -> Self {
        self.nb_nodes = Some(nb);
        self
    }

    /// Turns finalization on.
    #[must_use]
    pub fn finalize(mut self, target: &str, model_name: &str) -> Self {
        self.config.finalize = true;
        self.config.model_to_finalize = Some(target.to_string());
        self.config.model_name = Some(model_name.to_string());
        self
    }

    /// Sets an untyped top-level key.
    #[must_use]
    pub fn extra(mut self, key: &str, value: Value) -> Self {
        self.config.extra.insert(key.to_string(), value);
        self
    }

    /// Builds the configuration. The position count defaults to the size
    /// of the adjacency map.
    #[must_use]
    pub fn build(mut self) -> ExperimentConfig {
        self.config.nb_nodes_to_run = self
            .nb_nodes
            .unwrap_or_else(|| count_positions(&self.config.pipelines));
        self.config
    }
}
