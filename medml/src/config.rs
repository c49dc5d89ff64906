//! Experiment and engine configuration.
//!
//! [`ExperimentConfig`] is the JSON document the front end sends for every
//! run. [`EngineConfig`] holds process-level settings with serde defaults.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::core::{NodeId, NodeKind, INSTANCE_SEPARATOR};
use crate::errors::{ConfigError, MedmlError};

/// Node settings as a JSON object.
pub type Settings = Map<String, Value>;

/// The experiment document sent by the front end.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Identifier of the page that owns the experiment.
    #[serde(rename = "pageId", default)]
    pub page_id: String,
    /// Number of tree positions the run will visit.
    #[serde(rename = "nbNodes2Run", default)]
    pub nb_nodes_to_run: u64,
    /// Node definitions keyed by node id.
    #[serde(default)]
    pub nodes: HashMap<String, NodeDefinition>,
    /// Nested adjacency map: root ids to their children, recursively.
    #[serde(default)]
    pub pipelines: Map<String, Value>,
    /// Whether trained models are finalized and saved.
    #[serde(default)]
    pub finalize: bool,
    /// Id of the node whose models get finalized.
    #[serde(rename = "modelToFinalize", default, skip_serializing_if = "Option::is_none")]
    pub model_to_finalize: Option<String>,
    /// Name given to saved models.
    #[serde(rename = "modelName", default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    /// Machine-learning task type (e.g. "classification").
    #[serde(rename = "MLType", default, skip_serializing_if = "Option::is_none")]
    pub ml_type: Option<String>,
    /// Every other top-level key (identifiers, columns, steps, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ExperimentConfig {
    /// Parses a configuration document.
    pub fn from_json(raw: &str) -> Result<Self, MedmlError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Converts an already parsed JSON value.
    pub fn from_value(value: Value) -> Result<Self, MedmlError> {
        Ok(serde_json::from_value(value)?)
    }

    /// Returns the definition registered under `id`.
    pub fn definition(&self, id: &str) -> Option<&NodeDefinition> {
        self.nodes.get(id)
    }

    /// Resolves the kind of a node id, looking through instance ids to
    /// their base definition.
    pub fn node_kind(&self, id: &str) -> Result<NodeKind, ConfigError> {
        let node_id = NodeId::from(id);
        let definition = self
            .nodes
            .get(id)
            .or_else(|| self.nodes.get(node_id.base()))
            .ok_or_else(|| ConfigError::unknown_node(id))?;
        definition.kind(id)
    }

    /// Returns an untyped top-level value.
    pub fn extra(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    /// Returns the ML type, falling back to `default`.
    pub fn ml_type_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.ml_type.as_deref().unwrap_or(default)
    }

    /// Returns the finalize target, if finalization is on.
    pub fn finalize_target(&self) -> Option<&str> {
        if self.finalize {
            self.model_to_finalize.as_deref().filter(|t| !t.is_empty())
        } else {
            None
        }
    }

    /// Returns the adjacency map to execute.
    ///
    /// When finalizing a non-join target, every instance key that does not
    /// mention the target is dropped, recursively.
    pub fn runnable_pipelines(&self) -> Result<Map<String, Value>, ConfigError> {
        let mut pipelines = self.pipelines.clone();
        if let Some(target) = self.finalize_target() {
            if !self.node_kind(target)?.is_join() {
                prune_instances(&mut pipelines, target);
            }
        }
        Ok(pipelines)
    }
}

fn prune_instances(level: &mut Map<String, Value>, target: &str) {
    level.retain(|key, _| !key.contains(INSTANCE_SEPARATOR) || key.contains(target));
    for children in level.values_mut() {
        if let Value::Object(children) = children {
            prune_instances(children, target);
        }
    }
}

/// A node definition as drawn in the editor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// Id stamped on instance copies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Label the user gave the node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Node payload.
    pub data: NodeData,
    /// Suffix of an instance id, or the dot-separated branch list of a join.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub associated_id: Option<String>,
}

/// The `data` block of a node definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeData {
    /// Engine-facing part of the node.
    pub internal: NodeInternal,
    /// Editor-only keys.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The `data.internal` block of a node definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInternal {
    /// Type tag, e.g. `train_model`.
    #[serde(rename = "type")]
    pub type_tag: String,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Node settings.
    #[serde(default)]
    pub settings: Settings,
    /// Flags such as `isTuningEnabled` or `selection`.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NodeDefinition {
    /// Creates a definition with the given type tag and settings.
    #[must_use]
    pub fn new(type_tag: impl Into<String>, settings: Settings) -> Self {
        Self {
            id: None,
            username: None,
            data: NodeData {
                internal: NodeInternal {
                    type_tag: type_tag.into(),
                    name: None,
                    settings,
                    extra: Map::new(),
                },
                extra: Map::new(),
            },
            associated_id: None,
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.data.internal.name = Some(name.into());
        self
    }

    /// Sets the associated id.
    #[must_use]
    pub fn with_associated_id(mut self, associated: impl Into<String>) -> Self {
        self.associated_id = Some(associated.into());
        self
    }

    /// Sets an entry of `data.internal` outside the settings.
    #[must_use]
    pub fn with_internal(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.internal.extra.insert(key.into(), value);
        self
    }

    /// Parses the type tag.
    pub fn kind(&self, node_id: &str) -> Result<NodeKind, ConfigError> {
        self.data
            .internal
            .type_tag
            .parse()
            .map_err(|_| ConfigError::unknown_type(node_id, &self.data.internal.type_tag))
    }

    /// Node settings.
    pub fn settings(&self) -> &Settings {
        &self.data.internal.settings
    }

    /// An entry of `data.internal` outside the settings.
    pub fn internal(&self, key: &str) -> Option<&Value> {
        self.data.internal.extra.get(key)
    }

    /// Boolean flag stored in `data.internal`; absent means false.
    pub fn internal_flag(&self, key: &str) -> bool {
        self.internal(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Display name, falling back to the node id.
    pub fn display_name<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.username
            .as_deref()
            .or(self.data.internal.name.as_deref())
            .unwrap_or(fallback)
    }

    /// Builds the definition of an instance `<base>*<suffix>`.
    #[must_use]
    pub fn instantiate(&self, instance_id: &NodeId, suffix: &str) -> Self {
        let mut copy = self.clone();
        copy.id = Some(instance_id.to_string());
        copy.associated_id = Some(suffix.to_string());
        copy
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`.
    #[serde(default = "default_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

/// Process-level engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Largest document the artifact store accepts.
    #[serde(default = "default_document_max")]
    pub artifact_document_max_bytes: usize,
    /// Room kept free in a document for metadata.
    #[serde(default = "default_safety_margin")]
    pub artifact_safety_margin_bytes: usize,
    /// Metric used to pick the best fold.
    #[serde(default = "default_metric")]
    pub optimization_metric: String,
    /// Seed used when the split node does not provide one.
    #[serde(default = "default_random_state")]
    pub default_random_state: i64,
    /// ML type used when the experiment does not name one.
    #[serde(default = "default_ml_type")]
    pub default_ml_type: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            artifact_document_max_bytes: default_document_max(),
            artifact_safety_margin_bytes: default_safety_margin(),
            optimization_metric: default_metric(),
            default_random_state: default_random_state(),
            default_ml_type: default_ml_type(),
        }
    }
}

impl EngineConfig {
    /// Parses an engine config document.
    pub fn from_json(raw: &str) -> Result<Self, MedmlError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Largest serialized model embedded directly in a document.
    pub fn embedded_model_ceiling(&self) -> usize {
        self.artifact_document_max_bytes
            .saturating_sub(self.artifact_safety_margin_bytes)
    }
}

fn default_level() -> String {
    "info".to_string()
}

const fn default_document_max() -> usize {
    16_777_216
}

const fn default_safety_margin() -> usize {
    1_000_000
}

fn default_metric() -> String {
    "Accuracy".to_string()
}

const fn default_random_state() -> i64 {
    42
}

fn default_ml_type() -> String {
    "classification".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "pageId": "page-1",
            "nbNodes2Run": 4,
            "MLType": "classification",
            "finalize": true,
            "modelToFinalize": "train*rf",
            "identifiers": {"models": "models-folder"},
            "nodes": {
                "dataset": {"data": {"internal": {"type": "dataset", "settings": {"files": {"id": "c1"}}}}},
                "train": {"username": "Train", "data": {"internal": {"type": "train_model", "settings": {}, "isTuningEnabled": true}}},
                "rf": {"data": {"internal": {"type": "train_model", "selection": "rf", "settings": {}}}}
            },
            "pipelines": {
                "dataset": {"train*rf": {}, "train*lr": {"save": {}}}
            }
        })
    }

    #[test]
    fn test_parse_experiment_config() {
        let config = ExperimentConfig::from_value(sample()).unwrap();
        assert_eq!(config.page_id, "page-1");
        assert_eq!(config.nb_nodes_to_run, 4);
        assert_eq!(config.ml_type_or("regression"), "classification");
        assert_eq!(config.extra("identifiers"), Some(&json!({"models": "models-folder"})));
        let train = config.definition("train").unwrap();
        assert_eq!(train.display_name("train"), "Train");
        assert!(train.internal_flag("isTuningEnabled"));
        assert!(!train.internal_flag("ensembleEnabled"));
    }

    #[test]
    fn test_pipelines_keep_document_order() {
        let config = ExperimentConfig::from_value(sample()).unwrap();
        let children: Vec<_> = config.pipelines["dataset"].as_object().unwrap().keys().cloned().collect();
        assert_eq!(children, vec!["train*rf".to_string(), "train*lr".to_string()]);
    }

    #[test]
    fn test_node_kind_through_instance() {
        let config = ExperimentConfig::from_value(sample()).unwrap();
        assert_eq!(config.node_kind("train*rf").unwrap(), NodeKind::TrainModel);
        assert!(config.node_kind("missing").is_err());
    }

    #[test]
    fn test_finalize_prunes_other_instances() {
        let config = ExperimentConfig::from_value(sample()).unwrap();
        let pipelines = config.runnable_pipelines().unwrap();
        assert_eq!(pipelines, json!({"dataset": {"train*rf": {}}}).as_object().unwrap().clone());
    }

    #[test]
    fn test_no_pruning_without_finalize() {
        let mut config = ExperimentConfig::from_value(sample()).unwrap();
        config.finalize = false;
        assert_eq!(config.runnable_pipelines().unwrap(), config.pipelines);
    }

    #[test]
    fn test_unknown_type_tag() {
        let def = NodeDefinition::new("explode", Settings::new());
        let err = def.kind("x").unwrap_err();
        assert_eq!(err.code(), Some(crate::errors::codes::UNKNOWN_TYPE));
    }

    #[test]
    fn test_instantiate_sets_association() {
        let def = NodeDefinition::new("train_model", Settings::new());
        let copy = def.instantiate(&NodeId::from("train*rf"), "rf");
        assert_eq!(copy.id.as_deref(), Some("train*rf"));
        assert_eq!(copy.associated_id.as_deref(), Some("rf"));
        assert_ne!(copy, def);
    }

    #[test]
    fn test_engine_config_defaults() {
        let engine = EngineConfig::from_json("{}").unwrap();
        assert_eq!(engine, EngineConfig::default());
        assert_eq!(engine.embedded_model_ceiling(), 15_777_216);
        assert_eq!(engine.optimization_metric, "Accuracy");
        assert_eq!(engine.logging.level, "info");
    }
}
