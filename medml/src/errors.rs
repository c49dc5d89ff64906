//! Error types for the medml engine.
//!
//! Configuration problems are detected while the pipeline graph is built and
//! abort the whole run before any node executes. Node errors are raised while
//! a node runs and abort the current `start()` pass, leaving the results of
//! already completed nodes in place.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// The main error type for engine operations.
#[derive(Debug, Error)]
pub enum MedmlError {
    /// The experiment configuration is invalid.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A node failed while executing.
    #[error("{0}")]
    Node(#[from] NodeError),

    /// A document or artifact store failed.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result alias used across the crate.
pub type Result<T, E = MedmlError> = std::result::Result<T, E>;

/// Metadata about a configuration error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ErrorInfo {
    /// Error code (e.g., "GRAPH-001-UNKNOWN_NODE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ErrorInfo {
    /// Creates a new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Stable error codes for configuration errors.
pub mod codes {
    /// A pipeline key names a node absent from the definitions.
    pub const UNKNOWN_NODE: &str = "GRAPH-001-UNKNOWN_NODE";
    /// An instance id is malformed or its base node is missing.
    pub const BAD_INSTANCE: &str = "GRAPH-002-BAD_INSTANCE";
    /// The pipelines adjacency map is not a nested object.
    pub const BAD_ADJACENCY: &str = "GRAPH-003-BAD_ADJACENCY";
    /// A required node setting is missing.
    pub const MISSING_SETTING: &str = "NODE-001-MISSING_SETTING";
    /// A node setting names a choice outside its allowed set.
    pub const DISALLOWED_CHOICE: &str = "NODE-002-DISALLOWED_CHOICE";
    /// A node's associated id is missing or malformed.
    pub const BAD_ASSOCIATION: &str = "NODE-003-BAD_ASSOCIATION";
    /// A node type tag is unknown to the registry.
    pub const UNKNOWN_TYPE: &str = "NODE-004-UNKNOWN_TYPE";
}

/// Error raised when the experiment configuration cannot be turned into a
/// runnable pipeline graph.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ConfigError {
    /// The error message.
    pub message: String,
    /// The node ids involved in the error.
    pub nodes: Vec<String>,
    /// Optional structured info.
    pub error_info: Option<ErrorInfo>,
}

impl ConfigError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            nodes: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the involved nodes.
    #[must_use]
    pub fn with_nodes(mut self, nodes: Vec<String>) -> Self {
        self.nodes = nodes;
        self
    }

    /// Sets the error info.
    #[must_use]
    pub fn with_error_info(mut self, info: ErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// Returns the error code, if any.
    pub fn code(&self) -> Option<&str> {
        self.error_info.as_ref().map(|info| info.code.as_str())
    }

    /// A pipeline key references an undefined node.
    #[must_use]
    pub fn unknown_node(id: &str) -> Self {
        Self::new(format!("Node '{id}' is not defined in the experiment nodes"))
            .with_nodes(vec![id.to_string()])
            .with_error_info(
                ErrorInfo::new(codes::UNKNOWN_NODE, "Unknown node id")
                    .with_fix_hint("Add the node to `nodes` or remove it from `pipelines`"),
            )
    }

    /// An instance id cannot be resolved.
    #[must_use]
    pub fn bad_instance(id: &str, detail: &str) -> Self {
        Self::new(format!("Invalid instance id '{id}': {detail}"))
            .with_nodes(vec![id.to_string()])
            .with_error_info(
                ErrorInfo::new(codes::BAD_INSTANCE, "Malformed instance id")
                    .with_fix_hint("Instance ids have the form `<baseId>*<suffix>`"),
            )
    }

    /// The children of a pipeline key are not an object.
    #[must_use]
    pub fn bad_adjacency(id: &str) -> Self {
        Self::new(format!("Children of '{id}' must be an object of node ids"))
            .with_nodes(vec![id.to_string()])
            .with_error_info(ErrorInfo::new(codes::BAD_ADJACENCY, "Malformed pipelines map"))
    }

    /// A node is missing a required setting.
    #[must_use]
    pub fn missing_setting(node: &str, key: &str) -> Self {
        Self::new(format!("Node '{node}' is missing required setting '{key}'"))
            .with_nodes(vec![node.to_string()])
            .with_error_info(
                ErrorInfo::new(codes::MISSING_SETTING, "Missing node setting")
                    .with_context_entry("setting", key),
            )
    }

    /// A node setting names a choice outside the allowed set.
    #[must_use]
    pub fn disallowed_choice(node: &str, field: &str, value: &str, allowed: &[&str]) -> Self {
        Self::new(format!(
            "Node '{node}': '{value}' is not an allowed value for '{field}' (allowed: {})",
            allowed.join(", ")
        ))
        .with_nodes(vec![node.to_string()])
        .with_error_info(
            ErrorInfo::new(codes::DISALLOWED_CHOICE, "Disallowed setting value")
                .with_context_entry("setting", field)
                .with_context_entry("value", value),
        )
    }

    /// A node's associated id is unusable.
    #[must_use]
    pub fn bad_association(node: &str, detail: &str) -> Self {
        Self::new(format!("Node '{node}' has an invalid association: {detail}"))
            .with_nodes(vec![node.to_string()])
            .with_error_info(ErrorInfo::new(codes::BAD_ASSOCIATION, "Invalid associated id"))
    }

    /// A node type tag is not registered.
    #[must_use]
    pub fn unknown_type(node: &str, tag: &str) -> Self {
        Self::new(format!("Node '{node}' has unknown type '{tag}'"))
            .with_nodes(vec![node.to_string()])
            .with_error_info(
                ErrorInfo::new(codes::UNKNOWN_TYPE, "Unknown node type")
                    .with_context_entry("type", tag),
            )
    }
}

/// Error raised by a node while it executes.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Node '{node_id}' failed: {message}")]
pub struct NodeError {
    /// Id of the failing node.
    pub node_id: String,
    /// What went wrong.
    pub message: String,
}

impl NodeError {
    /// Creates a new node error.
    #[must_use]
    pub fn new(node_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            message: message.into(),
        }
    }

    /// Wraps a collaborator failure, keeping its whole cause chain.
    #[must_use]
    pub fn collaborator(node_id: impl Into<String>, action: &str, err: &anyhow::Error) -> Self {
        Self::new(node_id, format!("{action}: {err:#}"))
    }

    /// Wraps a store failure.
    #[must_use]
    pub fn store(node_id: impl Into<String>, err: &StoreError) -> Self {
        Self::new(node_id, err.to_string())
    }
}

/// Errors reported by document and artifact stores.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The requested object or collection does not exist.
    #[error("Store object '{0}' not found")]
    NotFound(String),

    /// The backend rejected the operation.
    #[error("Store backend error: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_node_code() {
        let err = ConfigError::unknown_node("train*rf");
        assert_eq!(err.code(), Some(codes::UNKNOWN_NODE));
        assert_eq!(err.nodes, vec!["train*rf".to_string()]);
        assert!(err.to_string().contains("train*rf"));
    }

    #[test]
    fn test_disallowed_choice_lists_allowed() {
        let err = ConfigError::disallowed_choice(
            "combine",
            "optimize_fct",
            "bag_models",
            &["blend_models", "stack_models"],
        );
        assert!(err.message.contains("blend_models, stack_models"));
        let info = err.error_info.unwrap();
        assert_eq!(info.context.get("value").map(String::as_str), Some("bag_models"));
    }

    #[test]
    fn test_error_info_serializes() {
        let info = ConfigError::missing_setting("split", "outer_split_type").error_info.unwrap();
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["code"], codes::MISSING_SETTING);
        assert_eq!(json["context"]["setting"], "outer_split_type");
        assert_eq!(serde_json::from_value::<ErrorInfo>(json).unwrap(), info);
    }

    #[test]
    fn test_collaborator_error_keeps_chain() {
        let cause = anyhow::anyhow!("row 12 out of range").context("fit failed");
        let err = NodeError::collaborator("train", "training", &cause);
        assert_eq!(err.message, "training: fit failed: row 12 out of range");
    }

    #[test]
    fn test_medml_error_from_variants() {
        let err: MedmlError = NodeError::new("clean", "no dataset").into();
        assert_eq!(err.to_string(), "Node 'clean' failed: no dataset");

        let err: MedmlError = StoreError::NotFound("abc".into()).into();
        assert!(matches!(err, MedmlError::Store(_)));
    }
}
