//! Node payloads and execution outputs.

use serde_json::{Map, Value};

use crate::context::ExperimentContext;
use crate::toolkit::ModelHandle;

/// Key a join node sets to `false` while it waits for more branches.
pub const PREV_NODE_COMPLETE: &str = "prev_node_complete";

/// The keyword payload a node hands to its children.
///
/// JSON values travel in `values`; fitted models travel next to them since
/// they cannot be serialized.
#[derive(Debug, Clone, Default)]
pub struct NodePayload {
    values: Map<String, Value>,
    models: Vec<ModelHandle>,
}

impl NodePayload {
    /// Creates an empty payload.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a payload from JSON values.
    #[must_use]
    pub fn from_values(values: Map<String, Value>) -> Self {
        Self {
            values,
            models: Vec::new(),
        }
    }

    /// Adds a value.
    #[must_use]
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Sets the models.
    #[must_use]
    pub fn with_models(mut self, models: Vec<ModelHandle>) -> Self {
        self.models = models;
        self
    }

    /// Inserts a value in place.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    /// Returns a value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Returns a string value.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    /// Returns a boolean value; absent means false.
    pub fn flag(&self, key: &str) -> bool {
        self.values.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Returns an object value.
    pub fn get_object(&self, key: &str) -> Option<&Map<String, Value>> {
        self.values.get(key).and_then(Value::as_object)
    }

    /// All JSON values.
    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    /// Models carried by the payload.
    pub fn models(&self) -> &[ModelHandle] {
        &self.models
    }

    /// True when the payload carries nothing.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.models.is_empty()
    }
}

/// One entry of a node output.
#[derive(Debug, Clone)]
pub enum ResultValue {
    /// A JSON-serializable value.
    Json(Value),
    /// Fitted models; never recorded in the results tree.
    Models(Vec<ModelHandle>),
}

impl ResultValue {
    /// Returns the JSON value, if serializable.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Models(_) => None,
        }
    }
}

/// What a node's execution returns.
///
/// Entries keep insertion order. A node may return a replacement experiment
/// context; the engine then hands that one to the node's children.
#[derive(Debug, Default)]
pub struct NodeOutput {
    entries: Vec<(String, ResultValue)>,
    experiment: Option<ExperimentContext>,
}

impl NodeOutput {
    /// Creates an empty output.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the output of a join node still waiting for branches.
    #[must_use]
    pub fn held() -> Self {
        Self::new().with_value(PREV_NODE_COMPLETE, false)
    }

    /// Creates an output reporting a recoverable problem.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::new().with_value("error", message.into())
    }

    /// Adds a JSON entry.
    #[must_use]
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, ResultValue::Json(value.into()));
        self
    }

    /// Adds a models entry.
    #[must_use]
    pub fn with_models(mut self, key: impl Into<String>, models: Vec<ModelHandle>) -> Self {
        self.insert(key, ResultValue::Models(models));
        self
    }

    /// Sets the replacement experiment context.
    #[must_use]
    pub fn with_experiment(mut self, experiment: ExperimentContext) -> Self {
        self.experiment = Some(experiment);
        self
    }

    /// Inserts an entry, replacing any previous entry with the same key.
    pub fn insert(&mut self, key: impl Into<String>, value: ResultValue) {
        let key = key.into();
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    /// Returns an entry.
    pub fn get(&self, key: &str) -> Option<&ResultValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Returns a JSON entry.
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.get(key).and_then(ResultValue::as_json)
    }

    /// Returns a models entry.
    pub fn models(&self, key: &str) -> Option<&[ModelHandle]> {
        match self.get(key) {
            Some(ResultValue::Models(models)) => Some(models),
            _ => None,
        }
    }

    /// Entries in insertion order.
    pub fn entries(&self) -> &[(String, ResultValue)] {
        &self.entries
    }

    /// False only when the node reported it is waiting for more branches.
    pub fn is_complete(&self) -> bool {
        self.value(PREV_NODE_COMPLETE) != Some(&Value::Bool(false))
    }

    /// True when a replacement context is attached.
    pub fn has_experiment(&self) -> bool {
        self.experiment.is_some()
    }

    /// Removes the replacement context.
    pub fn take_experiment(&mut self) -> Option<ExperimentContext> {
        self.experiment.take()
    }

    /// The serializable entries, in insertion order.
    pub fn json_data(&self) -> Map<String, Value> {
        self.entries
            .iter()
            .filter_map(|(k, v)| v.as_json().map(|v| (k.clone(), v.clone())))
            .collect()
    }
}
