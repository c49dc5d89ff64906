//! Mock collaborators and nodes for testing.

use anyhow::{anyhow, bail};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::context::{ExperimentContext, Table};
use crate::core::{NodeKind, NodeOutput};
use crate::errors::{ConfigError, NodeError, StoreError};
use crate::nodes::{BuildContext, Node, NodeCore, NodeInput};
use crate::toolkit::{
    ArtifactStore, DataObject, DocumentStore, FittedModel, ModelHandle, ModelSession, ModelToolkit,
    Options, Record,
};

/// Shared, ordered record of collaborator calls.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    /// Records a call.
    pub fn push(&self, call: impl Into<String>) {
        self.0.lock().push(call.into());
    }

    /// Every call so far.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    /// Number of calls starting with `prefix`.
    #[must_use]
    pub fn count(&self, prefix: &str) -> usize {
        self.0.lock().iter().filter(|c| c.starts_with(prefix)).count()
    }

    /// Forgets every call.
    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

/// A fitted model that is only a name and parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct MockModel {
    name: String,
    params: Value,
    threshold: Option<f64>,
}

impl MockModel {
    /// Creates a model with no parameters.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: json!({}),
            threshold: None,
        }
    }

    /// Sets the parameters.
    #[must_use]
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    /// Sets the decision threshold.
    #[must_use]
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    /// Wraps the model in a shared handle.
    #[must_use]
    pub fn into_handle(self) -> ModelHandle {
        Arc::new(self)
    }
}

impl FittedModel for MockModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn describe(&self) -> Value {
        self.params.clone()
    }

    fn probability_threshold(&self) -> Option<f64> {
        self.threshold
    }
}

/// Copies `model` with `extra` merged into its parameters.
fn derive(model: &ModelHandle, extra: Value) -> ModelHandle {
    let mut params = model.describe().as_object().cloned().unwrap_or_default();
    if let Value::Object(extra) = extra {
        params.extend(extra);
    }
    let mut copy = MockModel::new(model.name()).with_params(Value::Object(params));
    copy.threshold = model.probability_threshold();
    copy.into_handle()
}

fn names(models: &[ModelHandle]) -> Vec<String> {
    models.iter().map(|m| m.name().to_string()).collect()
}

/// A session that records every verb and returns [`MockModel`]s.
#[derive(Debug, Clone)]
pub struct MockSession {
    log: CallLog,
    rows: usize,
    estimators: Vec<String>,
}

impl MockSession {
    /// Creates a session logging into `log`.
    #[must_use]
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            rows: 0,
            estimators: vec!["lr".into(), "rf".into(), "knn".into()],
        }
    }

    fn check_rows(&self, rows: &[usize]) -> anyhow::Result<()> {
        match rows.iter().find(|&&r| r >= self.rows) {
            Some(r) => bail!("row index {r} out of range for {} rows", self.rows),
            None => Ok(()),
        }
    }
}

impl ModelSession for MockSession {
    fn clone_box(&self) -> Box<dyn ModelSession> {
        Box::new(self.clone())
    }

    fn setup(&mut self, data: &Table, _options: &Options) -> anyhow::Result<()> {
        self.log.push("setup");
        self.rows = data.len();
        Ok(())
    }

    fn available_estimators(&self) -> Vec<String> {
        self.estimators.clone()
    }

    fn compare_models(&mut self, _options: &Options) -> anyhow::Result<Vec<ModelHandle>> {
        self.log.push("compare_models");
        Ok(self
            .estimators
            .iter()
            .take(2)
            .map(|e| MockModel::new(e.clone()).into_handle())
            .collect())
    }

    fn create_model(&mut self, estimator: &str, options: &Options) -> anyhow::Result<Vec<ModelHandle>> {
        self.log.push(format!("create_model:{estimator}"));
        Ok(vec![MockModel::new(estimator)
            .with_params(Value::Object(options.clone()))
            .into_handle()])
    }

    fn tune_model(&mut self, model: &ModelHandle, _options: &Options) -> anyhow::Result<ModelHandle> {
        self.log.push("tune_model");
        Ok(derive(model, json!({"tuned": true})))
    }

    fn ensemble_model(&mut self, model: &ModelHandle, _options: &Options) -> anyhow::Result<ModelHandle> {
        self.log.push("ensemble_model");
        Ok(MockModel::new("BaggingClassifier")
            .with_params(json!({"base": model.name()}))
            .into_handle())
    }

    fn calibrate_model(&mut self, model: &ModelHandle, _options: &Options) -> anyhow::Result<ModelHandle> {
        self.log.push("calibrate_model");
        Ok(MockModel::new("CalibratedClassifierCV")
            .with_params(json!({"base": model.name()}))
            .into_handle())
    }

    fn blend_models(&mut self, models: &[ModelHandle], _options: &Options) -> anyhow::Result<ModelHandle> {
        self.log.push("blend_models");
        Ok(MockModel::new("VotingClassifier")
            .with_params(json!({"members": names(models)}))
            .into_handle())
    }

    fn stack_models(&mut self, models: &[ModelHandle], _options: &Options) -> anyhow::Result<ModelHandle> {
        self.log.push("stack_models");
        Ok(MockModel::new("StackingClassifier")
            .with_params(json!({"members": names(models)}))
            .into_handle())
    }

    fn finalize_model(&mut self, model: &ModelHandle) -> anyhow::Result<ModelHandle> {
        self.log.push("finalize_model");
        Ok(derive(model, json!({"finalized": true})))
    }

    fn fit_on_rows(&mut self, estimator: &str, options: &Options, rows: &[usize]) -> anyhow::Result<ModelHandle> {
        self.log.push(format!("fit_on_rows:{estimator}"));
        self.check_rows(rows)?;
        let mut params = options.clone();
        params.insert("train_rows".into(), rows.len().into());
        Ok(MockModel::new(estimator).with_params(Value::Object(params)).into_handle())
    }

    #[allow(clippy::cast_precision_loss)]
    fn score_on_rows(&mut self, _model: &ModelHandle, rows: &[usize], metric: &str) -> anyhow::Result<f64> {
        self.log.push(format!("score_on_rows:{metric}"));
        self.check_rows(rows)?;
        Ok(rows.len() as f64)
    }

    fn fit_full(&mut self, model: &ModelHandle) -> anyhow::Result<ModelHandle> {
        self.log.push("fit_full");
        Ok(derive(model, json!({"full_fit": true})))
    }

    fn serialize_model(&self, model: &ModelHandle) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(&json!({
            "name": model.name(),
            "params": model.describe(),
            "threshold": model.probability_threshold(),
        }))?)
    }
}

/// A toolkit whose sessions all log into one [`CallLog`].
#[derive(Debug, Clone, Default)]
pub struct MockToolkit {
    log: CallLog,
}

impl MockToolkit {
    /// Creates a toolkit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared call log.
    pub fn log(&self) -> &CallLog {
        &self.log
    }
}

impl ModelToolkit for MockToolkit {
    fn new_session(&self, ml_type: &str) -> anyhow::Result<Box<dyn ModelSession>> {
        self.log.push(format!("new_session:{ml_type}"));
        Ok(Box::new(MockSession::new(self.log.clone())))
    }

    fn deserialize_model(&self, bytes: &[u8]) -> anyhow::Result<ModelHandle> {
        let document: Value = serde_json::from_slice(bytes)?;
        let name = document["name"]
            .as_str()
            .ok_or_else(|| anyhow!("serialized model has no name"))?;
        let mut model = MockModel::new(name).with_params(document["params"].clone());
        model.threshold = document["threshold"].as_f64();
        Ok(model.into_handle())
    }
}

/// Document store backed by a map of collections.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    collections: RwLock<HashMap<String, Vec<Record>>>,
}

impl InMemoryDocumentStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a collection.
    pub fn insert(&self, id: impl Into<String>, records: Vec<Record>) {
        self.collections.write().insert(id.into(), records);
    }
}

impl DocumentStore for InMemoryDocumentStore {
    fn read_collection(&self, id: &str) -> Result<Vec<Record>, StoreError> {
        self.collections
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

/// Artifact store backed by a flat list of objects.
#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    objects: RwLock<Vec<(DataObject, Vec<Value>)>>,
}

impl InMemoryArtifactStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Finds an object by name anywhere in the store.
    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<DataObject> {
        self.objects
            .read()
            .iter()
            .find(|(o, _)| o.name == name)
            .map(|(o, _)| o.clone())
    }

    /// Number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// True when nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

impl ArtifactStore for InMemoryArtifactStore {
    fn insert_if_absent(&self, object: DataObject, content: Option<Vec<Value>>) -> Result<String, StoreError> {
        let mut objects = self.objects.write();
        if let Some((existing, _)) = objects
            .iter()
            .find(|(o, _)| o.name == object.name && o.parent_id == object.parent_id)
        {
            return Ok(existing.id.clone());
        }
        let id = object.id.clone();
        objects.push((object, content.unwrap_or_default()));
        Ok(id)
    }

    fn overwrite_content(&self, id: &str, content: Vec<Value>) -> Result<(), StoreError> {
        let mut objects = self.objects.write();
        let (_, stored) = objects
            .iter_mut()
            .find(|(o, _)| o.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        *stored = content;
        Ok(())
    }

    fn child_id_by_name(&self, parent_id: &str, name: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .objects
            .read()
            .iter()
            .find(|(o, _)| o.parent_id.as_deref() == Some(parent_id) && o.name == name)
            .map(|(o, _)| o.id.clone()))
    }

    fn read_content(&self, id: &str) -> Result<Vec<Value>, StoreError> {
        self.objects
            .read()
            .iter()
            .find(|(o, _)| o.id == id)
            .map(|(_, content)| content.clone())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

/// Ordered record of node executions.
#[derive(Debug, Clone, Default)]
pub struct ExecutionLog(Arc<Mutex<Vec<String>>>);

impl ExecutionLog {
    /// Records an execution.
    pub fn record(&self, id: impl Into<String>) {
        self.0.lock().push(id.into());
    }

    /// Executed node ids, in order.
    #[must_use]
    pub fn order(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    /// Number of executions of `id`.
    #[must_use]
    pub fn count(&self, id: &str) -> usize {
        self.0.lock().iter().filter(|e| *e == id).count()
    }

    /// Total number of executions.
    #[must_use]
    pub fn total(&self) -> usize {
        self.0.lock().len()
    }

    /// Forgets every execution.
    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

/// A node that records its executions and forwards its upstream payload.
///
/// Dataset-kind counting nodes open a context with a [`MockSession`];
/// model-producing kinds forward one [`MockModel`] named after the node. A
/// `fail: true` setting makes the node fail.
#[derive(Debug)]
pub struct CountingNode {
    core: NodeCore,
    log: ExecutionLog,
}

impl CountingNode {
    /// Creates a counting node.
    #[must_use]
    pub fn new(core: NodeCore, log: ExecutionLog) -> Self {
        Self { core, log }
    }

    /// A registry factory building counting nodes that share `log`.
    pub fn factory(
        log: ExecutionLog,
    ) -> impl Fn(NodeCore, &BuildContext<'_>) -> Result<Box<dyn Node>, ConfigError> + Send + Sync + 'static {
        move |core, _| Ok(Box::new(Self::new(core, log.clone())))
    }
}

impl Node for CountingNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn run(&mut self, input: NodeInput<'_>) -> Result<NodeOutput, NodeError> {
        let id = self.core.id().to_string();
        if self.core.setting("fail").and_then(Value::as_bool).unwrap_or(false) {
            return Err(self.core.fail("configured to fail"));
        }
        self.log.record(id.clone());

        let mut info = input.upstream.clone().with_value("id", id.clone());
        if self.core.kind().produces_models() {
            info = info.with_models(vec![MockModel::new(id.clone()).into_handle()]);
        }
        self.core.publish(info);

        let output = NodeOutput::new()
            .with_value("visited", id)
            .with_value("upstream", input.upstream_id.map(ToString::to_string));
        if self.core.kind() == NodeKind::Dataset {
            let mut rows = Map::new();
            rows.insert("x".into(), 1.into());
            return Ok(output.with_experiment(
                ExperimentContext::new()
                    .with_dataset(Table::from_records(vec![rows]))
                    .with_session(Box::new(MockSession::new(CallLog::default()))),
            ));
        }
        Ok(output)
    }
}
