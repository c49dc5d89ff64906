//! Model persistence nodes: `save_model` and `load_model`.

use base64::prelude::{Engine as _, BASE64_STANDARD};
use regex::Regex;
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use super::{BuildContext, Node, NodeCore, NodeInput};
use crate::core::{NodeOutput, NodePayload, ResultValue};
use crate::errors::{ConfigError, NodeError};
use crate::toolkit::{ArtifactStore, DataObject, ModelToolkit};

/// Extension of saved model folders.
pub const MODEL_EXTENSION: &str = ".medmodel";

const PICKLE_NAME: &str = "model.pkl";
const METADATA_NAME: &str = "metadata.json";

/// Saves every forwarded model under `<name>.medmodel`.
///
/// Each model folder holds the serialized model and a metadata document.
/// Models larger than the embedded ceiling are written to `pathSave` and
/// referenced by path. Saving a name twice overwrites its contents.
#[derive(Debug)]
pub struct SaveModelNode {
    core: NodeCore,
    model_name: Option<String>,
    path_save: Option<PathBuf>,
    parent_id: Option<String>,
    metadata: Map<String, Value>,
    ceiling: usize,
    unsafe_chars: Regex,
    artifacts: Arc<dyn ArtifactStore>,
}

impl SaveModelNode {
    /// Creates a save node.
    pub fn new(core: NodeCore, ctx: &BuildContext<'_>) -> Result<Self, ConfigError> {
        let config = ctx.config;
        let extra = |key: &str| config.extra(key).cloned().unwrap_or(Value::Null);

        let mut metadata = Map::new();
        metadata.insert("columns".into(), extra("columns"));
        metadata.insert("target".into(), extra("target_column"));
        metadata.insert("steps".into(), extra("steps"));
        metadata.insert(
            "ml_type".into(),
            config.ml_type_or(&ctx.engine.default_ml_type).into(),
        );
        for key in ["selectedTags", "selectedVariables"] {
            if let Some(value) = config.extra(key) {
                metadata.insert(key.into(), value.clone());
            }
        }

        let unsafe_chars = Regex::new(r"[^A-Za-z0-9_.\- ]")
            .map_err(|e| ConfigError::new(format!("invalid model name pattern: {e}")))?;
        Ok(Self {
            model_name: core
                .str_setting("model_name")
                .map(str::to_string)
                .or_else(|| config.model_name.clone()),
            path_save: core
                .str_setting("pathSave")
                .or_else(|| config.extra("pathSave").and_then(Value::as_str))
                .map(PathBuf::from),
            parent_id: config
                .extra("identifiers")
                .and_then(|ids| ids.get("models"))
                .and_then(Value::as_str)
                .map(str::to_string),
            metadata,
            ceiling: ctx.engine.embedded_model_ceiling(),
            unsafe_chars,
            artifacts: Arc::clone(&ctx.services.artifacts),
            core,
        })
    }

    fn file_name(&self, name: &str) -> String {
        self.unsafe_chars.replace_all(name, "_").into_owned()
    }

    /// Inserts `object`, overwriting the content of an existing sibling.
    fn upsert(&self, object: DataObject, content: Value) -> Result<String, NodeError> {
        let fresh_id = object.id.clone();
        let id = self
            .artifacts
            .insert_if_absent(object, Some(vec![content.clone()]))
            .map_err(|e| NodeError::store(self.core.id().as_str(), &e))?;
        if id != fresh_id {
            self.artifacts
                .overwrite_content(&id, vec![content])
                .map_err(|e| NodeError::store(self.core.id().as_str(), &e))?;
        }
        Ok(id)
    }
}

impl Node for SaveModelNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn run(&mut self, input: NodeInput<'_>) -> Result<NodeOutput, NodeError> {
        let id = self.core.id().to_string();
        let models = input.upstream.models();
        if models.is_empty() {
            return Err(self.core.fail("no models to save"));
        }
        let session = input.experiment.require_session(&id)?;

        let mut output = NodeOutput::new();
        for model in models {
            let name = self.file_name(self.model_name.as_deref().unwrap_or_else(|| model.name()));
            let bytes = session
                .serialize_model(model)
                .map_err(|e| NodeError::collaborator(&id, "serializing model", &e))?;

            let folder = DataObject::new(format!("{name}{MODEL_EXTENSION}"), "medmodel", self.parent_id.clone());
            let (folder, content) = if bytes.len() <= self.ceiling {
                (folder, json!({"model": BASE64_STANDARD.encode(&bytes)}))
            } else {
                let Some(ref dir) = self.path_save else {
                    return Err(self.core.fail(format!(
                        "model '{name}' is {} bytes, above the {} byte limit, and no pathSave is set",
                        bytes.len(),
                        self.ceiling
                    )));
                };
                let path = dir.join(format!("{name}_model.pkl"));
                std::fs::create_dir_all(dir)
                    .and_then(|()| std::fs::write(&path, &bytes))
                    .map_err(|e| self.core.fail(format!("writing {}: {e}", path.display())))?;
                let path = path.to_string_lossy().into_owned();
                warn!(node_id = %id, model = %name, bytes = bytes.len(), path = %path, "model stored on disk");
                (folder.with_path(path.clone()), json!({"model_path": path}))
            };

            let folder_id = self
                .artifacts
                .insert_if_absent(folder, None)
                .map_err(|e| NodeError::store(&id, &e))?;
            self.upsert(DataObject::new(PICKLE_NAME, "pkl", Some(folder_id.clone())), content)?;

            let mut metadata = self.metadata.clone();
            if let Some(threshold) = model.probability_threshold() {
                metadata.insert("model_threshold".into(), threshold.into());
            }
            let metadata_id = self.upsert(
                DataObject::new(METADATA_NAME, "json", Some(folder_id)),
                Value::Object(metadata),
            )?;
            info!(node_id = %id, model = %name, metadata_id = %metadata_id, "model saved");
            output.insert(name, ResultValue::Json(metadata_id.into()));
        }
        Ok(output)
    }
}

/// Restores a saved model and forwards it.
#[derive(Debug)]
pub struct LoadModelNode {
    core: NodeCore,
    folder_id: String,
    folder_name: String,
    artifacts: Arc<dyn ArtifactStore>,
    toolkit: Arc<dyn ModelToolkit>,
}

impl LoadModelNode {
    /// Creates a load node.
    pub fn new(core: NodeCore, ctx: &BuildContext<'_>) -> Result<Self, ConfigError> {
        let id = core.id().to_string();
        let reference = core.require_setting("model_to_load")?;
        let folder_id = reference
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ConfigError::missing_setting(&id, "model_to_load.id"))?
            .to_string();
        let folder_name = reference
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(folder_id.as_str())
            .trim_end_matches(MODEL_EXTENSION)
            .to_string();
        Ok(Self {
            core,
            folder_id,
            folder_name,
            artifacts: Arc::clone(&ctx.services.artifacts),
            toolkit: Arc::clone(&ctx.services.toolkit),
        })
    }

    fn read_bytes(&self) -> Result<Vec<u8>, NodeError> {
        let id = self.core.id().as_str();
        let pickle_id = self
            .artifacts
            .child_id_by_name(&self.folder_id, PICKLE_NAME)
            .map_err(|e| NodeError::store(id, &e))?
            .ok_or_else(|| self.core.fail(format!("'{}' has no {PICKLE_NAME}", self.folder_name)))?;
        let content = self
            .artifacts
            .read_content(&pickle_id)
            .map_err(|e| NodeError::store(id, &e))?;
        let document = content
            .first()
            .ok_or_else(|| self.core.fail(format!("{PICKLE_NAME} of '{}' is empty", self.folder_name)))?;

        if let Some(encoded) = document.get("model").and_then(Value::as_str) {
            BASE64_STANDARD
                .decode(encoded)
                .map_err(|e| self.core.fail(format!("decoding model: {e}")))
        } else if let Some(path) = document.get("model_path").and_then(Value::as_str) {
            std::fs::read(path).map_err(|e| self.core.fail(format!("reading {path}: {e}")))
        } else {
            Err(self.core.fail(format!("{PICKLE_NAME} of '{}' holds no model", self.folder_name)))
        }
    }
}

impl Node for LoadModelNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn run(&mut self, _input: NodeInput<'_>) -> Result<NodeOutput, NodeError> {
        let id = self.core.id().to_string();
        let bytes = self.read_bytes()?;
        let model = self
            .toolkit
            .deserialize_model(&bytes)
            .map_err(|e| NodeError::collaborator(&id, "loading model", &e))?;
        info!(node_id = %id, model = %model.name(), "model loaded");

        self.core.publish(
            NodePayload::new()
                .with_models(vec![Arc::clone(&model)])
                .with_value("id", id),
        );
        Ok(NodeOutput::new()
            .with_value("model_name", self.folder_name.clone())
            .with_value(model.name(), model.describe()))
    }
}
