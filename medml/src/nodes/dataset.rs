//! Dataset node: loads one collection or merges several.

use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

use super::{BuildContext, Node, NodeCore, NodeInput};
use crate::context::{ExperimentContext, Table};
use crate::core::{NodeOutput, NodePayload};
use crate::errors::{ConfigError, NodeError};
use crate::toolkit::DocumentStore;

/// Settings forwarded to the clean node's session setup.
pub const SETUP_KEYS: &[&str] = &[
    "session_id",
    "train_size",
    "shuffle",
    "data_split_stratify",
    "fold_strategy",
    "fold",
    "fold_shuffle",
    "numeric_features",
    "categorical_features",
    "ignore_features",
    "ordinal_features",
    "date_features",
    "text_features",
    "keep_features",
    "index",
    "preprocess",
    "imputation_type",
    "normalize",
    "normalize_method",
    "transformation",
    "remove_outliers",
    "fix_imbalance",
    "use_gpu",
];

/// Separates a file tag from a column name in merged datasets.
const COLUMN_TAG_SEPARATOR: &str = "_|_";

#[derive(Debug, Clone)]
enum Files {
    Single(String),
    Merge(Vec<String>),
}

/// Loads the experiment dataset.
///
/// A single file reference loads one collection as-is. A list of references
/// is outer-merged on the first column and the target, then restricted to
/// the selected variables and tags.
#[derive(Debug)]
pub struct DatasetNode {
    core: NodeCore,
    files: Files,
    target: Option<String>,
    selected: BTreeSet<String>,
    documents: Arc<dyn DocumentStore>,
}

impl DatasetNode {
    /// Creates a dataset node.
    pub fn new(core: NodeCore, ctx: &BuildContext<'_>) -> Result<Self, ConfigError> {
        let id = core.id().to_string();
        let files = match core.require_setting("files")? {
            Value::Object(file) => Files::Single(file_id(file).ok_or_else(|| ConfigError::missing_setting(&id, "files.id"))?),
            Value::Array(files) => Files::Merge(
                files
                    .iter()
                    .filter_map(Value::as_object)
                    .map(|f| file_id(f).ok_or_else(|| ConfigError::missing_setting(&id, "files[].id")))
                    .collect::<Result<_, _>>()?,
            ),
            _ => return Err(ConfigError::missing_setting(&id, "files")),
        };
        let target = core.str_setting("target").map(str::to_string);
        if matches!(files, Files::Merge(_)) && target.is_none() {
            return Err(ConfigError::missing_setting(&id, "target"));
        }
        let selected = ["variables", "tags"]
            .iter()
            .filter_map(|key| core.setting(key).and_then(Value::as_array))
            .flatten()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
        Ok(Self {
            core,
            files,
            target,
            selected,
            documents: Arc::clone(&ctx.services.documents),
        })
    }

    fn read(&self, collection: &str) -> Result<Table, NodeError> {
        let mut records = self
            .documents
            .read_collection(collection)
            .map_err(|e| NodeError::store(self.core.id().as_str(), &e))?;
        for record in &mut records {
            record.remove("_id");
        }
        Ok(Table::from_records(records))
    }

    fn merge(&self, collections: &[String]) -> Result<Table, NodeError> {
        let tables = collections
            .iter()
            .map(|c| self.read(c))
            .collect::<Result<Vec<_>, _>>()?;
        let mut tables = tables.into_iter().filter(|t| !t.columns().is_empty());
        let Some(first) = tables.next() else {
            return Err(self.core.fail("no non-empty file to merge"));
        };
        let target = self.target.clone().unwrap_or_default();
        let Some(index) = first.columns().first().cloned() else {
            return Err(self.core.fail("first file has no columns"));
        };
        let keys = [index.clone(), target.clone()];
        let merged = tables.fold(first, |acc, table| acc.outer_merge(&table, &keys));

        if self.selected.is_empty() {
            return Ok(merged);
        }
        Ok(merged.select(|column| {
            column == index
                || column == target
                || column
                    .split_once(COLUMN_TAG_SEPARATOR)
                    .is_some_and(|(_, base)| self.selected.contains(base))
                || self.selected.contains(column)
        }))
    }
}

fn file_id(file: &Map<String, Value>) -> Option<String> {
    file.get("id").and_then(Value::as_str).map(str::to_string)
}

impl Node for DatasetNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn run(&mut self, _input: NodeInput<'_>) -> Result<NodeOutput, NodeError> {
        let table = match &self.files {
            Files::Single(collection) => self.read(collection)?,
            Files::Merge(collections) => self.merge(collections)?,
        };
        debug!(node_id = %self.core.id(), rows = table.len(), columns = table.columns().len(), "dataset loaded");

        let setup: Map<String, Value> = self
            .core
            .settings()
            .iter()
            .filter(|(k, _)| SETUP_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut info = NodePayload::new()
            .with_value("dataset_columns", table.columns().to_vec())
            .with_value("splitted", false)
            .with_value("dataset_setup_settings", setup);
        if let Some(ref target) = self.target {
            info.insert("target", target.clone());
        }
        self.core.publish(info);

        Ok(NodeOutput::new()
            .with_value("rows", table.len())
            .with_value("columns", table.columns().to_vec())
            .with_experiment(ExperimentContext::new().with_dataset(table)))
    }
}
