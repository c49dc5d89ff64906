//! Document and artifact store traits.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::Debug;

use crate::errors::StoreError;

/// A row of a dataset collection.
pub type Record = Map<String, Value>;

/// Read access to dataset collections.
#[cfg_attr(test, mockall::automock)]
pub trait DocumentStore: Debug + Send + Sync {
    /// Reads every record of a collection.
    fn read_collection(&self, id: &str) -> Result<Vec<Record>, StoreError>;
}

/// Metadata of an object in the artifact store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataObject {
    /// Object id.
    pub id: String,
    /// File name, unique among siblings.
    pub name: String,
    /// Object type (`medmodel`, `pkl`, `json`).
    #[serde(rename = "type")]
    pub object_type: String,
    /// Parent folder id.
    #[serde(rename = "parentID", default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Whether the object also exists on disk.
    #[serde(rename = "inWorkspace", default)]
    pub in_workspace: bool,
    /// Path on disk, when `in_workspace` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Creation time.
    #[serde(rename = "createdAt")]
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl DataObject {
    /// Creates a new object with a fresh id.
    #[must_use]
    pub fn new(name: impl Into<String>, object_type: impl Into<String>, parent_id: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            object_type: object_type.into(),
            parent_id,
            in_workspace: false,
            path: None,
            created_at: chrono::Utc::now(),
        }
    }

    /// Marks the object as stored on disk at `path`.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.in_workspace = true;
        self.path = Some(path.into());
        self
    }
}

/// Hierarchical store for saved model artifacts.
pub trait ArtifactStore: Debug + Send + Sync {
    /// Inserts `object` unless a sibling with the same name exists.
    /// Returns the id of the stored object, new or existing.
    fn insert_if_absent(&self, object: DataObject, content: Option<Vec<Value>>) -> Result<String, StoreError>;

    /// Replaces the content of an existing object.
    fn overwrite_content(&self, id: &str, content: Vec<Value>) -> Result<(), StoreError>;

    /// Finds a child of `parent_id` by name.
    fn child_id_by_name(&self, parent_id: &str, name: &str) -> Result<Option<String>, StoreError>;

    /// Reads the content of an object.
    fn read_content(&self, id: &str) -> Result<Vec<Value>, StoreError>;
}
