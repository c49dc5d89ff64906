//! The JSON results tree.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::graph::NodeResults;
use crate::errors::MedmlError;

/// Results of a run, shaped like the adjacency map.
///
/// Every visited position becomes
/// `{id: {"next_nodes": {...}, "results": {"prev_node_id", "data"}}}`.
/// Children that were not visited keep their raw adjacency entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultsTree(Map<String, Value>);

impl ResultsTree {
    /// Creates an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Top-level entries.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub(super) fn as_map_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.0
    }

    /// The tree as a JSON value.
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// True when nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The slot of the node reached by following `path` from a root.
    pub fn entry_at(&self, path: &[&str]) -> Option<&Map<String, Value>> {
        let (last, parents) = path.split_last()?;
        let mut level = &self.0;
        for id in parents {
            level = level.get(*id)?.get("next_nodes")?.as_object()?;
        }
        level.get(*last)?.as_object()
    }

    /// The `results` recorded at `path`.
    pub fn results_at(&self, path: &[&str]) -> Option<&Value> {
        self.entry_at(path)?.get("results")
    }

    /// The `results.data` recorded at `path`.
    pub fn data_at(&self, path: &[&str]) -> Option<&Value> {
        self.results_at(path)?.get("data")
    }
}

/// Writes a node slot into `slot` and returns its `next_nodes` map.
///
/// `next_nodes` starts as a copy of the node's adjacency children.
pub(super) fn record_entry<'a>(
    slot: &'a mut Map<String, Value>,
    id: &str,
    children: &Map<String, Value>,
    results: &NodeResults,
) -> Result<&'a mut Map<String, Value>, MedmlError> {
    let mut entry = Map::new();
    entry.insert("next_nodes".into(), Value::Object(children.clone()));
    entry.insert("results".into(), results.to_value());
    slot.insert(id.to_string(), Value::Object(entry));

    slot.get_mut(id)
        .and_then(|entry| entry.get_mut("next_nodes"))
        .and_then(Value::as_object_mut)
        .ok_or_else(|| MedmlError::Internal(format!("results slot for '{id}' vanished")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{NodeId, NodeOutput};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_record_entry_nests_children() {
        let mut tree = ResultsTree::new();
        let children = json!({"s": {"t": {}}});
        let d = NodeResults::from_output(None, &NodeOutput::new().with_value("rows", 3));
        let next = record_entry(tree.as_map_mut(), "d", children.as_object().unwrap(), &d).unwrap();

        let s = NodeResults::from_output(Some(&NodeId::from("d")), &NodeOutput::new());
        record_entry(next, "s", json!({"t": {}}).as_object().unwrap(), &s).unwrap();

        assert_eq!(
            tree.to_value(),
            json!({
                "d": {
                    "next_nodes": {
                        "s": {
                            "next_nodes": {"t": {}},
                            "results": {"prev_node_id": "d", "data": {}}
                        }
                    },
                    "results": {"prev_node_id": null, "data": {"rows": 3}}
                }
            })
        );
        assert_eq!(tree.data_at(&["d"]), Some(&json!({"rows": 3})));
        assert_eq!(tree.data_at(&["d", "s"]), Some(&json!({})));
        assert!(tree.data_at(&["d", "s", "t"]).is_none());
    }

    #[test]
    fn test_serializes_transparently() {
        let mut tree = ResultsTree::new();
        record_entry(tree.as_map_mut(), "d", &Map::new(), &NodeResults::default()).unwrap();
        let json = serde_json::to_value(&tree).unwrap();
        assert!(json.get("d").is_some());
    }
}
