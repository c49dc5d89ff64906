//! Node identifiers.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Separates a base node id from an instance suffix (`train*rf`).
pub const INSTANCE_SEPARATOR: char = '*';

/// Separates the branch ids listed in a join node's associated id.
pub const ASSOCIATION_SEPARATOR: char = '.';

/// Id given to the synthetic save node.
pub const SAVE_NODE_ID: &str = "save";

/// A node id as it appears in the pipelines map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for `<base>*<suffix>` ids.
    pub fn is_instance(&self) -> bool {
        self.0.contains(INSTANCE_SEPARATOR)
    }

    /// Splits an instance id at its first separator.
    pub fn instance_parts(&self) -> Option<(&str, &str)> {
        self.0.split_once(INSTANCE_SEPARATOR)
    }

    /// The id before the instance separator, or the whole id.
    pub fn base(&self) -> &str {
        self.instance_parts().map_or(self.as_str(), |(base, _)| base)
    }

    /// The instance suffix, if any.
    pub fn suffix(&self) -> Option<&str> {
        self.instance_parts().map(|(_, suffix)| suffix)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for NodeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Parses a join node's associated id (`t1.t2`) into its sorted branch ids.
pub fn association_branches(associated: &str) -> Vec<String> {
    let mut branches: Vec<String> = associated
        .split(ASSOCIATION_SEPARATOR)
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .map(str::to_string)
        .collect();
    branches.sort();
    branches.dedup();
    branches
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_id() {
        let id = NodeId::from("dataset");
        assert!(!id.is_instance());
        assert_eq!(id.base(), "dataset");
        assert_eq!(id.suffix(), None);
    }

    #[test]
    fn test_instance_id() {
        let id = NodeId::from("train*rf");
        assert!(id.is_instance());
        assert_eq!(id.base(), "train");
        assert_eq!(id.suffix(), Some("rf"));
        assert_eq!(id.to_string(), "train*rf");
    }

    #[test]
    fn test_association_branches_sorted() {
        assert_eq!(association_branches("t2.t1"), vec!["t1", "t2"]);
        assert_eq!(association_branches("t1..t1"), vec!["t1"]);
        assert!(association_branches("").is_empty());
    }

    #[test]
    fn test_serde_transparent() {
        let id: NodeId = serde_json::from_str("\"split\"").unwrap();
        assert_eq!(id.as_str(), "split");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"split\"");
    }
}
