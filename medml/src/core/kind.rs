//! Node kinds.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The kind of work a node performs, parsed from its type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Loads tabular data.
    Dataset,
    /// Opens a modelling session over the dataset.
    Clean,
    /// Computes train/test folds.
    Split,
    /// Trains one estimator.
    TrainModel,
    /// Trains and ranks every available estimator.
    CompareModels,
    /// Joins trained models from several branches and combines them.
    CombineModels,
    /// Joins trained models from several branches.
    GroupModels,
    /// Persists models to the artifact store.
    SaveModel,
    /// Restores a model from the artifact store.
    LoadModel,
}

impl NodeKind {
    /// Every kind, in pipeline order.
    pub const ALL: [Self; 9] = [
        Self::Dataset,
        Self::Clean,
        Self::Split,
        Self::TrainModel,
        Self::CompareModels,
        Self::CombineModels,
        Self::GroupModels,
        Self::SaveModel,
        Self::LoadModel,
    ];

    /// Returns the type tag.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dataset => "dataset",
            Self::Clean => "clean",
            Self::Split => "split",
            Self::TrainModel => "train_model",
            Self::CompareModels => "compare_models",
            Self::CombineModels => "combine_models",
            Self::GroupModels => "group_models",
            Self::SaveModel => "save_model",
            Self::LoadModel => "load_model",
        }
    }

    /// Join nodes wait for every upstream branch before completing.
    pub const fn is_join(self) -> bool {
        matches!(self, Self::CombineModels | Self::GroupModels)
    }

    /// Nodes that fit estimators.
    pub const fn is_training(self) -> bool {
        matches!(self, Self::TrainModel | Self::CompareModels)
    }

    /// Nodes whose payload carries models for downstream nodes.
    pub const fn produces_models(self) -> bool {
        self.is_training() || self.is_join() || matches!(self, Self::LoadModel)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A type tag that names no known node kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownNodeKind(pub String);

impl FromStr for NodeKind {
    type Err = UnknownNodeKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownNodeKind(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_round_trip_through_from_str() {
        for kind in NodeKind::ALL {
            assert_eq!(kind.as_str().parse::<NodeKind>().unwrap(), kind);
        }
        assert!("train".parse::<NodeKind>().is_err());
    }

    #[test]
    fn test_serde_uses_tags() {
        assert_eq!(serde_json::to_string(&NodeKind::CombineModels).unwrap(), "\"combine_models\"");
    }

    #[test]
    fn test_classification() {
        assert!(NodeKind::GroupModels.is_join());
        assert!(!NodeKind::TrainModel.is_join());
        assert!(NodeKind::CompareModels.is_training());
        assert!(NodeKind::LoadModel.produces_models());
        assert!(!NodeKind::Split.produces_models());
    }
}
