//! Collaborator interfaces the nodes call into.
//!
//! The engine never fits models or touches storage itself. A
//! [`ModelToolkit`] opens [`ModelSession`]s that own the modelling state,
//! a [`DocumentStore`] serves dataset collections, and an [`ArtifactStore`]
//! keeps saved models.

mod model;
mod store;

use std::sync::Arc;

pub use model::{FittedModel, ModelHandle, ModelSession, ModelToolkit, Options};
pub use store::{ArtifactStore, DataObject, DocumentStore, Record};

#[cfg(test)]
pub use store::MockDocumentStore;

/// The collaborators handed to every node factory.
#[derive(Debug, Clone)]
pub struct Services {
    /// Modelling backend.
    pub toolkit: Arc<dyn ModelToolkit>,
    /// Dataset collections.
    pub documents: Arc<dyn DocumentStore>,
    /// Saved model artifacts.
    pub artifacts: Arc<dyn ArtifactStore>,
}

impl Services {
    /// Creates a new set of services.
    #[must_use]
    pub fn new(
        toolkit: Arc<dyn ModelToolkit>,
        documents: Arc<dyn DocumentStore>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            toolkit,
            documents,
            artifacts,
        }
    }
}
