//! Branch-local experiment context.

use std::sync::Arc;

use super::Table;
use crate::errors::NodeError;
use crate::toolkit::ModelSession;

/// The experiment context a node receives from its parent.
///
/// Cloning shares the read-only dataset and deep-copies the session, so each
/// child branch mutates its own session.
#[derive(Debug, Default)]
pub struct ExperimentContext {
    dataset: Option<Arc<Table>>,
    session: Option<Box<dyn ModelSession>>,
}

impl Clone for ExperimentContext {
    fn clone(&self) -> Self {
        Self {
            dataset: self.dataset.clone(),
            session: self.session.as_ref().map(|s| s.clone_box()),
        }
    }
}

impl ExperimentContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the dataset.
    #[must_use]
    pub fn with_dataset(mut self, dataset: Table) -> Self {
        self.dataset = Some(Arc::new(dataset));
        self
    }

    /// Sets an already shared dataset.
    #[must_use]
    pub fn with_shared_dataset(mut self, dataset: Arc<Table>) -> Self {
        self.dataset = Some(dataset);
        self
    }

    /// Sets the session.
    #[must_use]
    pub fn with_session(mut self, session: Box<dyn ModelSession>) -> Self {
        self.session = Some(session);
        self
    }

    /// The dataset, if loaded.
    pub fn dataset(&self) -> Option<&Arc<Table>> {
        self.dataset.as_ref()
    }

    /// The dataset, or an error naming the node that needed it.
    pub fn require_dataset(&self, node_id: &str) -> Result<&Arc<Table>, NodeError> {
        self.dataset
            .as_ref()
            .ok_or_else(|| NodeError::new(node_id, "no dataset loaded upstream"))
    }

    /// True when a session is open.
    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// The session, if open.
    pub fn session(&self) -> Option<&dyn ModelSession> {
        self.session.as_deref()
    }

    /// The session, or an error naming the node that needed it.
    pub fn require_session(&self, node_id: &str) -> Result<&dyn ModelSession, NodeError> {
        self.session
            .as_deref()
            .ok_or_else(|| NodeError::new(node_id, "no modelling session open upstream"))
    }

    /// Mutable session, or an error naming the node that needed it.
    pub fn require_session_mut(
        &mut self,
        node_id: &str,
    ) -> Result<&mut (dyn ModelSession + 'static), NodeError> {
        match self.session.as_deref_mut() {
            Some(session) => Ok(session),
            None => Err(NodeError::new(node_id, "no modelling session open upstream")),
        }
    }
}
