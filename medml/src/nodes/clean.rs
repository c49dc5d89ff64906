//! Clean node: opens the modelling session over the loaded dataset.

use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use super::{BuildContext, Node, NodeCore, NodeInput};
use crate::context::ExperimentContext;
use crate::core::NodeOutput;
use crate::errors::NodeError;
use crate::toolkit::{ModelToolkit, Options};

/// Opens a fresh session and runs its setup.
///
/// Setup options merge, lowest precedence first, the dataset node's setup
/// settings, any `setup_settings` already forwarded, then this node's own
/// settings.
#[derive(Debug)]
pub struct CleanNode {
    core: NodeCore,
    ml_type: String,
    toolkit: Arc<dyn ModelToolkit>,
}

impl CleanNode {
    /// Creates a clean node.
    pub fn new(core: NodeCore, ctx: &BuildContext<'_>) -> Self {
        Self {
            core,
            ml_type: ctx.config.ml_type_or(&ctx.engine.default_ml_type).to_string(),
            toolkit: Arc::clone(&ctx.services.toolkit),
        }
    }
}

impl Node for CleanNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn run(&mut self, input: NodeInput<'_>) -> Result<NodeOutput, NodeError> {
        let id = self.core.id().to_string();
        let dataset = Arc::clone(input.experiment.require_dataset(&id)?);

        let mut options = Options::new();
        for key in ["dataset_setup_settings", "setup_settings"] {
            if let Some(settings) = input.upstream.get_object(key) {
                options.extend(settings.clone());
            }
        }
        options.extend(self.core.settings().clone());
        if let Some(target) = input.upstream.get_str("target") {
            options.entry("target").or_insert_with(|| Value::from(target));
        }

        let mut session = self
            .toolkit
            .new_session(&self.ml_type)
            .map_err(|e| NodeError::collaborator(&id, "opening session", &e))?;
        session
            .setup(&dataset, &options)
            .map_err(|e| NodeError::collaborator(&id, "session setup", &e))?;
        debug!(node_id = %id, ml_type = %self.ml_type, options = options.len(), "session ready");

        let mut info = input.upstream.clone();
        info.insert("cleaning_settings", self.core.settings().clone());
        self.core.publish(info);

        Ok(NodeOutput::new()
            .with_value("table", "dataset")
            .with_value("paths", vec!["path"])
            .with_value("setup", options)
            .with_experiment(
                ExperimentContext::new()
                    .with_shared_dataset(dataset)
                    .with_session(session),
            ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, ExperimentConfig, NodeDefinition};
    use crate::context::Table;
    use crate::core::{NodeId, NodePayload};
    use crate::testing::MockEnvironment;
    use serde_json::json;

    fn clean_node(env: &MockEnvironment, settings: Value) -> CleanNode {
        let services = env.services();
        let config = ExperimentConfig {
            ml_type: Some("regression".into()),
            ..ExperimentConfig::default()
        };
        let engine = EngineConfig::default();
        let ctx = BuildContext { config: &config, engine: &engine, services: &services };
        let definition = NodeDefinition::new("clean", serde_json::from_value(settings).unwrap());
        CleanNode::new(NodeCore::new(NodeId::from("clean"), definition).unwrap(), &ctx)
    }

    #[test]
    fn test_opens_session_with_merged_settings() {
        let env = MockEnvironment::new();
        let mut node = clean_node(&env, json!({"normalize": false, "imputation_type": "simple"}));
        let mut context = ExperimentContext::new().with_dataset(Table::default());
        let upstream = NodePayload::new()
            .with_value("target", "y")
            .with_value("dataset_setup_settings", json!({"normalize": true, "fold": 3}));

        let mut output = node.execute(NodeInput::new(&mut context, &upstream)).unwrap();

        assert_eq!(output.value("setup").unwrap()["normalize"], json!(false));
        assert_eq!(output.value("setup").unwrap()["fold"], json!(3));
        assert_eq!(output.value("setup").unwrap()["target"], json!("y"));
        assert!(output.take_experiment().unwrap().has_session());
        assert_eq!(env.toolkit.log().calls(), vec!["new_session:regression", "setup"]);
        assert!(node.info_for_next_node().get_object("cleaning_settings").is_some());
        assert_eq!(node.info_for_next_node().get_str("target"), Some("y"));
    }

    #[test]
    fn test_requires_dataset() {
        let env = MockEnvironment::new();
        let mut node = clean_node(&env, json!({}));
        let mut context = ExperimentContext::new();
        let upstream = NodePayload::new();
        let err = node.execute(NodeInput::new(&mut context, &upstream)).unwrap_err();
        assert_eq!(err.node_id, "clean");
    }
}
