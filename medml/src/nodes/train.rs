//! Training nodes: `train_model` and `compare_models`.

use serde_json::Value;
use tracing::debug;

use super::{BuildContext, Node, NodeCore, NodeInput};
use crate::config::NodeDefinition;
use crate::core::{NodeKind, NodeOutput, NodePayload, ResultValue};
use crate::errors::{ConfigError, NodeError};
use crate::toolkit::{ModelHandle, ModelSession, Options};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Train,
    Compare,
}

#[derive(Debug, Clone)]
struct Estimator {
    id: String,
    options: Options,
}

#[derive(Debug, Clone)]
struct Fold {
    train: Vec<usize>,
    test: Vec<usize>,
}

/// Trains one estimator (`train_model`) or ranks every available one
/// (`compare_models`).
///
/// A `train_model` node is always an instance `<train>*<model>`: the suffix
/// names the model node holding the estimator selection and its settings.
/// When upstream data is split, every fold is fitted and scored, the best
/// fold's model is refitted on all rows. Cross-validation splits delegate to
/// the session instead.
#[derive(Debug)]
pub struct TrainNode {
    core: NodeCore,
    mode: Mode,
    estimator: Option<Estimator>,
    tuning: Option<Options>,
    ensembling: Option<Options>,
    calibration: Option<Options>,
    metric: String,
    default_random_state: i64,
}

fn enabled_options(definition: &NodeDefinition, flag: &str, settings: &str) -> Option<Options> {
    definition.internal_flag(flag).then(|| {
        definition
            .internal(settings)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    })
}

impl TrainNode {
    /// Creates a training node.
    pub fn new(core: NodeCore, ctx: &BuildContext<'_>) -> Result<Self, ConfigError> {
        let id = core.id().to_string();
        let mode = if core.kind() == NodeKind::CompareModels {
            Mode::Compare
        } else {
            Mode::Train
        };
        let estimator = match mode {
            Mode::Compare => None,
            Mode::Train => {
                let model_id = core.associated_id().ok_or_else(|| {
                    ConfigError::bad_association(&id, "train nodes must be instances `<train>*<model>`")
                })?;
                let model = ctx
                    .config
                    .definition(model_id)
                    .ok_or_else(|| ConfigError::unknown_node(model_id))?;
                let selection = model
                    .internal("selection")
                    .or_else(|| model.settings().get("selection"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| ConfigError::missing_setting(model_id, "selection"))?;
                let mut options = model.settings().clone();
                options.remove("selection");
                Some(Estimator {
                    id: selection.to_string(),
                    options,
                })
            }
        };

        let definition = core.definition();
        let tuning = enabled_options(definition, "isTuningEnabled", "settingsTuning");
        let metric = tuning
            .as_ref()
            .and_then(|t| t.get("optimize"))
            .and_then(Value::as_str)
            .unwrap_or(ctx.engine.optimization_metric.as_str())
            .to_string();
        Ok(Self {
            tuning,
            ensembling: enabled_options(definition, "ensembleEnabled", "settingsEnsembling"),
            calibration: enabled_options(definition, "calibrateEnabled", "settingsCalibration"),
            core,
            mode,
            estimator,
            metric,
            default_random_state: ctx.engine.default_random_state,
        })
    }

    fn estimators(&self, session: &dyn ModelSession, options: &Options, limit: usize) -> Vec<Estimator> {
        match self.estimator {
            Some(ref estimator) => {
                let mut merged = options.clone();
                merged.extend(estimator.options.clone());
                vec![Estimator {
                    id: estimator.id.clone(),
                    options: merged,
                }]
            }
            None => session
                .available_estimators()
                .into_iter()
                .take(limit)
                .map(|id| Estimator {
                    id,
                    options: options.clone(),
                })
                .collect(),
        }
    }

    fn train_default(&self, session: &mut dyn ModelSession, options: &Options) -> Result<Vec<ModelHandle>, NodeError> {
        let id = self.core.id().as_str();
        let models = match self.estimator {
            None => session
                .compare_models(options)
                .map_err(|e| NodeError::collaborator(id, "comparing models", &e))?,
            Some(_) => {
                let mut models = Vec::new();
                for estimator in self.estimators(session, options, 1) {
                    models.extend(
                        session
                            .create_model(&estimator.id, &estimator.options)
                            .map_err(|e| NodeError::collaborator(id, "creating model", &e))?,
                    );
                }
                models
            }
        };
        match self.tuning {
            Some(ref tuning) => models
                .iter()
                .map(|m| session.tune_model(m, tuning))
                .collect::<anyhow::Result<_>>()
                .map_err(|e| NodeError::collaborator(id, "tuning model", &e)),
            None => Ok(models),
        }
    }

    fn train_on_folds(
        &self,
        session: &mut dyn ModelSession,
        options: &Options,
        upstream: &NodePayload,
    ) -> Result<Vec<ModelHandle>, NodeError> {
        let id = self.core.id().as_str();
        let split = upstream
            .get_object("split_indices")
            .ok_or_else(|| self.core.fail("upstream data is split but carries no split_indices"))?;
        let split_type = split.get("type").and_then(Value::as_str).unwrap_or_default();
        let folds = parse_folds(split.get("folds"));
        if folds.is_empty() {
            return Err(self.core.fail("no folds to train on"));
        }

        let mut options = options.clone();
        let random_state = upstream
            .get("random_state")
            .cloned()
            .unwrap_or_else(|| self.default_random_state.into());
        options.entry("random_state").or_insert(random_state);

        let mut models = Vec::new();
        for estimator in self.estimators(session, &options, 2) {
            if split_type == "cross_validation" {
                models.extend(
                    session
                        .create_model(&estimator.id, &estimator.options)
                        .map_err(|e| NodeError::collaborator(id, "creating model", &e))?,
                );
                continue;
            }

            let mut best: Option<(f64, ModelHandle)> = None;
            for (index, fold) in folds.iter().enumerate() {
                let mut model = session
                    .fit_on_rows(&estimator.id, &estimator.options, &fold.train)
                    .map_err(|e| NodeError::collaborator(id, &format!("fitting fold {index}"), &e))?;
                if let Some(ref tuning) = self.tuning {
                    model = session
                        .tune_model(&model, tuning)
                        .map_err(|e| NodeError::collaborator(id, &format!("tuning fold {index}"), &e))?;
                }
                let score = session
                    .score_on_rows(&model, &fold.test, &self.metric)
                    .map_err(|e| NodeError::collaborator(id, &format!("scoring fold {index}"), &e))?;
                debug!(node_id = %id, estimator = %estimator.id, fold = index, score, metric = %self.metric, "fold scored");
                if best.as_ref().map_or(true, |(top, _)| score > *top) {
                    best = Some((score, model));
                }
            }
            if let Some((_, model)) = best {
                models.push(
                    session
                        .fit_full(&model)
                        .map_err(|e| NodeError::collaborator(id, "refitting best fold", &e))?,
                );
            }
        }
        Ok(models)
    }

    fn post_process(&self, session: &mut dyn ModelSession, models: Vec<ModelHandle>) -> Result<Vec<ModelHandle>, NodeError> {
        let id = self.core.id().as_str();
        models
            .into_iter()
            .map(|mut model| {
                if let Some(ref options) = self.ensembling {
                    model = session
                        .ensemble_model(&model, options)
                        .map_err(|e| NodeError::collaborator(id, "ensembling model", &e))?;
                }
                if let Some(ref options) = self.calibration {
                    model = session
                        .calibrate_model(&model, options)
                        .map_err(|e| NodeError::collaborator(id, "calibrating model", &e))?;
                }
                Ok(model)
            })
            .collect()
    }
}

fn parse_folds(folds: Option<&Value>) -> Vec<Fold> {
    let rows = |fold: &Value, key: &str| -> Vec<usize> {
        fold.get(key)
            .and_then(Value::as_array)
            .map(|rows| {
                rows.iter()
                    .filter_map(Value::as_u64)
                    .filter_map(|r| usize::try_from(r).ok())
                    .collect()
            })
            .unwrap_or_default()
    };
    folds
        .and_then(Value::as_array)
        .map(|folds| {
            folds
                .iter()
                .map(|f| Fold {
                    train: rows(f, "train_indices"),
                    test: rows(f, "test_indices"),
                })
                .collect()
        })
        .unwrap_or_default()
}

impl Node for TrainNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn run(&mut self, input: NodeInput<'_>) -> Result<NodeOutput, NodeError> {
        let id = self.core.id().to_string();
        let mut options = self.core.settings().clone();
        options.remove("useTuningGrid");

        let session = input.experiment.require_session_mut(&id)?;
        let models = if input.upstream.flag("splitted") {
            self.train_on_folds(session, &options, input.upstream)?
        } else {
            self.train_default(session, &options)?
        };
        let mut models = self.post_process(session, models)?;
        if input.finalize {
            models = models
                .iter()
                .map(|m| session.finalize_model(m))
                .collect::<anyhow::Result<_>>()
                .map_err(|e| NodeError::collaborator(&id, "finalizing model", &e))?;
        }
        debug!(node_id = %id, models = models.len(), finalize = input.finalize, "training done");

        let fct_type = match self.mode {
            Mode::Train => NodeKind::TrainModel,
            Mode::Compare => NodeKind::CompareModels,
        };
        options.insert("fct_type".into(), fct_type.as_str().into());
        self.core.publish(
            NodePayload::new()
                .with_models(models.clone())
                .with_value("id", id)
                .with_value("settings", options),
        );

        let mut output = NodeOutput::new();
        for model in &models {
            output.insert(model.name(), ResultValue::Json(model.describe()));
        }
        Ok(output.with_models("models", models))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, ExperimentConfig};
    use crate::context::{ExperimentContext, Table};
    use crate::core::NodeId;
    use crate::testing::{CallLog, MockEnvironment, MockSession};
    use serde_json::json;

    fn config() -> ExperimentConfig {
        let mut config = ExperimentConfig::default();
        config.nodes.insert(
            "rf".into(),
            NodeDefinition::new("train_model", serde_json::from_value(json!({"n_estimators": 10})).unwrap())
                .with_internal("selection", json!("rf")),
        );
        config
    }

    fn build(definition: NodeDefinition, id: &str) -> Result<TrainNode, ConfigError> {
        let env = MockEnvironment::new();
        let services = env.services();
        let config = config();
        let engine = EngineConfig::default();
        let ctx = BuildContext { config: &config, engine: &engine, services: &services };
        TrainNode::new(NodeCore::new(NodeId::from(id), definition)?, &ctx)
    }

    fn train_definition() -> NodeDefinition {
        NodeDefinition::new("train_model", Options::new()).with_associated_id("rf")
    }

    fn context(log: &CallLog, rows: usize) -> ExperimentContext {
        let mut session = MockSession::new(log.clone());
        let table = Table::from_records(
            (0..rows).map(|i| serde_json::from_value(json!({"x": i})).unwrap()).collect(),
        );
        session.setup(&table, &Options::new()).unwrap();
        ExperimentContext::new().with_dataset(table).with_session(Box::new(session))
    }

    #[test]
    fn test_train_without_split_creates_model() {
        let mut node = build(train_definition(), "train*rf").unwrap();
        let log = CallLog::default();
        let mut context = context(&log, 10);
        let upstream = NodePayload::new();
        let output = node.execute(NodeInput::new(&mut context, &upstream)).unwrap();

        assert_eq!(output.models("models").unwrap().len(), 1);
        assert_eq!(output.value("rf").unwrap()["n_estimators"], json!(10));
        assert!(log.calls().contains(&"create_model:rf".to_string()));
        let info = node.info_for_next_node();
        assert_eq!(info.get_str("id"), Some("train*rf"));
        assert_eq!(info.get("settings").unwrap()["fct_type"], json!("train_model"));
        assert_eq!(info.models().len(), 1);
    }

    #[test]
    fn test_train_on_folds_refits_best() {
        let definition = train_definition()
            .with_internal("isTuningEnabled", json!(true))
            .with_internal("settingsTuning", json!({"optimize": "AUC"}));
        let mut node = build(definition, "train*rf").unwrap();
        let log = CallLog::default();
        let mut context = context(&log, 6);
        let upstream = NodePayload::new().with_value("splitted", true).with_value(
            "split_indices",
            json!({"type": "random_sub_sampling", "folds": [
                {"fold": 0, "train_indices": [0, 1, 2, 3], "test_indices": [4, 5]},
                {"fold": 1, "train_indices": [2, 3, 4], "test_indices": [0, 1, 5]}
            ]}),
        );
        node.execute(NodeInput::new(&mut context, &upstream)).unwrap();

        assert_eq!(log.count("fit_on_rows"), 2);
        assert_eq!(log.count("tune_model"), 2);
        assert_eq!(log.calls().iter().filter(|c| c.starts_with("score_on_rows:AUC")).count(), 2);
        assert_eq!(log.count("fit_full"), 1);
        let model = &node.info_for_next_node().models()[0];
        assert_eq!(model.describe()["train_rows"], json!(3));
    }

    #[test]
    fn test_fold_index_out_of_range_fails() {
        let mut node = build(train_definition(), "train*rf").unwrap();
        let log = CallLog::default();
        let mut context = context(&log, 3);
        let upstream = NodePayload::new().with_value("splitted", true).with_value(
            "split_indices",
            json!({"type": "user_defined", "folds": [{"fold": 0, "train_indices": [0, 7], "test_indices": [1]}]}),
        );
        let err = node.execute(NodeInput::new(&mut context, &upstream)).unwrap_err();
        assert!(err.message.contains("fitting fold 0"));
    }

    #[test]
    fn test_compare_models_and_finalize_flag() {
        let mut node = build(NodeDefinition::new("compare_models", Options::new()), "compare").unwrap();
        let log = CallLog::default();
        let mut context = context(&log, 5);
        let upstream = NodePayload::new();
        node.execute(NodeInput::new(&mut context, &upstream).with_finalize(true)).unwrap();
        assert_eq!(log.count("compare_models"), 1);
        assert_eq!(log.count("finalize_model"), 2);
        assert!(node
            .info_for_next_node()
            .models()
            .iter()
            .all(|m| m.describe()["finalized"] == json!(true)));
    }

    #[test]
    fn test_train_needs_association() {
        let err = build(NodeDefinition::new("train_model", Options::new()), "train").unwrap_err();
        assert_eq!(err.code(), Some(crate::errors::codes::BAD_ASSOCIATION));
    }

    #[test]
    fn test_unknown_model_node() {
        let definition = NodeDefinition::new("train_model", Options::new()).with_associated_id("svm");
        let err = build(definition, "train*svm").unwrap_err();
        assert_eq!(err.code(), Some(crate::errors::codes::UNKNOWN_NODE));
    }
}
