//! Split node: computes outer train/test folds.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

use super::{BuildContext, Node, NodeCore, NodeInput};
use crate::context::Table;
use crate::core::{NodeOutput, NodePayload};
use crate::errors::{ConfigError, NodeError};
use crate::toolkit::Options;

/// How the outer split is computed.
#[derive(Debug, Clone, PartialEq)]
pub enum SplitStrategy {
    /// K folds, each row tested exactly once.
    CrossValidation {
        /// Number of folds.
        num_folds: usize,
    },
    /// Repeated random train/test partitions.
    RandomSubSampling {
        /// Fraction of rows in each test set.
        test_size: f64,
        /// Number of partitions.
        n_iterations: usize,
    },
    /// Train sets drawn with replacement; untouched rows are tested.
    Bootstrapping {
        /// Number of draws.
        n_iterations: usize,
        /// Train sample size as a fraction of the rows.
        train_size: f64,
    },
    /// One partition given by the user.
    UserDefined {
        /// Train row indices.
        train: Vec<i64>,
        /// Test row indices.
        test: Vec<i64>,
    },
}

impl SplitStrategy {
    /// Accepted values of `outer_split_type`.
    pub const TYPES: &'static [&'static str] = &[
        "cross_validation",
        "random_sub_sampling",
        "bootstrapping",
        "user_defined",
    ];

    /// The `outer_split_type` tag.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::CrossValidation { .. } => "cross_validation",
            Self::RandomSubSampling { .. } => "random_sub_sampling",
            Self::Bootstrapping { .. } => "bootstrapping",
            Self::UserDefined { .. } => "user_defined",
        }
    }

    fn from_settings(core: &NodeCore) -> Result<Self, ConfigError> {
        let id = core.id().as_str();
        let split_type = core
            .str_setting("outer_split_type")
            .ok_or_else(|| ConfigError::missing_setting(id, "outer_split_type"))?;
        let outer = core
            .setting("outer")
            .ok_or_else(|| ConfigError::missing_setting(id, "outer"))?;
        let param = |path: &str| -> Result<&Value, ConfigError> {
            path.split('.')
                .try_fold(outer, |value, key| value.get(key))
                .ok_or_else(|| ConfigError::missing_setting(id, &format!("outer.{path}")))
        };
        let number = |path: &str| -> Result<f64, ConfigError> {
            let value = param(path)?;
            as_number(value).ok_or_else(|| {
                ConfigError::new(format!("Node '{id}': outer.{path} must be a number, got {value}"))
                    .with_nodes(vec![id.to_string()])
            })
        };
        let count = |path: &str| -> Result<usize, ConfigError> { number(path).map(to_count) };
        let indices = |path: &str| -> Result<Vec<i64>, ConfigError> {
            let value = param(path)?;
            let parsed = match value {
                Value::String(raw) => serde_json::from_str(raw),
                other => serde_json::from_value(other.clone()),
            };
            parsed.map_err(|e| {
                ConfigError::new(format!("Node '{id}': outer.{path} is not a list of row indices: {e}"))
                    .with_nodes(vec![id.to_string()])
            })
        };

        match split_type {
            "cross_validation" => Ok(Self::CrossValidation {
                num_folds: count("cross_validation.num_folds")?,
            }),
            "random_sub_sampling" => Ok(Self::RandomSubSampling {
                test_size: number("random_sub_sampling.test_size")?,
                n_iterations: count("random_sub_sampling.n_iterations")?,
            }),
            "bootstrapping" => Ok(Self::Bootstrapping {
                n_iterations: count("bootstrapping.n_iterations")?,
                train_size: number("bootstrapping.bootstrap_train_sample_size")?,
            }),
            "user_defined" => Ok(Self::UserDefined {
                train: indices("user_defined.train_indices")?,
                test: indices("user_defined.test_indices")?,
            }),
            other => Err(ConfigError::disallowed_choice(id, "outer_split_type", other, Self::TYPES)),
        }
    }
}

fn as_number(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_count(value: f64) -> usize {
    if value.is_finite() && value > 0.0 {
        value.round() as usize
    } else {
        0
    }
}

/// One train/test partition.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Fold {
    train: Vec<usize>,
    test: Vec<usize>,
}

/// Computes outer folds and prepares the session for fold-wise training.
#[derive(Debug)]
pub struct SplitNode {
    core: NodeCore,
    strategy: SplitStrategy,
    random_state: i64,
    use_defaults: bool,
}

impl SplitNode {
    /// Creates a split node.
    pub fn new(core: NodeCore, ctx: &BuildContext<'_>) -> Result<Self, ConfigError> {
        let use_defaults = core
            .setting("use_pycarets_default")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let random_state = core
            .setting("global")
            .and_then(|g| g.get("random_state"))
            .and_then(as_number)
            .map_or(ctx.engine.default_random_state, |n| n.round() as i64);
        let strategy = SplitStrategy::from_settings(&core)?;
        Ok(Self {
            core,
            strategy,
            random_state,
            use_defaults,
        })
    }

    /// The configured strategy.
    pub fn strategy(&self) -> &SplitStrategy {
        &self.strategy
    }

    fn seed(&self, offset: usize) -> u64 {
        self.random_state.unsigned_abs().wrapping_add(offset as u64)
    }

    fn stratify_columns(&self, upstream: &NodePayload) -> Vec<String> {
        let listed = |value: Option<&Value>| -> Option<Vec<String>> {
            let columns: Vec<String> = value?
                .as_array()?
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
            (!columns.is_empty()).then_some(columns)
        };
        listed(self.core.setting("stratify_columns"))
            .or_else(|| listed(upstream.get("stratify_columns")))
            .or_else(|| upstream.get_str("target").map(|t| vec![t.to_string()]))
            .unwrap_or_default()
    }

    fn folds(&self, n: usize, labels: Option<&[String]>) -> Result<Vec<Fold>, NodeError> {
        match self.strategy {
            SplitStrategy::CrossValidation { num_folds } => {
                if num_folds < 2 || num_folds > n {
                    return Err(self.core.fail(format!(
                        "num_folds must be between 2 and the number of rows ({n}), got {num_folds}"
                    )));
                }
                let mut rng = StdRng::seed_from_u64(self.seed(0));
                Ok(k_fold(n, num_folds, labels, &mut rng))
            }
            SplitStrategy::RandomSubSampling { test_size, n_iterations } => {
                if !(test_size > 0.0 && test_size < 1.0) {
                    return Err(self.core.fail(format!("test_size must be in (0, 1), got {test_size}")));
                }
                if n_iterations < 1 {
                    return Err(self.core.fail("n_iterations must be at least 1"));
                }
                (0..n_iterations)
                    .map(|i| {
                        let mut rng = StdRng::seed_from_u64(self.seed(i));
                        let fold = sub_sample(n, test_size, labels, &mut rng);
                        if fold.test.is_empty() || fold.train.is_empty() {
                            Err(self.core.fail(format!("test_size {test_size} leaves an empty partition")))
                        } else {
                            Ok(fold)
                        }
                    })
                    .collect()
            }
            SplitStrategy::Bootstrapping { n_iterations, train_size } => {
                if n_iterations < 1 {
                    return Err(self.core.fail("n_iterations must be at least 1"));
                }
                if !(train_size > 0.0 && train_size <= 1.0) {
                    return Err(self.core.fail(format!(
                        "bootstrap_train_sample_size must be in (0, 1], got {train_size}"
                    )));
                }
                Ok((0..n_iterations)
                    .map(|i| bootstrap(n, train_size, &mut StdRng::seed_from_u64(self.seed(i))))
                    .collect())
            }
            SplitStrategy::UserDefined { ref train, ref test } => {
                let check = |rows: &[i64]| -> Result<Vec<usize>, NodeError> {
                    rows.iter()
                        .map(|&row| {
                            usize::try_from(row)
                                .ok()
                                .filter(|&r| r < n)
                                .ok_or_else(|| self.core.fail(format!("row index {row} out of range for {n} rows")))
                        })
                        .collect()
                };
                Ok(vec![Fold {
                    train: check(train)?,
                    test: check(test)?,
                }])
            }
        }
    }
}

fn k_fold(n: usize, k: usize, labels: Option<&[String]>, rng: &mut StdRng) -> Vec<Fold> {
    let mut assignment = vec![0usize; n];
    let mut position = 0;
    for mut group in groups(n, labels) {
        group.shuffle(rng);
        for row in group {
            assignment[row] = position % k;
            position += 1;
        }
    }
    (0..k)
        .map(|fold| Fold {
            train: (0..n).filter(|&r| assignment[r] != fold).collect(),
            test: (0..n).filter(|&r| assignment[r] == fold).collect(),
        })
        .collect()
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn sub_sample(n: usize, test_size: f64, labels: Option<&[String]>, rng: &mut StdRng) -> Fold {
    let mut test = BTreeSet::new();
    for mut group in groups(n, labels) {
        group.shuffle(rng);
        let take = (group.len() as f64 * test_size).ceil() as usize;
        test.extend(group.into_iter().take(take.min(n.saturating_sub(1))));
    }
    Fold {
        train: (0..n).filter(|r| !test.contains(r)).collect(),
        test: test.into_iter().collect(),
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn bootstrap(n: usize, train_size: f64, rng: &mut StdRng) -> Fold {
    let draws = ((n as f64 * train_size).round() as usize).max(1);
    let mut train: Vec<usize> = (0..draws).map(|_| rng.gen_range(0..n)).collect();
    train.sort_unstable();
    let drawn: BTreeSet<usize> = train.iter().copied().collect();
    Fold {
        test: (0..n).filter(|r| !drawn.contains(r)).collect(),
        train,
    }
}

/// Row groups by stratification label, or one group of every row.
fn groups(n: usize, labels: Option<&[String]>) -> Vec<Vec<usize>> {
    match labels {
        Some(labels) => {
            let mut by_label: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
            for (row, label) in labels.iter().enumerate() {
                by_label.entry(label.as_str()).or_default().push(row);
            }
            by_label.into_values().collect()
        }
        None => vec![(0..n).collect()],
    }
}

fn row_labels(dataset: &Table, columns: &[String]) -> Vec<String> {
    let values: Vec<Vec<&Value>> = columns.iter().map(|c| dataset.column(c)).collect();
    (0..dataset.len())
        .map(|row| {
            values
                .iter()
                .map(|column| column[row].to_string())
                .collect::<Vec<_>>()
                .join("-")
        })
        .collect()
}

impl Node for SplitNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn run(&mut self, input: NodeInput<'_>) -> Result<NodeOutput, NodeError> {
        let id = self.core.id().to_string();
        let dataset = Arc::clone(input.experiment.require_dataset(&id)?);

        if self.use_defaults {
            let info = input
                .upstream
                .clone()
                .with_value("splitted", false)
                .with_value("random_state", self.random_state);
            self.core.publish(info);
            return Ok(NodeOutput::new()
                .with_value("splitted", false)
                .with_value("random_state", self.random_state)
                .with_value("table", "dataset")
                .with_value("paths", vec!["path"]));
        }

        let n = dataset.len();
        if n == 0 {
            return Err(self.core.fail("dataset is empty"));
        }
        let stratify_columns = self.stratify_columns(input.upstream);
        if let Some(missing) = stratify_columns.iter().find(|c| !dataset.has_column(c)) {
            return Err(self.core.fail(format!("stratify column '{missing}' not in dataset")));
        }
        let labels = (!stratify_columns.is_empty()).then(|| row_labels(&dataset, &stratify_columns));

        let folds = self.folds(n, labels.as_deref())?;
        if let [fold] = folds.as_slice() {
            if matches!(self.strategy, SplitStrategy::UserDefined { .. })
                && fold.train.iter().any(|r| fold.test.contains(r))
            {
                warn!(node_id = %id, "user-defined train and test indices overlap");
                self.core.publish(NodePayload::new());
                return Ok(NodeOutput::error("Overlapping indices in train and test sets."));
            }
        }

        let split_indices = json!({
            "type": self.strategy.type_name(),
            "folds": folds
                .iter()
                .enumerate()
                .map(|(i, f)| json!({"fold": i, "train_indices": f.train, "test_indices": f.test}))
                .collect::<Vec<_>>(),
        });

        let mut setup_settings = Options::new();
        for key in ["setup_settings", "cleaning_settings"] {
            if let Some(settings) = input.upstream.get_object(key) {
                setup_settings.extend(settings.clone());
            }
        }
        let mut options = setup_settings.clone();
        options.insert("session_id".into(), self.random_state.into());
        options.insert("data_split_stratify".into(), (!stratify_columns.is_empty()).into());
        if let Some(target) = input.upstream.get_str("target") {
            options.insert("target".into(), target.into());
        }
        input
            .experiment
            .require_session_mut(&id)?
            .setup(&dataset, &options)
            .map_err(|e| NodeError::collaborator(&id, "session setup", &e))?;
        debug!(node_id = %id, split_type = self.strategy.type_name(), folds = folds.len(), "split computed");

        let mut info = NodePayload::new()
            .with_value("splitted", true)
            .with_value("random_state", self.random_state)
            .with_value("setup_settings", setup_settings)
            .with_value("split_indices", split_indices.clone())
            .with_value("table", "dataset")
            .with_value("paths", vec!["path"])
            .with_value("stratify_columns", stratify_columns.clone());
        if let Some(target) = input.upstream.get_str("target") {
            info.insert("target", target);
        }
        self.core.publish(info);

        Ok(NodeOutput::new()
            .with_value("split_indices", split_indices)
            .with_value("stratify_columns", stratify_columns)
            .with_value("table", "dataset")
            .with_value("paths", vec!["path"]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, ExperimentConfig, NodeDefinition};
    use crate::context::ExperimentContext;
    use crate::core::NodeId;
    use crate::testing::{CallLog, MockEnvironment, MockSession};
    use pretty_assertions::assert_eq;

    fn split_node(settings: Value) -> Result<SplitNode, ConfigError> {
        let env = MockEnvironment::new();
        let services = env.services();
        let config = ExperimentConfig::default();
        let engine = EngineConfig::default();
        let ctx = BuildContext { config: &config, engine: &engine, services: &services };
        let definition = NodeDefinition::new("split", serde_json::from_value(settings).unwrap());
        SplitNode::new(NodeCore::new(NodeId::from("split"), definition)?, &ctx)
    }

    fn dataset(n: usize) -> Table {
        let rows = (0..n)
            .map(|i| serde_json::from_value(json!({"id": i, "y": i % 2})).unwrap())
            .collect();
        Table::from_records(rows)
    }

    fn run(node: &mut SplitNode, rows: usize) -> Result<NodeOutput, NodeError> {
        let mut context = ExperimentContext::new()
            .with_dataset(dataset(rows))
            .with_session(Box::new(MockSession::new(CallLog::default())));
        let upstream = NodePayload::new().with_value("target", "y");
        node.execute(NodeInput::new(&mut context, &upstream))
    }

    fn folds_of(output: &NodeOutput) -> Vec<Value> {
        output.value("split_indices").unwrap()["folds"].as_array().unwrap().clone()
    }

    #[test]
    fn test_cross_validation_tests_every_row_once() {
        let mut node = split_node(json!({
            "outer_split_type": "cross_validation",
            "outer": {"cross_validation": {"num_folds": 3}},
            "global": {"random_state": 7}
        }))
        .unwrap();
        let output = run(&mut node, 10).unwrap();

        let folds = folds_of(&output);
        assert_eq!(folds.len(), 3);
        let mut tested: Vec<u64> = folds
            .iter()
            .flat_map(|f| f["test_indices"].as_array().unwrap().iter().map(|v| v.as_u64().unwrap()))
            .collect();
        tested.sort_unstable();
        assert_eq!(tested, (0..10).collect::<Vec<u64>>());

        let info = node.info_for_next_node();
        assert!(info.flag("splitted"));
        assert_eq!(info.get("random_state"), Some(&json!(7)));
        assert_eq!(info.get("stratify_columns"), Some(&json!(["y"])));
    }

    #[test]
    fn test_same_seed_same_folds() {
        let settings = json!({
            "outer_split_type": "random_sub_sampling",
            "outer": {"random_sub_sampling": {"test_size": 0.3, "n_iterations": 2}}
        });
        let first = run(&mut split_node(settings.clone()).unwrap(), 20).unwrap();
        let second = run(&mut split_node(settings).unwrap(), 20).unwrap();
        assert_eq!(folds_of(&first), folds_of(&second));
        assert_eq!(folds_of(&first).len(), 2);
    }

    #[test]
    fn test_num_folds_out_of_range() {
        let mut node = split_node(json!({
            "outer_split_type": "cross_validation",
            "outer": {"cross_validation": {"num_folds": 5}}
        }))
        .unwrap();
        assert!(run(&mut node, 4).unwrap_err().message.contains("num_folds"));
    }

    #[test]
    fn test_bootstrap_tests_undrawn_rows() {
        let mut node = split_node(json!({
            "outer_split_type": "bootstrapping",
            "outer": {"bootstrapping": {"n_iterations": 1, "bootstrap_train_sample_size": 1.0}}
        }))
        .unwrap();
        let folds = folds_of(&run(&mut node, 12).unwrap());
        let train: BTreeSet<u64> = folds[0]["train_indices"].as_array().unwrap().iter().map(|v| v.as_u64().unwrap()).collect();
        let test: Vec<u64> = folds[0]["test_indices"].as_array().unwrap().iter().map(|v| v.as_u64().unwrap()).collect();
        assert_eq!(folds[0]["train_indices"].as_array().unwrap().len(), 12);
        assert!(test.iter().all(|r| !train.contains(r)));
    }

    #[test]
    fn test_user_defined_indices_from_json_strings() {
        let mut node = split_node(json!({
            "outer_split_type": "user_defined",
            "outer": {"user_defined": {"train_indices": "[0, 1, 2]", "test_indices": "[3]"}}
        }))
        .unwrap();
        let folds = folds_of(&run(&mut node, 4).unwrap());
        assert_eq!(folds, vec![json!({"fold": 0, "train_indices": [0, 1, 2], "test_indices": [3]})]);
    }

    #[test]
    fn test_user_defined_overlap_reports_error() {
        let mut node = split_node(json!({
            "outer_split_type": "user_defined",
            "outer": {"user_defined": {"train_indices": [0, 1], "test_indices": [1, 2]}}
        }))
        .unwrap();
        let output = run(&mut node, 4).unwrap();
        assert_eq!(output.value("error"), Some(&json!("Overlapping indices in train and test sets.")));
        assert!(node.info_for_next_node().is_empty());
    }

    #[test]
    fn test_user_defined_out_of_range() {
        let mut node = split_node(json!({
            "outer_split_type": "user_defined",
            "outer": {"user_defined": {"train_indices": [0, 9], "test_indices": [1]}}
        }))
        .unwrap();
        assert!(run(&mut node, 4).is_err());
    }

    #[test]
    fn test_pycaret_defaults_skip_folds() {
        let mut node = split_node(json!({
            "use_pycarets_default": true,
            "outer_split_type": "cross_validation",
            "outer": {"cross_validation": {"num_folds": 2}}
        }))
        .unwrap();
        let output = run(&mut node, 4).unwrap();
        assert_eq!(output.value("splitted"), Some(&json!(false)));
        assert!(!node.info_for_next_node().flag("splitted"));
    }

    #[test]
    fn test_unknown_split_type() {
        let err = split_node(json!({"outer_split_type": "leave_one_out", "outer": {}})).unwrap_err();
        assert_eq!(err.code(), Some(crate::errors::codes::DISALLOWED_CHOICE));
    }

    #[test]
    fn test_missing_parameter() {
        let err = split_node(json!({"outer_split_type": "cross_validation", "outer": {}})).unwrap_err();
        assert!(err.message.contains("outer.cross_validation.num_folds"));
    }
}
