//! Modelling toolkit traits.

use serde_json::{Map, Value};
use std::fmt::Debug;
use std::sync::Arc;

use crate::context::Table;

/// Keyword options passed to toolkit verbs.
pub type Options = Map<String, Value>;

/// A fitted estimator produced by a [`ModelSession`].
pub trait FittedModel: Debug + Send + Sync {
    /// Estimator class name, used as the default save name.
    fn name(&self) -> &str;

    /// JSON-safe description of the model's parameters.
    fn describe(&self) -> Value;

    /// Decision threshold, for classifiers that carry one.
    fn probability_threshold(&self) -> Option<f64> {
        None
    }
}

/// Shared handle to a fitted model.
pub type ModelHandle = Arc<dyn FittedModel>;

/// Stateful modelling session bound to one dataset.
///
/// Sessions are cloned whenever a pipeline branches, so a child can never
/// observe a sibling's mutations.
pub trait ModelSession: Debug + Send {
    /// Clones the session, including everything fitted so far.
    fn clone_box(&self) -> Box<dyn ModelSession>;

    /// Prepares the session for `data`.
    fn setup(&mut self, data: &Table, options: &Options) -> anyhow::Result<()>;

    /// Ids of the estimators the backend can train.
    fn available_estimators(&self) -> Vec<String>;

    /// Trains every available estimator and returns them best first.
    fn compare_models(&mut self, options: &Options) -> anyhow::Result<Vec<ModelHandle>>;

    /// Trains one estimator with cross-validation.
    fn create_model(&mut self, estimator: &str, options: &Options) -> anyhow::Result<Vec<ModelHandle>>;

    /// Tunes hyper-parameters.
    fn tune_model(&mut self, model: &ModelHandle, options: &Options) -> anyhow::Result<ModelHandle>;

    /// Wraps a model in a bagging or boosting ensemble.
    fn ensemble_model(&mut self, model: &ModelHandle, options: &Options) -> anyhow::Result<ModelHandle>;

    /// Calibrates predicted probabilities.
    fn calibrate_model(&mut self, model: &ModelHandle, options: &Options) -> anyhow::Result<ModelHandle>;

    /// Blends several models by voting.
    fn blend_models(&mut self, models: &[ModelHandle], options: &Options) -> anyhow::Result<ModelHandle>;

    /// Stacks several models under a meta learner.
    fn stack_models(&mut self, models: &[ModelHandle], options: &Options) -> anyhow::Result<ModelHandle>;

    /// Refits a model on the whole dataset for deployment.
    fn finalize_model(&mut self, model: &ModelHandle) -> anyhow::Result<ModelHandle>;

    /// Fits an estimator on the given rows only.
    fn fit_on_rows(&mut self, estimator: &str, options: &Options, rows: &[usize]) -> anyhow::Result<ModelHandle>;

    /// Scores a model on the given rows.
    fn score_on_rows(&mut self, model: &ModelHandle, rows: &[usize], metric: &str) -> anyhow::Result<f64>;

    /// Refits a model on every row.
    fn fit_full(&mut self, model: &ModelHandle) -> anyhow::Result<ModelHandle>;

    /// Serializes a model to bytes.
    fn serialize_model(&self, model: &ModelHandle) -> anyhow::Result<Vec<u8>>;
}

/// Factory for sessions and deserializer for saved models.
pub trait ModelToolkit: Debug + Send + Sync {
    /// Opens a session for the given ML type.
    fn new_session(&self, ml_type: &str) -> anyhow::Result<Box<dyn ModelSession>>;

    /// Restores a model from bytes produced by [`ModelSession::serialize_model`].
    fn deserialize_model(&self, bytes: &[u8]) -> anyhow::Result<ModelHandle>;
}
