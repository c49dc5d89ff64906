//! Join nodes (`combine_models`, `group_models`) and their arrival barrier.

use serde_json::{Map, Value};
use std::collections::BTreeSet;
use tracing::debug;

use super::{Node, NodeCore, NodeInput};
use crate::core::{association_branches, NodeId, NodeKind, NodeOutput, NodePayload, PREV_NODE_COMPLETE};
use crate::errors::{ConfigError, NodeError};
use crate::toolkit::{ModelHandle, ModelSession, Options};

/// Accepted values of `optimize_fct`.
pub const COMBINE_METHODS: &[&str] = &["blend_models", "stack_models"];

/// Accepted values of `post_action`.
pub const POST_ACTIONS: &[&str] = &["ensemble_model", "calibrate_model"];

#[derive(Debug, Clone)]
struct Arrival {
    caller: NodeId,
    models: Vec<ModelHandle>,
}

/// Models delivered to one join node, keyed by the caller that sent them.
///
/// The engine keeps one barrier per join node id, shared by every tree
/// position of that node. A caller that delivers again replaces its earlier
/// models.
#[derive(Debug, Clone, Default)]
pub struct JoinBarrier {
    arrivals: Vec<Arrival>,
}

impl JoinBarrier {
    /// Creates an empty barrier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the models delivered by `caller`.
    pub fn record(&mut self, caller: NodeId, models: Vec<ModelHandle>) {
        match self.arrivals.iter_mut().find(|a| a.caller == caller) {
            Some(arrival) => arrival.models = models,
            None => self.arrivals.push(Arrival { caller, models }),
        }
    }

    /// Drops arrivals from branches outside `expected`.
    pub fn retain_branches(&mut self, expected: &BTreeSet<String>) {
        self.arrivals
            .retain(|a| expected.contains(a.caller.base()));
    }

    /// Branch ids that have delivered.
    pub fn reported_branches(&self) -> BTreeSet<String> {
        self.arrivals.iter().map(|a| a.caller.base().to_string()).collect()
    }

    /// True once every expected branch has delivered.
    pub fn is_complete(&self, expected: &BTreeSet<String>) -> bool {
        !expected.is_empty() && self.reported_branches() == *expected
    }

    /// Every delivered model, in arrival order.
    pub fn models(&self) -> Vec<ModelHandle> {
        self.arrivals.iter().flat_map(|a| a.models.iter().cloned()).collect()
    }

    /// Number of callers that delivered.
    pub fn len(&self) -> usize {
        self.arrivals.len()
    }

    /// True when nothing was delivered.
    pub fn is_empty(&self) -> bool {
        self.arrivals.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CombineMethod {
    Blend,
    Stack,
}

impl CombineMethod {
    fn apply(self, session: &mut dyn ModelSession, models: &[ModelHandle], options: &Options) -> anyhow::Result<ModelHandle> {
        match self {
            Self::Blend => session.blend_models(models, options),
            Self::Stack => session.stack_models(models, options),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PostAction {
    Ensemble,
    Calibrate,
}

impl PostAction {
    fn apply(self, session: &mut dyn ModelSession, model: &ModelHandle, options: &Options) -> anyhow::Result<ModelHandle> {
        match self {
            Self::Ensemble => session.ensemble_model(model, options),
            Self::Calibrate => session.calibrate_model(model, options),
        }
    }
}

/// Waits for models from every branch listed in its associated id, then
/// optionally combines them into one.
///
/// The node runs once per tree position, so it is not idempotent: each call
/// records one delivery. Calls before the barrier closes forward the models
/// collected so far and return `prev_node_complete: false`.
#[derive(Debug)]
pub struct JoinNode {
    core: NodeCore,
    expected: BTreeSet<String>,
    method: Option<CombineMethod>,
    method_options: Options,
    post_action: Option<PostAction>,
    post_options: Options,
}

fn object_setting(core: &NodeCore, key: &str) -> Options {
    core.setting(key).and_then(Value::as_object).cloned().unwrap_or_default()
}

impl JoinNode {
    /// Creates a join node.
    pub fn new(core: NodeCore) -> Result<Self, ConfigError> {
        let id = core.id().to_string();
        let associated = core
            .associated_id()
            .ok_or_else(|| ConfigError::bad_association(&id, "join nodes list their branches in `associated_id`"))?;
        let expected: BTreeSet<String> = association_branches(associated).into_iter().collect();
        if expected.is_empty() {
            return Err(ConfigError::bad_association(&id, "no branch ids listed"));
        }

        let method = match core.str_setting("optimize_fct") {
            None => None,
            Some("blend_models") => Some(CombineMethod::Blend),
            Some("stack_models") => Some(CombineMethod::Stack),
            Some(other) => {
                return Err(ConfigError::disallowed_choice(&id, "optimize_fct", other, COMBINE_METHODS))
            }
        };
        let (post_action, post_options) = if core.kind() == NodeKind::CombineModels {
            let calibrate = core.setting("calibrate").and_then(Value::as_bool).unwrap_or(false);
            match core.str_setting("post_action") {
                _ if calibrate => (Some(PostAction::Calibrate), Options::new()),
                None => (None, Options::new()),
                Some("ensemble_model") => (Some(PostAction::Ensemble), object_setting(&core, "post_params")),
                Some("calibrate_model") => (Some(PostAction::Calibrate), object_setting(&core, "post_params")),
                Some(other) => {
                    return Err(ConfigError::disallowed_choice(&id, "post_action", other, POST_ACTIONS))
                }
            }
        } else {
            (None, Options::new())
        };

        Ok(Self {
            method_options: object_setting(&core, "optimize_params"),
            core,
            expected,
            method,
            post_action,
            post_options,
        })
    }

    /// Branch ids this node waits for.
    pub fn expected_branches(&self) -> &BTreeSet<String> {
        &self.expected
    }

    fn combine(&self, session: &mut dyn ModelSession, models: Vec<ModelHandle>) -> Result<Vec<ModelHandle>, NodeError> {
        let id = self.core.id().as_str();
        let mut models = models;
        if let Some(method) = self.method {
            if models.len() < 2 {
                return Err(self.core.fail(format!(
                    "combining needs at least 2 models, got {}",
                    models.len()
                )));
            }
            models = vec![method
                .apply(session, &models, &self.method_options)
                .map_err(|e| NodeError::collaborator(id, "combining models", &e))?];
        }
        // Only the leading model is post-processed; the rest pass through.
        if let (Some(action), Some(first)) = (self.post_action, models.first_mut()) {
            *first = action
                .apply(session, first, &self.post_options)
                .map_err(|e| NodeError::collaborator(id, "post-processing models", &e))?;
        }
        Ok(models)
    }
}

impl Node for JoinNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn run(&mut self, input: NodeInput<'_>) -> Result<NodeOutput, NodeError> {
        let id = self.core.id().to_string();
        let caller = input
            .caller_id()
            .ok_or_else(|| self.core.fail("join node has no caller"))?;
        let Some(barrier) = input.barrier else {
            return Err(self.core.fail("join node executed without a barrier"));
        };
        if input.upstream.models().is_empty() {
            return Err(self.core.fail(format!("caller '{caller}' delivered no models")));
        }

        barrier.retain_branches(&self.expected);
        barrier.record(caller.clone(), input.upstream.models().to_vec());
        let collected = barrier.models();

        if !barrier.is_complete(&self.expected) {
            debug!(
                node_id = %id,
                caller = %caller,
                reported = barrier.len(),
                expected = self.expected.len(),
                "join waiting for more branches"
            );
            self.core.publish(
                NodePayload::new()
                    .with_models(collected)
                    .with_value("id", id),
            );
            return Ok(NodeOutput::held());
        }

        let models = if self.method.is_some() || self.post_action.is_some() {
            let session = input.experiment.require_session_mut(&id)?;
            self.combine(session, collected)?
        } else {
            collected
        };
        debug!(node_id = %id, models = models.len(), "join complete");

        let trained: Map<String, Value> = models
            .iter()
            .map(|m| (m.name().to_string(), m.describe()))
            .collect();
        self.core.publish(
            NodePayload::new()
                .with_models(models.clone())
                .with_value("id", id),
        );
        Ok(NodeOutput::new()
            .with_value(PREV_NODE_COMPLETE, true)
            .with_value("trained_models", trained)
            .with_models("models", models))
    }
}
