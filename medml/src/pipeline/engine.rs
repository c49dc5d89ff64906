//! Depth-first execution of the node tree.
//!
//! [`Experiment::start`] walks the roots in adjacency order. Each visited
//! position either executes its node or, when the node already ran, reuses
//! its cached results and context. Children get their own copy of the
//! context, so sibling branches never see each other's changes.

use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::graph::{count_positions, GraphBuilder, NodeResults, PipelineGraph, PipelineNodeState};
use super::progress::{Progress, ProgressTracker};
use super::results::{record_entry, ResultsTree};
use crate::config::{EngineConfig, ExperimentConfig, NodeDefinition};
use crate::context::ExperimentContext;
use crate::core::{NodeId, NodeKind, NodeOutput, NodePayload, SAVE_NODE_ID};
use crate::errors::MedmlError;
use crate::events::{types, EventSink, NoOpEventSink};
use crate::nodes::{BuildContext, JoinBarrier, Node, NodeInput, NodeRegistry};
use crate::observability::SpanTimer;
use crate::toolkit::Services;

/// Label shown while results are being collected.
pub const RESULTS_LABEL: &str = "Generating results";

/// Where the save pass runs in a finalize run.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SaveTrigger {
    /// After the node whose base id matches.
    Target(String),
    /// After every training or join node without children.
    Terminal,
}

impl SaveTrigger {
    fn from_config(config: &ExperimentConfig) -> Option<Self> {
        if !config.finalize {
            return None;
        }
        Some(match config.finalize_target() {
            Some(target) => Self::Target(NodeId::from(target).base().to_string()),
            None => Self::Terminal,
        })
    }

    fn matches(&self, node: &dyn Node, children: &Map<String, Value>) -> bool {
        match self {
            Self::Target(base) => node.id().base() == base.as_str(),
            Self::Terminal => (node.kind().is_training() || node.kind().is_join()) && children.is_empty(),
        }
    }
}

/// One experiment: a node tree plus the state of its runs.
#[derive(Debug)]
pub struct Experiment {
    config: ExperimentConfig,
    pipelines: Map<String, Value>,
    engine: EngineConfig,
    registry: Arc<NodeRegistry>,
    services: Services,
    graph: PipelineGraph,
    barriers: HashMap<NodeId, JoinBarrier>,
    results: ResultsTree,
    progress: ProgressTracker,
    events: Arc<dyn EventSink>,
    save_trigger: Option<SaveTrigger>,
    sequence: u64,
}

impl Experiment {
    /// Builds the node tree for `config`.
    ///
    /// Fails with a configuration error before any node executes.
    pub fn new(
        config: ExperimentConfig,
        registry: Arc<NodeRegistry>,
        services: Services,
        engine: EngineConfig,
    ) -> Result<Self, MedmlError> {
        let mut experiment = Self {
            config: ExperimentConfig::default(),
            pipelines: Map::new(),
            engine,
            registry,
            services,
            graph: PipelineGraph::default(),
            barriers: HashMap::new(),
            results: ResultsTree::new(),
            progress: ProgressTracker::new(),
            events: Arc::new(NoOpEventSink),
            save_trigger: None,
            sequence: 0,
        };
        experiment.update(config)?;
        Ok(experiment)
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Shares progress through an existing tracker.
    #[must_use]
    pub fn with_progress_tracker(mut self, tracker: ProgressTracker) -> Self {
        self.progress = tracker;
        self
    }

    /// Merges a new configuration into the existing tree.
    ///
    /// Unchanged nodes keep their results. A different finalize plan
    /// discards the whole tree and every join barrier.
    pub fn update(&mut self, mut config: ExperimentConfig) -> Result<(), MedmlError> {
        let save_trigger = SaveTrigger::from_config(&config);
        if save_trigger != self.save_trigger && !self.graph.is_empty() {
            info!(page_id = %config.page_id, "finalize plan changed, rebuilding every node");
            self.graph = PipelineGraph::default();
            self.barriers.clear();
        }

        let pipelines = config.runnable_pipelines()?;
        let ctx = BuildContext {
            config: &config,
            engine: &self.engine,
            services: &self.services,
        };
        let mut builder = GraphBuilder::new(&self.registry, ctx).starting_at(self.sequence);
        self.graph.update(&pipelines, &mut builder)?;
        let summary = builder.finish();

        for id in &summary.rebuilt_joins {
            if self.barriers.remove(id.as_str()).is_some() {
                debug!(node_id = %id, "join rebuilt, barrier cleared");
            }
        }
        config.nodes.extend(summary.instances);
        debug!(
            page_id = %config.page_id,
            positions = self.graph.position_count(),
            "pipeline graph ready"
        );
        self.sequence = summary.sequence;
        self.pipelines = pipelines;
        self.save_trigger = save_trigger;
        self.config = config;
        Ok(())
    }

    /// Runs every node that has not run yet and collects the results.
    ///
    /// A node error aborts the pass; results recorded before it stay in
    /// place. A successful pass ends at 100 percent.
    pub fn start(&mut self) -> Result<&ResultsTree, MedmlError> {
        let positions = match self.config.nb_nodes_to_run {
            0 => count_positions(&self.pipelines),
            n => n,
        };
        let total = positions + u64::from(self.save_trigger.is_some());
        let page_id = self.config.page_id.clone();

        self.progress.reset(total);
        self.results.clear();
        self.events.emit(
            types::EXPERIMENT_STARTED,
            Some(json!({"page_id": page_id, "total": total})),
        );
        info!(page_id = %page_id, total, "experiment started");
        let timer = SpanTimer::start(page_id.as_str());

        let mut walker = Walker {
            config: &self.config,
            engine: &self.engine,
            registry: &self.registry,
            services: &self.services,
            progress: &self.progress,
            barriers: &mut self.barriers,
            events: self.events.as_ref(),
            save_trigger: self.save_trigger.as_ref(),
        };
        let outcome = walker.visit_roots(self.graph.roots_mut(), &self.pipelines, self.results.as_map_mut());
        let duration_ms = timer.finish();

        if let Err(err) = outcome {
            error!(page_id = %page_id, error = %err, duration_ms, "experiment failed");
            self.events.emit(
                types::EXPERIMENT_FAILED,
                Some(json!({"page_id": page_id, "error": err.to_string()})),
            );
            return Err(err);
        }

        self.progress.finish();
        info!(page_id = %page_id, duration_ms, "experiment finished");
        self.events.emit(
            types::EXPERIMENT_FINISHED,
            Some(json!({"page_id": page_id, "duration_ms": duration_ms})),
        );
        Ok(&self.results)
    }

    /// Results of the last pass.
    pub fn results(&self) -> &ResultsTree {
        self.progress.set_label(RESULTS_LABEL);
        &self.results
    }

    /// Results of the last pass, partial when it failed. Unlike
    /// [`Experiment::results`] this leaves the progress label alone.
    pub fn last_results(&self) -> &ResultsTree {
        &self.results
    }

    /// Current progress.
    pub fn progress(&self) -> Progress {
        self.progress.snapshot()
    }

    /// A handle on the shared progress.
    pub fn progress_tracker(&self) -> ProgressTracker {
        self.progress.clone()
    }

    /// The node tree.
    pub fn graph(&self) -> &PipelineGraph {
        &self.graph
    }

    /// The active configuration, with derived instance definitions.
    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// Arrival state of a join node.
    pub fn barrier(&self, id: &str) -> Option<&JoinBarrier> {
        self.barriers.get(id)
    }
}

/// Borrowed engine state for one pass.
struct Walker<'a> {
    config: &'a ExperimentConfig,
    engine: &'a EngineConfig,
    registry: &'a NodeRegistry,
    services: &'a Services,
    progress: &'a ProgressTracker,
    barriers: &'a mut HashMap<NodeId, JoinBarrier>,
    events: &'a dyn EventSink,
    save_trigger: Option<&'a SaveTrigger>,
}

fn run_node(events: &dyn EventSink, node: &mut dyn Node, input: NodeInput<'_>) -> Result<NodeOutput, MedmlError> {
    let id = node.id().to_string();
    let kind = node.kind();
    info!(node_id = %id, node_kind = %kind, sequence = node.core().sequence(), "executing node");
    events.emit(
        types::NODE_STARTED,
        Some(json!({"node_id": id, "node_kind": kind.as_str()})),
    );

    let timer = SpanTimer::start(id.as_str());
    let output = node.execute(input).map_err(|err| {
        error!(node_id = %id, node_kind = %kind, error = %err, "node failed");
        err
    })?;
    let duration_ms = timer.finish();

    let event = if output.is_complete() {
        info!(node_id = %id, node_kind = %kind, duration_ms, "node completed");
        types::NODE_COMPLETED
    } else {
        warn!(node_id = %id, node_kind = %kind, duration_ms, "node waiting for other branches");
        types::NODE_HELD
    };
    events.emit(
        event,
        Some(json!({"node_id": id, "node_kind": kind.as_str(), "duration_ms": duration_ms})),
    );
    Ok(output)
}

fn children_of<'s>(spec: &'s Map<String, Value>, id: &NodeId, empty: &'s Map<String, Value>) -> &'s Map<String, Value> {
    spec.get(id.as_str()).and_then(Value::as_object).unwrap_or(empty)
}

impl Walker<'_> {
    fn visit_roots(
        &mut self,
        roots: &mut [PipelineNodeState],
        spec: &Map<String, Value>,
        slot: &mut Map<String, Value>,
    ) -> Result<(), MedmlError> {
        let empty = Map::new();
        let no_upstream = NodePayload::new();
        for root in roots {
            let children = children_of(spec, root.node.id(), &empty);
            if root.node.has_run() && root.experiment.is_some() {
                self.skipped(root.node.as_mut());
            } else {
                let mut context = ExperimentContext::new();
                let input = NodeInput::new(&mut context, &no_upstream);
                let mut output = run_node(self.events, root.node.as_mut(), input)?;
                root.experiment = Some(output.take_experiment().unwrap_or(context));
                root.results = Some(NodeResults::from_output(None, &output));
            }
            self.descend(root, children, slot)?;
        }
        Ok(())
    }

    /// Visits the children of `prev`, executing those that have not run.
    fn execute_next(
        &mut self,
        prev: &dyn Node,
        spec: &Map<String, Value>,
        children: &mut [PipelineNodeState],
        slot: &mut Map<String, Value>,
        context: &ExperimentContext,
    ) -> Result<(), MedmlError> {
        let empty = Map::new();
        for child in children {
            let child_spec = children_of(spec, child.node.id(), &empty);
            if child.node.has_run() {
                self.skipped(child.node.as_mut());
            } else {
                let mut branch = context.clone();
                let kind = child.node.kind();
                let mut input = NodeInput::new(&mut branch, prev.info_for_next_node())
                    .with_upstream_id(prev.id())
                    .with_finalize(self.config.finalize && kind.is_training());
                if kind.is_join() {
                    let barrier = self.barriers.entry(child.node.id().clone()).or_default();
                    input = input.with_barrier(barrier);
                }
                let mut output = run_node(self.events, child.node.as_mut(), input)?;
                child.experiment = Some(output.take_experiment().unwrap_or(branch));
                child.results = Some(NodeResults::from_output(Some(prev.id()), &output));
            }
            if child.experiment.is_none() {
                child.experiment = Some(context.clone());
            }
            self.descend(child, child_spec, slot)?;
        }
        Ok(())
    }

    /// Records a visited position, then recurses unless the branch halts.
    fn descend(
        &mut self,
        state: &mut PipelineNodeState,
        spec: &Map<String, Value>,
        slot: &mut Map<String, Value>,
    ) -> Result<(), MedmlError> {
        self.progress.advance(state.node.name());
        let results = state.results.clone().unwrap_or_default();
        let next_slot = record_entry(slot, state.node.id().as_str(), spec, &results)?;
        if results.halts_branch() {
            debug!(node_id = %state.node.id(), "branch halted");
            return Ok(());
        }

        let context = state.experiment.clone().unwrap_or_default();
        self.execute_next(state.node.as_ref(), spec, &mut state.next_nodes, next_slot, &context)?;

        if !self.save_trigger.is_some_and(|t| t.matches(state.node.as_ref(), spec)) {
            return Ok(());
        }
        let saved = match state.saved.take() {
            Some(saved) if !state.node.just_run() => saved,
            _ => self.save_pass(state.node.as_ref(), &context)?,
        };
        record_entry(next_slot, SAVE_NODE_ID, &Map::new(), &saved)?;
        self.progress.advance(SAVE_NODE_ID);
        state.saved = Some(saved);
        Ok(())
    }

    fn skipped(&self, node: &mut dyn Node) {
        node.reset_just_run();
        debug!(node_id = %node.id(), node_kind = %node.kind(), "node already run");
        self.events.emit(
            types::NODE_SKIPPED,
            Some(json!({"node_id": node.id().as_str(), "node_kind": node.kind().as_str()})),
        );
    }

    /// Saves the models `node` forwards. The caller records the result as a
    /// `save` child of `node`.
    fn save_pass(&self, node: &dyn Node, context: &ExperimentContext) -> Result<NodeResults, MedmlError> {
        let ctx = BuildContext {
            config: self.config,
            engine: self.engine,
            services: self.services,
        };
        let definition = NodeDefinition::new(NodeKind::SaveModel.as_str(), Map::new());
        let mut save = self.registry.create(NodeId::from(SAVE_NODE_ID), definition, &ctx)?;

        let mut branch = context.clone();
        let input = NodeInput::new(&mut branch, node.info_for_next_node()).with_upstream_id(node.id());
        let output = run_node(self.events, save.as_mut(), input)?;

        let results = NodeResults::from_output(Some(node.id()), &output);
        self.events.emit(
            types::MODEL_SAVED,
            Some(json!({"node_id": node.id().as_str(), "models": Value::Object(results.data.clone())})),
        );
        Ok(results)
    }
}
