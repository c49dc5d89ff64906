//! Long-lived experiments keyed by page id.
//!
//! The front end sends the whole configuration on every run. Keeping the
//! [`Experiment`] alive between runs lets `update` reuse every node whose
//! settings did not change.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, ExperimentConfig};
use crate::errors::MedmlError;
use crate::events::{EventSink, NoOpEventSink};
use crate::nodes::NodeRegistry;
use crate::pipeline::{Experiment, Progress, ProgressTracker, ResultsTree, RESULTS_LABEL};
use crate::toolkit::Services;

/// Experiments that survive between runs.
#[derive(Debug)]
pub struct ExperimentRegistry {
    experiments: DashMap<String, Arc<Mutex<Experiment>>>,
    trackers: DashMap<String, ProgressTracker>,
    results: DashMap<String, ResultsTree>,
    registry: Arc<NodeRegistry>,
    services: Services,
    engine: EngineConfig,
    events: Arc<dyn EventSink>,
}

impl ExperimentRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(registry: Arc<NodeRegistry>, services: Services, engine: EngineConfig) -> Self {
        Self {
            experiments: DashMap::new(),
            trackers: DashMap::new(),
            results: DashMap::new(),
            registry,
            services,
            engine,
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the sink handed to every new experiment.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Creates or updates the experiment for `config.page_id` and runs it on
    /// the blocking thread pool.
    ///
    /// Whatever the run recorded stays available through
    /// [`ExperimentRegistry::results`], also when it fails part way.
    pub async fn run(&self, config: ExperimentConfig) -> Result<ResultsTree, MedmlError> {
        let page_id = config.page_id.clone();
        let existing = self.experiments.get(&page_id).map(|e| Arc::clone(e.value()));

        let (experiment, pending) = match existing {
            Some(experiment) => {
                debug!(page_id = %page_id, "reusing experiment");
                (experiment, Some(config))
            }
            None => {
                info!(page_id = %page_id, "creating experiment");
                let tracker = ProgressTracker::new();
                let experiment = Experiment::new(
                    config,
                    Arc::clone(&self.registry),
                    self.services.clone(),
                    self.engine.clone(),
                )?
                .with_progress_tracker(tracker.clone())
                .with_event_sink(Arc::clone(&self.events));
                let experiment = Arc::new(Mutex::new(experiment));
                self.trackers.insert(page_id.clone(), tracker);
                self.experiments.insert(page_id.clone(), Arc::clone(&experiment));
                (experiment, None)
            }
        };

        let (outcome, results) = tokio::task::spawn_blocking(move || {
            let mut experiment = experiment.lock();
            let outcome = match pending {
                Some(config) => experiment.update(config),
                None => Ok(()),
            }
            .and_then(|()| experiment.start().map(|_| ()));
            (outcome, experiment.last_results().clone())
        })
        .await
        .map_err(|e| MedmlError::Internal(format!("experiment task failed: {e}")))?;

        self.results.insert(page_id.clone(), results.clone());
        if let Err(err) = outcome {
            warn!(page_id = %page_id, error = %err, "experiment run failed");
            return Err(err);
        }
        Ok(results)
    }

    /// Progress of the experiment's current or last run.
    pub fn progress(&self, page_id: &str) -> Option<Progress> {
        self.trackers.get(page_id).map(|t| t.snapshot())
    }

    /// Results of the experiment's last successful run.
    pub fn results(&self, page_id: &str) -> Option<ResultsTree> {
        let results = self.results.get(page_id)?.clone();
        if let Some(tracker) = self.trackers.get(page_id) {
            tracker.set_label(RESULTS_LABEL);
        }
        Some(results)
    }

    /// Drops an experiment and everything recorded for it.
    pub fn remove(&self, page_id: &str) -> bool {
        self.trackers.remove(page_id);
        self.results.remove(page_id);
        self.experiments.remove(page_id).is_some()
    }

    /// True when an experiment exists for `page_id`.
    pub fn contains(&self, page_id: &str) -> bool {
        self.experiments.contains_key(page_id)
    }

    /// Number of live experiments.
    pub fn len(&self) -> usize {
        self.experiments.len()
    }

    /// True when no experiment is live.
    pub fn is_empty(&self) -> bool {
        self.experiments.is_empty()
    }
}
