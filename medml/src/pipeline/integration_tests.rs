//! Scenario tests for experiment execution.

#[cfg(test)]
mod tests {
    use crate::config::{EngineConfig, ExperimentConfig, NodeDefinition};
    use crate::core::NodeKind;
    use crate::errors::{codes, MedmlError};
    use crate::events::{types, CollectingEventSink, EventSink};
    use crate::nodes::NodeRegistry;
    use crate::pipeline::{Experiment, ProgressTracker, RESULTS_LABEL};
    use crate::testing::{
        assert_no_result_at, assert_progress_finished, assert_result_at, ConfigFixture, CountingNode,
        ExecutionLog, MockEnvironment,
    };
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::sync::Arc;

    /// Records the progress percentage whenever an event arrives.
    #[derive(Debug)]
    struct ProgressRecorder {
        tracker: ProgressTracker,
        seen: Mutex<Vec<f64>>,
    }

    impl EventSink for ProgressRecorder {
        fn emit(&self, _event_type: &str, _data: Option<Value>) {
            self.seen.lock().push(self.tracker.snapshot().now);
        }
    }

    /// Counting nodes for every kind except joins and saving.
    fn counting_registry(log: &ExecutionLog) -> Arc<NodeRegistry> {
        let kinds = [
            NodeKind::Dataset,
            NodeKind::Clean,
            NodeKind::Split,
            NodeKind::TrainModel,
            NodeKind::CompareModels,
            NodeKind::LoadModel,
        ];
        let registry = kinds
            .into_iter()
            .fold(NodeRegistry::builtin(), |r, k| r.with(k, CountingNode::factory(log.clone())));
        Arc::new(registry)
    }

    struct Harness {
        env: MockEnvironment,
        log: ExecutionLog,
        events: Arc<CollectingEventSink>,
        experiment: Experiment,
    }

    impl Harness {
        fn new(config: ExperimentConfig) -> Result<Self, MedmlError> {
            let env = MockEnvironment::new();
            let log = ExecutionLog::default();
            let events = Arc::new(CollectingEventSink::new());
            let experiment = Experiment::new(config, counting_registry(&log), env.services(), EngineConfig::default())?
                .with_event_sink(events.clone());
            Ok(Self { env, log, events, experiment })
        }

        fn started(&self, id: &str) -> usize {
            self.events.count_for_node(types::NODE_STARTED, id)
        }

        fn held(&self, id: &str) -> usize {
            self.events.count_for_node(types::NODE_HELD, id)
        }
    }

    fn fan_in() -> ConfigFixture {
        ConfigFixture::new("page-1")
            .node("D", "dataset", json!({}))
            .node("T1", "train_model", json!({"n": 1}))
            .node("T2", "train_model", json!({"n": 2}))
            .definition(
                "C",
                NodeDefinition::new(
                    "combine_models",
                    json!({"optimize_fct": "blend_models"}).as_object().cloned().unwrap(),
                )
                .with_associated_id("T1.T2"),
            )
            .pipelines(json!({"D": {"T1": {"C": {}}, "T2": {"C": {}}}}))
    }

    fn linear() -> ConfigFixture {
        ConfigFixture::new("page-2")
            .node("D", "dataset", json!({}))
            .node("S", "split", json!({}))
            .node("T1", "train_model", json!({"n": 1}))
            .node("T2", "train_model", json!({"n": 2}))
            .pipelines(json!({"D": {"S": {"T1": {}}, "T2": {}}}))
    }

    #[test]
    fn test_fan_in_runs_shared_ancestors_once() {
        let mut h = Harness::new(fan_in().build()).unwrap();
        assert_eq!(h.experiment.config().nb_nodes_to_run, 5);
        h.experiment.start().unwrap();

        assert_eq!(h.log.count("D"), 1);
        assert_eq!(h.log.count("T1"), 1);
        assert_eq!(h.log.count("T2"), 1);
        assert_eq!(h.started("C"), 2);
        assert_eq!(h.events.of_type(types::NODE_HELD).len(), 1);

        let results = h.experiment.results();
        assert_eq!(
            assert_result_at(results, &["D", "T1", "C"]),
            &json!({"prev_node_complete": false})
        );
        let closed = assert_result_at(results, &["D", "T2", "C"]);
        assert_eq!(closed["prev_node_complete"], json!(true));
        assert_eq!(
            closed["trained_models"],
            json!({"VotingClassifier": {"members": ["T1", "T2"]}})
        );
        assert_progress_finished(&h.experiment.progress_tracker());
        assert_eq!(h.experiment.barrier("C").map(|b| b.len()), Some(2));
    }

    #[test]
    fn test_unchanged_rerun_executes_nothing() {
        let mut h = Harness::new(fan_in().build()).unwrap();
        let first = h.experiment.start().unwrap().clone();
        let executed = h.log.total();

        h.experiment.update(fan_in().build()).unwrap();
        let second = h.experiment.start().unwrap().clone();

        assert_eq!(h.log.total(), executed);
        assert_eq!(h.started("C"), 2);
        assert_eq!(first, second);
        assert_progress_finished(&h.experiment.progress_tracker());
    }

    fn fan_in_with(method: &str) -> ConfigFixture {
        fan_in().definition(
            "C",
            NodeDefinition::new(
                "combine_models",
                json!({"optimize_fct": method}).as_object().cloned().unwrap(),
            )
            .with_associated_id("T1.T2"),
        )
    }

    #[test]
    fn test_changed_join_holds_then_closes_once() {
        let mut h = Harness::new(fan_in().build()).unwrap();
        h.experiment.start().unwrap();
        h.events.clear();

        h.experiment.update(fan_in_with("stack_models").build()).unwrap();
        assert!(h.experiment.barrier("C").is_none());
        h.experiment.start().unwrap();

        assert_eq!(h.started("C"), 2);
        assert_eq!(h.held("C"), 1);
        let results = h.experiment.results();
        assert_eq!(
            assert_result_at(results, &["D", "T1", "C"]),
            &json!({"prev_node_complete": false})
        );
        assert_eq!(
            assert_result_at(results, &["D", "T2", "C"])["trained_models"],
            json!({"StackingClassifier": {"members": ["T1", "T2"]}})
        );
        assert_eq!(h.log.total(), 3, "D, T1 and T2 are reused");
    }

    #[test]
    fn test_changed_branch_rebuilds_every_join_position() {
        let config = || {
            fan_in()
                .node("L", "load_model", json!({}))
                .pipelines(json!({"D": {"T1": {"C": {}}, "T2": {"C": {"L": {}}}}}))
        };
        let mut h = Harness::new(config().build()).unwrap();
        h.experiment.start().unwrap();
        assert_eq!(h.log.count("L"), 1);
        h.events.clear();

        h.experiment
            .update(config().node("T1", "train_model", json!({"n": 10})).build())
            .unwrap();
        h.experiment.start().unwrap();

        assert_eq!(h.log.count("T1"), 2);
        assert_eq!(h.log.count("T2"), 1);
        assert_eq!(h.started("C"), 2);
        assert_eq!(h.held("C"), 1);
        assert_eq!(h.log.count("L"), 2, "the subtree below the closing position runs again");
        assert_eq!(
            assert_result_at(h.experiment.results(), &["D", "T1", "C"]),
            &json!({"prev_node_complete": false})
        );
        assert_eq!(h.experiment.barrier("C").map(|b| b.len()), Some(2));
    }

    #[test]
    fn test_changed_node_reruns_only_its_subtree() {
        let mut h = Harness::new(linear().build()).unwrap();
        h.experiment.start().unwrap();

        let changed = linear().node("S", "split", json!({"k": 3})).build();
        h.experiment.update(changed).unwrap();
        h.experiment.start().unwrap();

        assert_eq!(h.log.count("D"), 1);
        assert_eq!(h.log.count("S"), 2);
        assert_eq!(h.log.count("T1"), 2);
        assert_eq!(h.log.count("T2"), 1);
        assert_eq!(
            h.events.of_type(types::NODE_SKIPPED).len(),
            2,
            "D and T2 are reused"
        );
    }

    #[test]
    fn test_changed_leaf_leaves_ancestors_alone() {
        let mut h = Harness::new(linear().build()).unwrap();
        h.experiment.start().unwrap();

        h.experiment
            .update(linear().node("T1", "train_model", json!({"n": 10})).build())
            .unwrap();
        h.experiment.start().unwrap();

        assert_eq!(h.log.order(), vec!["D", "S", "T1", "T2", "T1"]);
    }

    #[test]
    fn test_join_with_missing_branch_stays_held() {
        let config = fan_in()
            .node("L", "load_model", json!({}))
            .pipelines(json!({"D": {"T1": {"C": {"L": {}}}}}))
            .build();
        let mut h = Harness::new(config).unwrap();
        h.experiment.start().unwrap();

        let results = h.experiment.results();
        assert_eq!(
            assert_result_at(results, &["D", "T1", "C"]),
            &json!({"prev_node_complete": false})
        );
        assert_no_result_at(results, &["D", "T1", "C", "L"]);
        assert_progress_finished(&h.experiment.progress_tracker());
        assert_eq!(h.experiment.progress().current_label, RESULTS_LABEL);
    }

    #[test]
    fn test_progress_is_monotonic() {
        let env = MockEnvironment::new();
        let log = ExecutionLog::default();
        let tracker = ProgressTracker::new();
        let recorder = Arc::new(ProgressRecorder { tracker: tracker.clone(), seen: Mutex::new(Vec::new()) });
        let mut experiment = Experiment::new(
            fan_in().build(),
            counting_registry(&log),
            env.services(),
            EngineConfig::default(),
        )
        .unwrap()
        .with_progress_tracker(tracker.clone())
        .with_event_sink(recorder.clone());

        experiment.start().unwrap();

        let seen = recorder.seen.lock().clone();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {seen:?}");
        assert_eq!(seen.last().copied(), Some(100.0));
        assert!(seen.contains(&20.0));
    }

    #[test]
    fn test_finalize_runs_save_pass() {
        let config = linear()
            .pipelines(json!({"D": {"T1": {}}}))
            .finalize("T1", "best model")
            .extra("identifiers", json!({"models": "models-folder"}))
            .build();
        let mut h = Harness::new(config).unwrap();
        h.experiment.start().unwrap();

        assert_eq!(h.experiment.progress_tracker().total(), 3);
        let saved = assert_result_at(h.experiment.results(), &["D", "T1", "save"]);
        let metadata_id = saved["best model"].as_str().unwrap();
        assert!(!metadata_id.is_empty());

        let folder = h.env.artifacts.find_by_name("best model.medmodel").unwrap();
        assert_eq!(folder.parent_id.as_deref(), Some("models-folder"));
        assert_eq!(h.events.of_type(types::MODEL_SAVED).len(), 1);
        assert_progress_finished(&h.experiment.progress_tracker());
    }

    #[test]
    fn test_unchanged_finalize_rerun_keeps_save_entry() {
        let config = || {
            linear()
                .pipelines(json!({"D": {"T1": {}}}))
                .finalize("T1", "best model")
                .build()
        };
        let mut h = Harness::new(config()).unwrap();
        let first = h.experiment.start().unwrap().clone();
        let stored = h.env.artifacts.len();

        h.experiment.update(config()).unwrap();
        let second = h.experiment.start().unwrap().clone();

        assert_eq!(first, second);
        assert!(second.data_at(&["D", "T1", "save"]).is_some());
        assert_eq!(h.env.artifacts.len(), stored);
        assert_eq!(h.events.of_type(types::MODEL_SAVED).len(), 1);
        assert_progress_finished(&h.experiment.progress_tracker());
    }

    #[test]
    fn test_finalize_pruning_keeps_target_instances() {
        let config = ConfigFixture::new("page-3")
            .node("D", "dataset", json!({}))
            .node("train", "train_model", json!({}))
            .model("m1", "rf")
            .model("m2", "lr")
            .pipelines(json!({"D": {"train*m1": {}, "train*m2": {}}}))
            .finalize("train*m2", "final")
            .build();
        let mut h = Harness::new(config).unwrap();
        h.experiment.start().unwrap();

        assert_eq!(h.log.order(), vec!["D", "train*m2"]);
        assert!(h.experiment.graph().find(&["D", "train*m1"]).is_none());
        assert!(h.experiment.config().definition("train*m2").is_some());
        assert_result_at(h.experiment.results(), &["D", "train*m2", "save"]);
    }

    #[test]
    fn test_finalize_change_rebuilds_everything() {
        let mut h = Harness::new(linear().build()).unwrap();
        h.experiment.start().unwrap();
        assert_eq!(h.log.total(), 4);

        h.experiment.update(linear().finalize("T2", "m").build()).unwrap();
        h.experiment.start().unwrap();
        assert_eq!(h.log.count("D"), 2);
        assert_eq!(h.log.count("T2"), 2);
    }

    #[test]
    fn test_overlapping_user_split_halts_branch() {
        let config = ConfigFixture::new("page-4")
            .node("D", "dataset", json!({}))
            .node("T1", "train_model", json!({}))
            .pipelines(json!({"D": {"S": {"T1": {}}}}))
            .definition(
                "S",
                NodeDefinition::new(
                    "split",
                    json!({
                        "outer_split_type": "user_defined",
                        "outer": {"user_defined": {"train_indices": [0], "test_indices": [0]}}
                    })
                    .as_object()
                    .cloned()
                    .unwrap(),
                ),
            )
            .build();
        let env = MockEnvironment::new();
        let log = ExecutionLog::default();
        let registry = NodeRegistry::builtin()
            .with(NodeKind::Dataset, CountingNode::factory(log.clone()))
            .with(NodeKind::TrainModel, CountingNode::factory(log.clone()));
        let mut experiment =
            Experiment::new(config, Arc::new(registry), env.services(), EngineConfig::default()).unwrap();
        experiment.start().unwrap();

        let results = experiment.results();
        assert_eq!(
            assert_result_at(results, &["D", "S"]),
            &json!({"error": "Overlapping indices in train and test sets."})
        );
        assert_no_result_at(results, &["D", "S", "T1"]);
        assert_eq!(log.count("T1"), 0);
    }

    #[test]
    fn test_node_error_aborts_and_keeps_partial_results() {
        let config = linear().node("T1", "train_model", json!({"fail": true})).build();
        let mut h = Harness::new(config).unwrap();

        let err = h.experiment.start().unwrap_err();
        assert!(matches!(err, MedmlError::Node(ref e) if e.node_id == "T1"));
        assert_result_at(h.experiment.results(), &["D", "S"]);
        assert_no_result_at(h.experiment.results(), &["D", "T2"]);
        assert_eq!(h.events.of_type(types::EXPERIMENT_FAILED).len(), 1);
        assert!(h.experiment.progress().now < 100.0);
    }

    #[test]
    fn test_config_error_before_any_execution() {
        let config = linear().pipelines(json!({"D": {"ghost*x": {}}})).build();
        let err = Harness::new(config).err().unwrap();
        assert!(matches!(err, MedmlError::Config(ref e) if e.code() == Some(codes::BAD_INSTANCE)));
    }

    #[test]
    fn test_disallowed_join_method_is_config_error() {
        let config = fan_in()
            .definition(
                "C",
                NodeDefinition::new(
                    "combine_models",
                    json!({"optimize_fct": "bag_models"}).as_object().cloned().unwrap(),
                )
                .with_associated_id("T1.T2"),
            )
            .build();
        let err = Harness::new(config).err().unwrap();
        assert!(matches!(err, MedmlError::Config(ref e) if e.code() == Some(codes::DISALLOWED_CHOICE)));
    }
}
