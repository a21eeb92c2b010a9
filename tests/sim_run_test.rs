//! End-to-end runs against the block-world simulator, heightmap scorer and
//! file-backed run store.

mod common;

use std::path::Path;
use std::sync::Arc;

use stackbot::adapters::scoring::HeightmapScorer;
use stackbot::adapters::sim::{BlockWorldSim, SimOptions};
use stackbot::adapters::storage::FileRunStore;
use stackbot::application::trial_lifecycle::LATEST_SNAPSHOT;
use stackbot::application::{PauseControl, RunCoordinator, RunPorts, StopReason};
use stackbot::domain::models::{Config, RunMode, TaskVariant};
use stackbot::domain::ports::{ModelSnapshots, StateStore, TransitionLog};

fn sim_config(runs_dir: &Path) -> Config {
    let mut config = Config::default();
    config.run.num_rotations = 2;
    config.run.max_total_actions = Some(6);
    config.run.seed = 7;
    config.storage.runs_dir = runs_dir.to_path_buf();
    config.replay.idle_sleep_ms = 5;
    config
}

async fn build_ports(config: &Config, store: &Arc<FileRunStore>) -> (RunPorts, Arc<HeightmapScorer>) {
    let robot = Arc::new(BlockWorldSim::new(SimOptions::from_config(config)));
    let scorer = Arc::new(HeightmapScorer::new(config.run.num_rotations, store.models_dir()));
    let ports = RunPorts {
        robot,
        scorer: scorer.clone(),
        transitions: store.clone(),
        states: store.clone(),
        snapshots: scorer.clone(),
    };
    (ports, scorer)
}

#[tokio::test]
async fn test_bounded_training_run_logs_every_action() {
    common::setup_test_logging();
    let runs = tempfile::tempdir().unwrap();
    let config = sim_config(runs.path());
    let store = Arc::new(FileRunStore::create(runs.path()).await.unwrap());
    store.write_config(&config).await.unwrap();
    let (ports, _scorer) = build_ports(&config, &store).await;
    let pause = Arc::new(PauseControl::new(&config.pause));

    let summary = RunCoordinator::new(config, ports, pause).run().await.unwrap();

    assert_eq!(summary.stop_reason, StopReason::TotalActionBudget);
    assert_eq!(summary.first_iteration, 0);
    assert_eq!(summary.last_iteration, 6);

    let records = store.records().await.unwrap();
    assert_eq!(records.len() as u64, summary.stats.actions);
    assert!(records.windows(2).all(|w| w[0].iteration < w[1].iteration));
    assert!(records.iter().all(|r| r.label_value.is_finite()));

    assert!(store.load_latest_state().await.unwrap().is_some());
    assert!(store.models_dir().join("model_latest.json").exists());
    assert!(store.dir().join("config.yaml").exists());
}

#[tokio::test]
async fn test_resumed_run_continues_iterations_and_trials() {
    let runs = tempfile::tempdir().unwrap();
    let config = sim_config(runs.path());
    let store = Arc::new(FileRunStore::create(runs.path()).await.unwrap());
    let (ports, _scorer) = build_ports(&config, &store).await;
    RunCoordinator::new(config.clone(), ports, Arc::new(PauseControl::new(&config.pause)))
        .run()
        .await
        .unwrap();
    let first = store.records().await.unwrap();
    let first_max_trial = first.iter().map(|r| r.trial).max().unwrap_or(0);
    drop(store);

    let dir = FileRunStore::latest_run(runs.path()).await.unwrap().unwrap();
    let store = Arc::new(FileRunStore::open(&dir).await.unwrap());
    let mut config = config;
    config.run.max_total_actions = Some(10);
    let (ports, scorer) = build_ports(&config, &store).await;
    assert!(scorer.load_snapshot(LATEST_SNAPSHOT).await.unwrap());

    let coordinator = RunCoordinator::new(config.clone(), ports, Arc::new(PauseControl::new(&config.pause)))
        .resume()
        .await
        .unwrap();
    let summary = coordinator.run().await.unwrap();
    assert_eq!(summary.first_iteration, 6);
    assert_eq!(summary.last_iteration, 10);

    let all = store.records().await.unwrap();
    assert!(all.windows(2).all(|w| w[0].iteration < w[1].iteration));
    assert!(all[first.len()..]
        .iter()
        .all(|r| r.iteration >= 6 && r.trial > first_max_trial));
}

#[tokio::test]
async fn test_testing_run_stops_at_trial_budget() {
    let runs = tempfile::tempdir().unwrap();
    let mut config = sim_config(runs.path());
    config.run.mode = RunMode::Testing;
    config.run.max_total_actions = None;
    config.run.max_actions_per_trial = 3;
    config.run.max_test_trials = 2;
    let store = Arc::new(FileRunStore::create(runs.path()).await.unwrap());
    let (ports, _scorer) = build_ports(&config, &store).await;

    let summary = RunCoordinator::new(config.clone(), ports, Arc::new(PauseControl::new(&config.pause)))
        .run()
        .await
        .unwrap();

    assert_eq!(summary.stop_reason, StopReason::TestTrialBudget);
    assert_eq!(summary.trials, 2);
    assert!(store.models_dir().join("model_pretrial.json").exists());
    assert!(!store.models_dir().join("model_latest.json").exists());
}

#[tokio::test]
async fn test_clearing_run_uses_grasps_only_for_progress() {
    let runs = tempfile::tempdir().unwrap();
    let mut config = sim_config(runs.path());
    config.run.task = TaskVariant::Clearing;
    config.policy.grasp_only = true;
    let store = Arc::new(FileRunStore::create(runs.path()).await.unwrap());
    let (ports, _scorer) = build_ports(&config, &store).await;

    let summary = RunCoordinator::new(config.clone(), ports, Arc::new(PauseControl::new(&config.pause)))
        .run()
        .await
        .unwrap();

    assert_eq!(summary.stats.places, 0);
    assert_eq!(summary.stats.pushes, 0);
    let records = store.records().await.unwrap();
    assert!(records.iter().all(|r| r.primitive == stackbot::Primitive::Grasp));
}
