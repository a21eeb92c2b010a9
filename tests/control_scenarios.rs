//! Scenario tests for the action cycle, trial lifecycle, replay and pause
//! handling, driven through scripted ports.

mod common;

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;

use common::{
    flat_scores, occupied_frame, request, stack_state, test_config, FixedScorer, MemoryStore,
    ScriptedRobot,
};
use stackbot::application::{
    ActionExecutor, ActionSettings, ExperienceReplay, PauseControl, ProgressPolicy, QualityMonitor,
    ReplayBuffer, RunCoordinator, RunPorts, RunState, StopReason, TrialLifecycle,
};
use stackbot::domain::errors::RunError;
use stackbot::domain::models::{
    ActionIndex, BlockColor, Config, FailureKind, GoalMask, Primitive, ReplayConfig, RunMode,
    StructureMeasurement, SuccessFlags, TaskVariant, TransitionRecord,
};

fn executor(
    config: &Config,
    robot: &Arc<ScriptedRobot>,
    scorer: &Arc<FixedScorer>,
    state: &Arc<tokio::sync::RwLock<stackbot::domain::models::SharedControlState>>,
) -> ActionExecutor {
    ActionExecutor::new(
        robot.clone(),
        scorer.clone(),
        Arc::clone(state),
        ActionSettings::from_config(config),
        ProgressPolicy::new(TaskVariant::Stack, RunMode::Training, &config.progress),
        config.run.seed,
    )
}

fn lifecycle(config: &Config, robot: &Arc<ScriptedRobot>, store: &Arc<MemoryStore>) -> TrialLifecycle {
    TrialLifecycle::new(config, robot.clone(), store.clone(), store.clone(), store.clone())
}

fn grasp_record(iteration: u64) -> TransitionRecord {
    TransitionRecord {
        iteration,
        trial: 0,
        primitive: Primitive::Grasp,
        index: ActionIndex::new(0, 1, 1),
        success: SuccessFlags {
            grasp: true,
            ..SuccessFlags::default()
        },
        change_detected: true,
        predicted_value: 0.2,
        reward_value: 1.0,
        label_value: 1.0 + iteration as f64 * 0.1,
        progress_height: 1,
        goal_target: None,
        recorded_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_final_place_completes_trial() {
    let config = test_config();
    let robot = Arc::new(ScriptedRobot::new(4).with_measurements([StructureMeasurement {
        height: 4,
        order: Some(common::rbgy()),
    }]));
    let scorer = Arc::new(FixedScorer::new(flat_scores(0.1, 0.5, 0.5)));
    let store = Arc::new(MemoryStore::default());
    let state = stack_state(2);
    {
        let mut s = state.write().await;
        s.chosen_primitive = Some(Primitive::Grasp);
        s.outcome.grasp = true;
        s.executing_action = true;
    }

    let report = executor(&config, &robot, &scorer, &state)
        .run_cycle(request(0, flat_scores(0.1, 0.5, 0.5)))
        .await
        .unwrap();
    assert_eq!(report.primitive, Primitive::Place);

    {
        let s = state.read().await;
        assert!(s.trial_complete);
        assert!(s.trial_success);
        assert_eq!(s.outcome, SuccessFlags::all_true());
        assert_eq!(s.progress_height, 4);
        assert_eq!(s.stats.partial_stacks, 1);
        assert_eq!(s.stats.full_stacks, 1);
        assert_eq!(s.stats.successful_trials, 1);
        assert_eq!(s.goal.progress_index(), 1);
        assert!(!s.executing_action);
    }

    let mut quality = QualityMonitor::new(&config.watchdog);
    let summary = lifecycle(&config, &robot, &store)
        .end_trial(&state, &mut quality)
        .await;
    assert!(summary.success);
    assert_eq!(summary.trial, 0);
    assert_eq!(summary.next_trial, 1);

    let s = state.read().await;
    assert_eq!(s.goal.trial(), 1);
    assert!(!s.trial_complete);
    assert!(s.finalize_log_pending);
    assert_eq!(s.actions_in_trial, 0);
    assert_eq!(robot.repositions(), 1);
}

#[tokio::test]
async fn test_push_toppling_stack_resets_scene() {
    let config = test_config();
    let robot = Arc::new(ScriptedRobot::new(4).with_measurements([StructureMeasurement::height_only(1)]));
    let scorer = Arc::new(FixedScorer::new(flat_scores(0.9, 0.1, 0.1)));
    let state = stack_state(3);
    state.write().await.outcome.partial_stack = true;

    let report = executor(&config, &robot, &scorer, &state)
        .run_cycle(request(4, flat_scores(0.9, 0.1, 0.1)))
        .await
        .unwrap();
    assert_eq!(report.primitive, Primitive::Push);

    let s = state.read().await;
    assert!(s.trial_complete);
    assert!(!s.trial_success);
    assert_eq!(s.failure, Some(FailureKind::Toppled));
    assert_eq!(s.outcome, SuccessFlags::default());
    assert_eq!(s.goal.progress_index(), 1);
    assert_eq!(s.progress_height, 1);
    assert_eq!(robot.repositions(), 1);
}

#[tokio::test]
async fn test_failed_place_keeps_trial_open() {
    let config = test_config();
    let robot = Arc::new(
        ScriptedRobot::new(4)
            .with_measurements([StructureMeasurement::height_only(3)])
            .with_results([false]),
    );
    let scorer = Arc::new(FixedScorer::new(flat_scores(0.1, 0.5, 0.5)));
    let state = stack_state(3);
    {
        let mut s = state.write().await;
        s.chosen_primitive = Some(Primitive::Grasp);
        s.outcome.grasp = true;
    }

    executor(&config, &robot, &scorer, &state)
        .run_cycle(request(1, flat_scores(0.1, 0.5, 0.5)))
        .await
        .unwrap();

    let s = state.read().await;
    assert!(!s.trial_complete);
    assert!(!s.outcome.place);
    assert!(!s.outcome.partial_stack);
    assert_eq!(s.goal.progress_index(), 3);
    assert_eq!(s.goal.current_target(), Some(BlockColor::Yellow));
    assert_eq!(robot.repositions(), 0);
}

#[tokio::test]
async fn test_repeated_failure_detection_ends_trial_once() {
    let config = test_config();
    let robot = Arc::new(ScriptedRobot::new(4));
    let store = Arc::new(MemoryStore::default());
    let state = stack_state(2);

    {
        let mut s = state.write().await;
        assert!(s.fail_trial(FailureKind::Toppled));
        assert!(!s.fail_trial(FailureKind::Stagnation));
        assert!(!s.complete_trial());
        assert_eq!(s.failure, Some(FailureKind::Toppled));
    }

    let mut lifecycle = lifecycle(&config, &robot, &store);
    let mut quality = QualityMonitor::new(&config.watchdog);
    let summary = lifecycle.end_trial(&state, &mut quality).await;
    assert_eq!(summary.failure, Some(FailureKind::Toppled));

    let s = state.read().await;
    assert_eq!(s.goal.trial(), 1);
    assert_eq!(s.stats.failed_trials, 1);
    assert_eq!(s.stats.successful_trials, 0);
    assert!(!s.trial_complete);
}

#[tokio::test]
async fn test_finalize_saves_state_and_rearms_heights() {
    let mut config = test_config();
    config.run.max_total_actions = Some(10);
    let robot = Arc::new(ScriptedRobot::new(4));
    let store = Arc::new(MemoryStore::default());
    let state = stack_state(3);
    state.write().await.finalize_log_pending = true;

    let lifecycle = lifecycle(&config, &robot, &store);
    assert!(!lifecycle.finalize_pending(&state, 9).await);
    assert!(lifecycle.finalize_pending(&state, 10).await);

    let s = state.read().await;
    assert!(!s.finalize_log_pending);
    assert_eq!(s.progress_height, 1);
    assert_eq!(s.previous_progress_height, 1);
    assert_eq!(store.state_count(), 2);
    assert_eq!(store.saved_tags(), vec!["latest", "latest"]);
}

#[tokio::test]
async fn test_replay_falls_back_to_whole_history() {
    let scorer = Arc::new(FixedScorer::new(flat_scores(0.1, 0.5, 0.5)));
    let config = ReplayConfig {
        all_history_prob: 0.0,
        ..ReplayConfig::default()
    };
    let mut replay = ExperienceReplay::new(scorer.clone(), ReplayBuffer::new(16), &config, 3);
    for iteration in 0..4 {
        replay.push(grasp_record(iteration), Arc::new(occupied_frame()));
    }

    let pick = replay.sample(Primitive::Push, true).unwrap();
    assert!(pick.fallback);

    let pick = replay.sample(Primitive::Grasp, true).unwrap();
    assert!(!pick.fallback);

    let sample = replay.sample_and_train(Primitive::Place, false).await.unwrap().unwrap();
    assert_eq!(sample.primitive, Primitive::Grasp);
    assert_eq!(scorer.updates(), 1);
}

#[tokio::test]
async fn test_replay_skips_records_without_frames() {
    let scorer = Arc::new(FixedScorer::new(flat_scores(0.1, 0.5, 0.5)));
    let buffer = ReplayBuffer::with_records(vec![grasp_record(0), grasp_record(1)], 16);
    let mut replay = ExperienceReplay::new(scorer.clone(), buffer, &ReplayConfig::default(), 3);

    assert!(replay.sample(Primitive::Grasp, true).is_none());
    assert!(replay.sample_and_train(Primitive::Grasp, true).await.unwrap().is_none());
    assert_eq!(scorer.updates(), 0);

    replay.push(grasp_record(2), Arc::new(occupied_frame()));
    let pick = replay.sample(Primitive::Grasp, true).unwrap();
    assert_eq!(replay.buffer().records()[pick.position].iteration, 2);
}

#[test]
fn test_pause_window_hysteresis() {
    let pause = PauseControl::new(&test_config().pause);
    let t0 = Instant::now();

    assert_eq!(pause.interrupt(t0), RunState::Paused);
    assert_eq!(pause.pause_count(t0 + Duration::from_secs(1)), 1);
    assert_eq!(pause.pause_count(t0 + Duration::from_secs(6)), 0);

    let t1 = t0 + Duration::from_secs(6);
    assert_eq!(pause.interrupt(t1), RunState::Running);

    let t2 = t1 + Duration::from_secs(10);
    assert_eq!(pause.interrupt(t2), RunState::Paused);
    assert_eq!(pause.interrupt(t2 + Duration::from_millis(300)), RunState::Paused);
    assert_eq!(pause.interrupt(t2 + Duration::from_millis(600)), RunState::StopRequested);
    assert!(pause.stop_requested());
    assert!(!pause.hard_stop_requested());
}

fn scripted_ports(robot: &Arc<ScriptedRobot>, scorer: &Arc<FixedScorer>, store: &Arc<MemoryStore>) -> RunPorts {
    RunPorts {
        robot: robot.clone(),
        scorer: scorer.clone(),
        transitions: store.clone(),
        states: store.clone(),
        snapshots: store.clone(),
    }
}

fn loop_config() -> Config {
    let mut config = test_config();
    config.replay.idle_sleep_ms = 5;
    config
}

#[tokio::test]
async fn test_run_stops_at_total_action_budget() {
    let mut config = loop_config();
    config.run.max_total_actions = Some(3);
    let robot = Arc::new(ScriptedRobot::new(4));
    let scorer = Arc::new(FixedScorer::new(flat_scores(0.1, 0.5, 0.5)));
    let store = Arc::new(MemoryStore::default());
    let pause = Arc::new(PauseControl::new(&config.pause));

    let summary = RunCoordinator::new(config, scripted_ports(&robot, &scorer, &store), pause)
        .run()
        .await
        .unwrap();

    assert_eq!(summary.stop_reason, StopReason::TotalActionBudget);
    assert_eq!(summary.first_iteration, 0);
    assert_eq!(summary.last_iteration, 3);
    assert_eq!(robot.executed().len(), 3);

    let records = store.record_list();
    let iterations: Vec<u64> = records.iter().map(|r| r.iteration).collect();
    assert_eq!(iterations, vec![0, 1, 2]);
    assert!(scorer.updates() >= 3);
    assert!(store.saved_tags().iter().any(|t| t == "latest"));
    assert!(store.state_count() >= 1);
}

#[tokio::test]
async fn test_stop_request_finishes_current_action() {
    let config = loop_config();
    let robot = Arc::new(ScriptedRobot::new(4));
    let scorer = Arc::new(FixedScorer::new(flat_scores(0.1, 0.5, 0.5)));
    let store = Arc::new(MemoryStore::default());
    let pause = Arc::new(PauseControl::new(&config.pause));
    assert_eq!(pause.interrupt(Instant::now()), RunState::Paused);

    let operator = {
        let pause = Arc::clone(&pause);
        let robot = Arc::clone(&robot);
        tokio::spawn(async move {
            sleep(Duration::from_millis(300)).await;
            let idle_while_paused = robot.executed().is_empty();
            pause.interrupt(Instant::now());
            pause.interrupt(Instant::now());
            idle_while_paused
        })
    };

    let summary = RunCoordinator::new(config, scripted_ports(&robot, &scorer, &store), pause)
        .run()
        .await
        .unwrap();

    assert!(operator.await.unwrap());
    assert_eq!(summary.stop_reason, StopReason::Operator);
    assert_eq!(robot.executed().len(), 1);
    assert_eq!(store.record_list().len(), 1);
}

#[tokio::test]
async fn test_hard_stop_abandons_pending_action() {
    let config = loop_config();
    let robot = Arc::new(ScriptedRobot::new(4));
    let scorer = Arc::new(FixedScorer::new(flat_scores(0.1, 0.5, 0.5)));
    let store = Arc::new(MemoryStore::default());
    let pause = Arc::new(PauseControl::new(&config.pause));
    pause.interrupt(Instant::now());

    let operator = {
        let pause = Arc::clone(&pause);
        tokio::spawn(async move {
            sleep(Duration::from_millis(200)).await;
            for _ in 0..4 {
                pause.interrupt(Instant::now());
            }
        })
    };

    let result = RunCoordinator::new(config, scripted_ports(&robot, &scorer, &store), pause)
        .run()
        .await;
    operator.await.unwrap();

    assert!(matches!(result, Err(RunError::HardStop { iterations: 0 })));
    assert!(robot.executed().is_empty());
}

#[tokio::test]
async fn test_resume_continues_after_logged_iterations() {
    let records: Vec<TransitionRecord> = (0..5)
        .map(|i| TransitionRecord {
            trial: i / 2,
            ..grasp_record(i)
        })
        .collect();
    let mut config = loop_config();
    config.run.max_total_actions = Some(7);
    let robot = Arc::new(ScriptedRobot::new(4));
    let scorer = Arc::new(FixedScorer::new(flat_scores(0.1, 0.5, 0.5)));
    let store = Arc::new(MemoryStore::with_records(records));
    let pause = Arc::new(PauseControl::new(&config.pause));

    let coordinator = RunCoordinator::new(config, scripted_ports(&robot, &scorer, &store), pause)
        .resume()
        .await
        .unwrap();
    {
        let state = coordinator.state();
        let s = state.read().await;
        assert_eq!(s.goal.trial(), 3);
        assert!(!s.trial_complete);
        assert_eq!(s.goal.progress_index(), 1);
    }

    let summary = coordinator.run().await.unwrap();
    assert_eq!(summary.first_iteration, 5);
    assert_eq!(summary.last_iteration, 7);

    let records = store.record_list();
    let resumed = &records[5..];
    assert_eq!(resumed.len(), 2);
    assert!(resumed.iter().all(|r| r.iteration >= 5 && r.trial >= 3));
}

#[tokio::test]
async fn test_scorer_sees_current_goal_target() {
    let mut config = loop_config();
    config.run.goal_conditioned = true;
    config.run.max_total_actions = Some(2);
    let robot = Arc::new(ScriptedRobot::new(4));
    let scorer = Arc::new(FixedScorer::new(flat_scores(0.1, 0.5, 0.5)));
    let store = Arc::new(MemoryStore::default());
    let pause = Arc::new(PauseControl::new(&config.pause));

    let coordinator = RunCoordinator::new(config, scripted_ports(&robot, &scorer, &store), pause);
    let target = coordinator.state().read().await.goal.current_target();
    assert!(target.is_some());
    coordinator.run().await.unwrap();

    let targets = scorer.targets();
    assert!(!targets.is_empty());
    assert_eq!(targets[0], target);
    assert_eq!(store.record_list()[0].goal_target, target);
}

#[tokio::test]
async fn test_unconditioned_run_scores_without_target() {
    let mut config = loop_config();
    config.run.max_total_actions = Some(2);
    let robot = Arc::new(ScriptedRobot::new(4));
    let scorer = Arc::new(FixedScorer::new(flat_scores(0.1, 0.5, 0.5)));
    let store = Arc::new(MemoryStore::default());
    let pause = Arc::new(PauseControl::new(&config.pause));

    RunCoordinator::new(config, scripted_ports(&robot, &scorer, &store), pause)
        .run()
        .await
        .unwrap();

    assert!(scorer.targets().iter().all(Option::is_none));
}

#[tokio::test]
async fn test_goal_mask_needs_one_weight_per_pixel() {
    let config = loop_config();
    let robot = Arc::new(ScriptedRobot::new(4));
    let scorer = Arc::new(FixedScorer::new(flat_scores(0.1, 0.5, 0.5)));
    let store = Arc::new(MemoryStore::default());
    let coordinator = || {
        let pause = Arc::new(PauseControl::new(&config.pause));
        RunCoordinator::new(config.clone(), scripted_ports(&robot, &scorer, &store), pause)
    };

    let short = GoalMask {
        rows: 4,
        cols: 4,
        weights: vec![1.0; 3],
    };
    assert!(coordinator().with_goal_mask(short).is_err());

    let full = GoalMask {
        rows: 4,
        cols: 4,
        weights: vec![1.0; 16],
    };
    assert!(coordinator().with_goal_mask(full).is_ok());
}
