//! RunCoordinator - the two-task control loop
//!
//! ```text
//!   main task                                  action task
//!   ─────────                                  ───────────
//!   end/finalize trials                        poll every 10ms
//!   capture + score                            take pending request
//!   label previous action, append log   ──▶    select ▸ execute ▸ evaluate
//!   watchdog checks                            write outcome
//!   enqueue request (executing_action=true)    executing_action=false
//!   replay / homing / sim timeout while waiting
//! ```
//!
//! Both tasks share one `Arc<RwLock<SharedControlState>>`; field ownership is
//! documented on the state type. Operator interrupts reach the loop through
//! [`PauseControl`], and the action task is stopped with a
//! `CancellationToken` once the main loop exits.
//!
//! Port failures inside the loop are logged and the loop carries on. Only a
//! hard stop, or the action task dying, ends a run with an error.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::action_executor::{ActionExecutor, ActionSettings};
use crate::application::pause_control::PauseControl;
use crate::application::progress::ProgressPolicy;
use crate::application::replay_sampler::{ExperienceReplay, ReplayBuffer};
use crate::application::reward::{
    detect_change, explore_probability, initial_no_change, update_no_change, RewardModel,
};
use crate::application::trial_lifecycle::{
    ResumePoint, TrialLifecycle, BEST_SNAPSHOT, PRETRIAL_SNAPSHOT,
};
use crate::application::watchdog::{QualityMonitor, SimTimeoutLadder, Watchdog, WorkspaceVerdict};
use crate::domain::errors::{DomainResult, RunError};
use crate::domain::models::{
    ActionReport, ActionRequest, ActionStats, BlockColor, Config, FailureKind, Frame, GoalCondition,
    GoalMask, GoalSequence, NoChangeCounters, Primitive, ScoreMaps, SharedControlState,
    SuccessFlags, TrainingSample, TransitionRecord,
};
use crate::domain::ports::{ModelSnapshots, RobotInterface, Scorer, StateStore, TransitionLog};

const ACTION_POLL: Duration = Duration::from_millis(10);

/// Ports a run is wired to.
#[derive(Clone)]
pub struct RunPorts {
    pub robot: Arc<dyn RobotInterface>,
    pub scorer: Arc<dyn Scorer>,
    pub transitions: Arc<dyn TransitionLog>,
    pub states: Arc<dyn StateStore>,
    pub snapshots: Arc<dyn ModelSnapshots>,
}

/// Why a run ended cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Operator,
    TotalActionBudget,
    TestTrialBudget,
}

/// Totals reported when a run ends cleanly.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub first_iteration: u64,
    pub last_iteration: u64,
    pub trials: u64,
    pub stats: ActionStats,
    pub stop_reason: StopReason,
}

/// An executed action waiting for the next observation to be labeled.
#[derive(Debug, Clone)]
struct PendingTransition {
    trial: u64,
    report: ActionReport,
    outcome: SuccessFlags,
    frame: Arc<Frame>,
    previous_height: usize,
    progress_height: usize,
    goal_target: Option<BlockColor>,
    trial_ended: bool,
}

/// Owns a run: shared state, ports and the two tasks.
pub struct RunCoordinator {
    config: Config,
    ports: RunPorts,
    state: Arc<RwLock<SharedControlState>>,
    pause: Arc<PauseControl>,
    cancel: CancellationToken,
    goal_mask: Option<GoalMask>,
    start_iteration: u64,
    history: Vec<TransitionRecord>,
}

impl RunCoordinator {
    pub fn new(config: Config, ports: RunPorts, pause: Arc<PauseControl>) -> Self {
        let goal = GoalSequence::new(
            BlockColor::PALETTE
                .iter()
                .copied()
                .take(config.run.num_objects.max(config.run.goal_size))
                .collect(),
            config.run.goal_size,
            config.run.start_offset,
        );
        let state = SharedControlState::new(config.run.task, goal);
        Self {
            config,
            ports,
            state: Arc::new(RwLock::new(state)),
            pause,
            cancel: CancellationToken::new(),
            goal_mask: None,
            start_iteration: 0,
            history: Vec::new(),
        }
    }

    /// Condition scoring on a language-derived goal mask.
    pub fn with_goal_mask(mut self, mask: GoalMask) -> DomainResult<Self> {
        mask.validate()?;
        info!(rows = mask.rows, cols = mask.cols, "Scoring with goal mask");
        self.goal_mask = Some(mask);
        Ok(self)
    }

    pub fn state(&self) -> Arc<RwLock<SharedControlState>> {
        Arc::clone(&self.state)
    }

    /// Continue a previous run from its transition log and latest snapshot.
    ///
    /// The trial counter comes from the log, never from the snapshot, and the
    /// resumed run opens a fresh trial.
    pub async fn resume(mut self) -> DomainResult<Self> {
        let records = self.ports.transitions.records().await?;
        let point = ResumePoint::from_records(&records);
        let snapshot = self.ports.states.load_latest_state().await?;
        {
            let mut state = self.state.write().await;
            if let Some(snapshot) = &snapshot {
                state.restore(snapshot);
            }
            state.goal.set_trial(point.trial);
            state.trial_complete = false;
            state.trial_success = false;
            state.failure = None;
            state.finalize_log_pending = false;
            state.actions_in_trial = 0;
            state.reset_heights();
            if state.variant.measures_structure() {
                state.goal.restart();
            }
        }
        info!(
            records = records.len(),
            next_iteration = point.next_iteration,
            trial = point.trial,
            restored_state = snapshot.is_some(),
            "Resuming run"
        );
        self.start_iteration = point.next_iteration;
        self.history = records;
        Ok(self)
    }

    /// Run until a stop condition; a hard stop is returned as an error.
    pub async fn run(self) -> Result<RunSummary, RunError> {
        let settings = ActionSettings::from_config(&self.config);
        let policy = ProgressPolicy::new(self.config.run.task, self.config.run.mode, &self.config.progress);
        let executor = Arc::new(ActionExecutor::new(
            Arc::clone(&self.ports.robot),
            Arc::clone(&self.ports.scorer),
            Arc::clone(&self.state),
            settings,
            policy,
            self.config.run.seed,
        ));
        let action_loop = spawn_action_loop(executor, Arc::clone(&self.pause), self.cancel.clone());

        let robot = Arc::clone(&self.ports.robot);
        let cancel = self.cancel.clone();
        let mut main = MainLoop::new(self, action_loop);
        let result = main.run().await;

        cancel.cancel();
        let joined = main.action_loop.await;
        if let Err(e) = robot.shutdown().await {
            warn!(error = %e, "Robot shutdown failed");
        }
        match joined {
            Err(e) => {
                error!(error = %e, "Action loop panicked");
                result.and(Err(RunError::ActionTask(e.to_string())))
            }
            Ok(()) => result,
        }
    }
}

fn spawn_action_loop(
    executor: Arc<ActionExecutor>,
    pause: Arc<PauseControl>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Action loop started");
        loop {
            if pause.hard_stop_requested() {
                break;
            }
            if !pause.is_paused() {
                if let Some(request) = executor.take_request().await {
                    executor.execute_request(request).await;
                    continue;
                }
            }
            tokio::select! {
                () = cancel.cancelled() => break,
                () = sleep(ACTION_POLL) => {}
            }
        }
        info!("Action loop stopped");
    })
}

/// Mutable state owned by the main task.
struct MainLoop {
    config: Config,
    ports: RunPorts,
    state: Arc<RwLock<SharedControlState>>,
    pause: Arc<PauseControl>,
    goal_mask: Option<GoalMask>,
    watchdog: Watchdog,
    ladder: SimTimeoutLadder,
    quality: QualityMonitor,
    lifecycle: TrialLifecycle,
    replay: ExperienceReplay,
    rewards: RewardModel,
    no_change: NoChangeCounters,
    first_iteration: u64,
    iteration: u64,
    previous: Option<PendingTransition>,
    last_recorded: Option<(Primitive, bool)>,
    stop_reason: Option<StopReason>,
    homing: Option<JoinHandle<DomainResult<bool>>>,
    homing_problems: u32,
    goal_target: Option<BlockColor>,
    action_loop: JoinHandle<()>,
}

impl MainLoop {
    fn new(coordinator: RunCoordinator, action_loop: JoinHandle<()>) -> Self {
        let RunCoordinator {
            config,
            ports,
            state,
            pause,
            goal_mask,
            start_iteration,
            history,
            ..
        } = coordinator;
        let lifecycle = TrialLifecycle::new(
            &config,
            Arc::clone(&ports.robot),
            Arc::clone(&ports.transitions),
            Arc::clone(&ports.states),
            Arc::clone(&ports.snapshots),
        );
        let replay = ExperienceReplay::new(
            Arc::clone(&ports.scorer),
            ReplayBuffer::with_records(history, config.replay.frame_cache_capacity),
            &config.replay,
            config.run.seed.wrapping_add(2),
        );
        Self {
            watchdog: Watchdog::new(&config),
            ladder: SimTimeoutLadder::new(&config.watchdog, Instant::now()),
            quality: QualityMonitor::new(&config.watchdog),
            rewards: RewardModel::new(&config.policy),
            no_change: initial_no_change(config.run.mode),
            lifecycle,
            replay,
            config,
            ports,
            state,
            pause,
            goal_mask,
            first_iteration: start_iteration,
            iteration: start_iteration,
            previous: None,
            last_recorded: None,
            stop_reason: None,
            homing: None,
            homing_problems: 0,
            goal_target: None,
            action_loop,
        }
    }

    fn simulation(&self) -> bool {
        self.ports.robot.is_simulation()
    }

    fn training(&self) -> bool {
        !self.config.run.mode.is_testing()
    }

    fn hard_stop(&self) -> RunError {
        RunError::HardStop {
            iterations: self.iteration - self.first_iteration,
        }
    }

    fn request_stop(&mut self, reason: StopReason) {
        if self.stop_reason.is_none() {
            self.stop_reason = Some(reason);
        }
        self.pause.request_stop();
    }

    async fn run(&mut self) -> Result<RunSummary, RunError> {
        info!(
            task = %self.config.run.task,
            mode = ?self.config.run.mode,
            robot = self.ports.robot.name(),
            goal_size = self.config.run.goal_size,
            first_iteration = self.iteration,
            "Run started"
        );
        if let Err(e) = self.lifecycle.prepare_first_trial().await {
            warn!(error = %e, "Could not load first preset case");
        }
        if !self.training() {
            if let Err(e) = self.ports.snapshots.save_snapshot(PRETRIAL_SNAPSHOT).await {
                error!(error = %e, "Pre-trial snapshot save failed");
            }
        }

        loop {
            if self.pause.hard_stop_requested() {
                return Err(self.hard_stop());
            }
            self.ladder.start_iteration(Instant::now());

            if self.state.read().await.trial_complete {
                self.finish_trial().await;
            }
            if self.state.read().await.finalize_log_pending
                && self.lifecycle.finalize_pending(&self.state, self.iteration).await
            {
                self.request_stop(StopReason::TotalActionBudget);
            }
            if self.pause.stop_requested() {
                break;
            }

            let Some((frame, scores)) = self.perceive().await else {
                sleep(Duration::from_millis(self.config.replay.idle_sleep_ms)).await;
                continue;
            };
            if let Some(previous) = self.previous.take() {
                self.record_transition(previous, &frame, &scores).await;
            }
            if self.run_checks(&frame).await {
                continue;
            }

            self.enqueue(Arc::clone(&frame), scores).await;
            self.wait_for_action().await?;
            self.collect_action(frame).await;
            self.iteration += 1;
        }

        if let Some(previous) = self.previous.take() {
            let condition = GoalCondition::new(previous.goal_target, self.goal_mask.as_ref());
            let observed = match self.ports.robot.capture().await {
                Ok(frame) => match self.ports.scorer.score(&frame, condition).await {
                    Ok(scores) => Some((frame, scores)),
                    Err(e) => {
                        warn!(error = %e, "Final scoring failed; last action not logged");
                        None
                    }
                },
                Err(e) => {
                    warn!(error = %e, "Final capture failed; last action not logged");
                    None
                }
            };
            if let Some((frame, scores)) = observed {
                self.record_transition(previous, &frame, &scores).await;
            }
        }
        if let Err(e) = self.ports.transitions.flush().await {
            error!(error = %e, "Transition log flush failed");
        }

        let state = self.state.read().await;
        let summary = RunSummary {
            first_iteration: self.first_iteration,
            last_iteration: self.iteration,
            trials: state.goal.trial(),
            stats: state.stats,
            stop_reason: self.stop_reason.unwrap_or(StopReason::Operator),
        };
        info!(
            iterations = summary.last_iteration - summary.first_iteration,
            trials = summary.trials,
            stop_reason = ?summary.stop_reason,
            "Run finished"
        );
        Ok(summary)
    }

    async fn perceive(&mut self) -> Option<(Arc<Frame>, ScoreMaps)> {
        let frame = match self.ports.robot.capture().await {
            Ok(frame) => Arc::new(frame),
            Err(e) => {
                warn!(error = %e, "Capture failed");
                if self.simulation() && !self.ports.robot.check_alive().await.unwrap_or(false) {
                    self.reset_scene(true).await;
                }
                return None;
            }
        };
        self.goal_target = if self.config.run.goal_conditioned {
            self.state.read().await.goal.current_target()
        } else {
            None
        };
        let condition = GoalCondition::new(self.goal_target, self.goal_mask.as_ref());
        match self.ports.scorer.score(&frame, condition).await {
            Ok(scores) => Some((frame, scores)),
            Err(e) => {
                warn!(error = %e, "Scoring failed");
                None
            }
        }
    }

    async fn finish_trial(&mut self) {
        let summary = self.lifecycle.end_trial(&self.state, &mut self.quality).await;
        self.no_change = NoChangeCounters::default();
        if self.training() && self.quality.update_best() {
            info!(trial_rate = ?self.quality.trial_rate(), "New best trial success rate");
            if let Err(e) = self.ports.snapshots.save_snapshot(BEST_SNAPSHOT).await {
                error!(error = %e, "Best snapshot save failed");
            }
        }
        if summary.stop {
            self.request_stop(StopReason::TestTrialBudget);
        }
    }

    /// Label the previous action against the new observation and log it.
    ///
    /// A failed append loses the log row only; the model still trains on it.
    async fn record_transition(&mut self, previous: PendingTransition, frame: &Frame, scores: &ScoreMaps) {
        let primitive = previous.report.primitive;
        let change = detect_change(
            &previous.frame.depth,
            &frame.depth,
            primitive == Primitive::Grasp && previous.outcome.grasp,
            self.config.watchdog.change_pixel_threshold,
        );
        update_no_change(&mut self.no_change, primitive, change.detected);
        if previous.report.used_heuristic {
            self.no_change.reset(primitive.family());
        }

        let label = self.rewards.label(
            primitive,
            &previous.outcome,
            change.detected,
            previous.previous_height,
            scores.overall_best(self.config.run.task.places()),
            previous.trial_ended,
        );
        let record = TransitionRecord {
            iteration: previous.report.iteration,
            trial: previous.trial,
            primitive,
            index: previous.report.index,
            success: previous.outcome,
            change_detected: change.detected,
            predicted_value: previous.report.predicted_value,
            reward_value: label.reward,
            label_value: label.value,
            progress_height: previous.progress_height,
            goal_target: previous.goal_target,
            recorded_at: Utc::now(),
        };
        if let Err(e) = self.ports.transitions.append(&record).await {
            error!(iteration = record.iteration, error = %e, "Transition log append failed");
        }

        match primitive {
            Primitive::Grasp => self.quality.record_grasp(previous.outcome.grasp),
            Primitive::Place => self.quality.record_place(previous.outcome.partial_stack),
            Primitive::Push => {}
        }
        if self.training() {
            let sample = TrainingSample {
                frame: Arc::clone(&previous.frame),
                primitive,
                index: previous.report.index,
                label: label.value,
            };
            if let Err(e) = self.ports.scorer.update(&sample).await {
                warn!(error = %e, "Model update failed");
            }
        }
        info!(
            iteration = record.iteration,
            trial = record.trial,
            primitive = %primitive,
            changed_pixels = change.changed_pixels,
            change_detected = change.detected,
            reward = label.reward,
            label = label.value,
            no_change_push = self.no_change.push,
            no_change_grasp = self.no_change.grasp,
            "Recorded transition"
        );
        self.last_recorded = Some((primitive, record.outcome()));
        self.replay.push(record, previous.frame);
    }

    /// Run every watchdog check. Returns true when the trial was ended.
    async fn run_checks(&mut self, frame: &Frame) -> bool {
        let (complete, actions_in_trial, grasp_ok) = {
            let state = self.state.read().await;
            (state.trial_complete, state.actions_in_trial, state.outcome.grasp)
        };
        if complete {
            return true;
        }

        if self
            .config
            .run
            .max_total_actions
            .is_some_and(|max| self.iteration >= max)
        {
            self.state.write().await.fail_trial(FailureKind::TrialActionLimit);
            self.request_stop(StopReason::TotalActionBudget);
            return true;
        }

        match self.watchdog.check_workspace(&frame.depth) {
            WorkspaceVerdict::Occupied => {}
            WorkspaceVerdict::Cleared => {
                info!(iteration = self.iteration, "Table cleared");
                if self.state.write().await.complete_trial() {
                    self.reset_scene(self.simulation()).await;
                }
                return true;
            }
            WorkspaceVerdict::Empty => {
                if self.state.write().await.fail_trial(FailureKind::EmptyWorkspace) {
                    self.reset_scene(self.simulation()).await;
                }
                return true;
            }
        }

        let kind = if self.watchdog.is_stagnant(self.no_change, grasp_ok) {
            Some(FailureKind::Stagnation)
        } else if self.watchdog.trial_action_limit_reached(actions_in_trial) {
            Some(FailureKind::TrialActionLimit)
        } else {
            None
        };
        if let Some(kind) = kind {
            warn!(
                iteration = self.iteration,
                failure = %kind,
                actions_in_trial,
                no_change_push = self.no_change.push,
                no_change_grasp = self.no_change.grasp,
                "Ending stuck trial"
            );
            if self.state.write().await.fail_trial(kind) {
                self.reset_scene(true).await;
            }
            return true;
        }

        if self.training() {
            let verdict = self.quality.check(self.iteration);
            if verdict.reload_snapshot {
                match self.ports.snapshots.load_snapshot(BEST_SNAPSHOT).await {
                    Ok(true) => info!("Rolled back to best snapshot"),
                    Ok(false) => warn!("No best snapshot to roll back to"),
                    Err(e) => error!(error = %e, "Best snapshot reload failed"),
                }
            }
            if verdict.reset_scene {
                if self.state.write().await.fail_trial(FailureKind::QualityDecline) {
                    self.reset_scene(true).await;
                }
                return true;
            }
        }
        false
    }

    /// Reposition objects, or restart the simulator when `full` is set.
    async fn reset_scene(&self, full: bool) {
        let robot = &self.ports.robot;
        if full && robot.is_simulation() {
            let restarted = async {
                robot.restart().await?;
                robot.populate_objects().await
            };
            if let Err(e) = restarted.await {
                error!(error = %e, "Simulator restart failed");
            }
            return;
        }
        match robot.reposition_objects().await {
            Ok(true) => {}
            Ok(false) => warn!("Scene reposition reported failure"),
            Err(e) => error!(error = %e, "Scene reposition failed"),
        }
    }

    async fn enqueue(&self, frame: Arc<Frame>, scores: ScoreMaps) {
        let explore_prob = explore_probability(
            self.config.run.mode,
            self.config.policy.explore_rate_decay,
            self.iteration,
            self.config.run.max_total_actions,
        );
        let request = ActionRequest {
            iteration: self.iteration,
            frame,
            scores: Arc::new(scores),
            explore_prob,
            no_change: self.no_change,
        };
        let mut state = self.state.write().await;
        state.pending = Some(request);
        state.executing_action = true;
        debug!(iteration = self.iteration, explore_prob, "Action enqueued");
    }

    /// Train from replay (or sleep) until the action finishes, the run is
    /// unpaused and a real robot is back home.
    async fn wait_for_action(&mut self) -> Result<(), RunError> {
        self.homing_problems = 0;
        loop {
            if self.pause.hard_stop_requested() {
                return Err(self.hard_stop());
            }
            let executing = self.state.read().await.executing_action;
            if executing && self.action_loop.is_finished() {
                return Err(RunError::ActionTask(
                    "action loop exited with an action pending".to_string(),
                ));
            }
            let paused = self.pause.is_paused();
            let away = !executing && !self.simulation() && !self.robot_home().await;
            if !executing && !paused && !away {
                return Ok(());
            }

            if self.simulation() && self.ladder.expired(Instant::now()) {
                let robot = Arc::clone(&self.ports.robot);
                match self.ladder.escalate(robot.as_ref(), &self.state, Instant::now()).await {
                    Ok(escalation) => info!(
                        problems = escalation.problems,
                        restarted = escalation.restarted,
                        "Simulator timeout handled"
                    ),
                    Err(e) => error!(error = %e, "Simulator recovery failed"),
                }
            }

            if self.training() && self.config.replay.enabled && !self.replay.buffer().is_empty() {
                let (primitive, desired) = self
                    .last_recorded
                    .map_or((Primitive::Grasp, true), |(p, outcome)| (p, !outcome));
                match self.replay.sample_and_train(primitive, desired).await {
                    Ok(Some(_)) => {
                        tokio::task::yield_now().await;
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "Replay step failed"),
                }
            }
            sleep(Duration::from_millis(self.config.replay.idle_sleep_ms)).await;
        }
    }

    /// Whether a physical arm is home, sending it there in the background if not.
    async fn robot_home(&mut self) -> bool {
        match self.ports.robot.is_home().await {
            Ok(true) => {
                self.homing = None;
                return true;
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Home check failed"),
        }
        if self.homing.as_ref().is_none_or(JoinHandle::is_finished) {
            let robot = Arc::clone(&self.ports.robot);
            self.homing = Some(tokio::spawn(async move { robot.go_home().await }));
            self.homing_problems += 1;
            if self.homing_problems > self.config.watchdog.homing_warn_threshold {
                warn!(
                    attempts = self.homing_problems,
                    "Robot is not returning home; check the robot, its safety stop and the workspace"
                );
            }
        }
        false
    }

    /// Capture what the action task did for labeling next iteration.
    async fn collect_action(&mut self, frame: Arc<Frame>) {
        let mut state = self.state.write().await;
        let report = state.last_action.filter(|r| r.iteration == self.iteration);
        if let Some(report) = report {
            self.previous = Some(PendingTransition {
                trial: state.goal.trial(),
                report,
                outcome: state.outcome,
                frame,
                previous_height: state.previous_progress_height,
                progress_height: state.progress_height,
                goal_target: self.goal_target,
                trial_ended: state.trial_complete,
            });
        }
        state.previous_progress_height = state.progress_height;
    }
}
