//! ActionExecutor - one select/execute/evaluate cycle per requested action
//!
//! The main task hands over an [`ActionRequest`] by setting
//! `executing_action`; the action task picks it up here, runs the cycle
//! against the robot port and writes the outcome back into shared state
//! before flipping `executing_action` to false.
//!
//! Phases: `Idle -> SelectingAction -> Executing -> Evaluating -> Idle`.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::application::progress::{evaluate, ProgressInput, ProgressPolicy, ProgressVerdict};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    ActionIndex, ActionReport, ActionRequest, Config, FailureKind, Primitive, RunMode, ScoreMaps,
    SharedControlState, StructureQuery, TaskVariant,
};
use crate::domain::ports::{RobotInterface, Scorer};

/// Phase of the action state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ActionPhase {
    Idle = 0,
    SelectingAction = 1,
    Executing = 2,
    Evaluating = 3,
}

impl ActionPhase {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::SelectingAction,
            2 => Self::Executing,
            3 => Self::Evaluating,
            _ => Self::Idle,
        }
    }
}

/// Knobs for primitive and location selection.
#[derive(Debug, Clone)]
pub struct ActionSettings {
    pub variant: TaskVariant,
    pub mode: RunMode,
    pub grasp_only: bool,
    pub push_frequency_one_in_n: u32,
    pub random_actions: bool,
    pub heuristic_bootstrap: bool,
    pub heuristic_threshold: u32,
    /// Objects the scene must hold for construction to remain possible.
    pub required_objects: usize,
}

impl ActionSettings {
    pub fn from_config(config: &Config) -> Self {
        let required_objects = if config.run.mode.is_testing() {
            config.run.goal_size
        } else {
            config.run.num_objects.saturating_sub(config.run.extra_objects)
        };
        Self {
            variant: config.run.task,
            mode: config.run.mode,
            grasp_only: config.policy.grasp_only,
            push_frequency_one_in_n: config.policy.push_frequency_one_in_n.max(1),
            random_actions: config.policy.random_actions,
            heuristic_bootstrap: config.policy.heuristic_bootstrap,
            heuristic_threshold: config.policy.heuristic_threshold,
            required_objects,
        }
    }
}

/// Choose the next primitive.
///
/// A successful grasp in a placing task forces a place. Otherwise grasp is
/// the default, push wins when its best score beats grasp (by 2x when
/// testing), and exploring replaces the choice with a push one time in
/// `push_frequency_one_in_n` (signalled by `push_draw`).
pub fn select_primitive(
    settings: &ActionSettings,
    previous: Option<Primitive>,
    previous_grasp_succeeded: bool,
    scores: &ScoreMaps,
    explore: bool,
    push_draw: bool,
) -> Primitive {
    if settings.variant.places() && previous == Some(Primitive::Grasp) && previous_grasp_succeeded {
        return Primitive::Place;
    }
    if settings.grasp_only {
        return Primitive::Grasp;
    }
    if explore {
        return if push_draw { Primitive::Push } else { Primitive::Grasp };
    }
    let best_push = scores.best_value(Primitive::Push);
    let best_grasp = scores.best_value(Primitive::Grasp);
    let push_bar = if settings.mode.is_testing() {
        2.0 * best_grasp
    } else {
        best_grasp
    };
    if best_push > push_bar {
        Primitive::Push
    } else {
        Primitive::Grasp
    }
}

/// Runs action cycles for the action task.
pub struct ActionExecutor {
    robot: Arc<dyn RobotInterface>,
    scorer: Arc<dyn Scorer>,
    state: Arc<RwLock<SharedControlState>>,
    settings: ActionSettings,
    policy: ProgressPolicy,
    phase: AtomicU8,
    rng: Mutex<ChaCha8Rng>,
}

struct Selection {
    primitive: Primitive,
    index: ActionIndex,
    predicted_value: f64,
    explored: bool,
    used_heuristic: bool,
}

impl ActionExecutor {
    pub fn new(
        robot: Arc<dyn RobotInterface>,
        scorer: Arc<dyn Scorer>,
        state: Arc<RwLock<SharedControlState>>,
        settings: ActionSettings,
        policy: ProgressPolicy,
        seed: u64,
    ) -> Self {
        Self {
            robot,
            scorer,
            state,
            settings,
            policy,
            phase: AtomicU8::new(ActionPhase::Idle as u8),
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
        }
    }

    pub fn phase(&self) -> ActionPhase {
        ActionPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    fn set_phase(&self, phase: ActionPhase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    /// Take the pending request if the main task has enqueued one.
    pub async fn take_request(&self) -> Option<ActionRequest> {
        let mut state = self.state.write().await;
        if !state.executing_action {
            return None;
        }
        let request = state.pending.take();
        if request.is_none() {
            warn!("executing_action set without a pending request; clearing");
            state.executing_action = false;
        }
        request
    }

    /// Run one cycle, absorbing robot errors into a failed trial.
    pub async fn execute_request(&self, request: ActionRequest) -> Option<ActionReport> {
        let iteration = request.iteration;
        match self.run_cycle(request).await {
            Ok(report) => Some(report),
            Err(e) => {
                error!(iteration, error = %e, "Action cycle failed; ending trial");
                let reposition = {
                    let mut state = self.state.write().await;
                    let failed = state.fail_trial(FailureKind::ActionError);
                    state.executing_action = false;
                    failed
                };
                if reposition {
                    self.reposition().await;
                }
                self.set_phase(ActionPhase::Idle);
                None
            }
        }
    }

    /// Select, execute and evaluate one action.
    pub async fn run_cycle(&self, request: ActionRequest) -> DomainResult<ActionReport> {
        self.set_phase(ActionPhase::SelectingAction);
        let (previous, grasp_succeeded, intended) = {
            let state = self.state.read().await;
            (
                state.chosen_primitive,
                state.outcome.grasp,
                state.intended_target,
            )
        };

        let selection = self.select(&request, previous, grasp_succeeded)?;
        {
            let mut state = self.state.write().await;
            state.chosen_primitive = Some(selection.primitive);
            state.outcome.clear();
        }
        info!(
            iteration = request.iteration,
            primitive = %selection.primitive,
            index = %selection.index,
            predicted_value = selection.predicted_value,
            explored = selection.explored,
            heuristic = selection.used_heuristic,
            "Executing action"
        );

        self.set_phase(ActionPhase::Executing);
        let pose = self
            .robot
            .pose_for(selection.primitive, selection.index, &request.frame);
        if pose.is_invalid() {
            return Err(DomainError::robot("pose_for", "resolved pose is not finite"));
        }
        let intended = if selection.primitive == Primitive::Place {
            intended
        } else {
            None
        };
        let success = self.robot.execute(selection.primitive, pose, intended).await?;

        self.set_phase(ActionPhase::Evaluating);
        self.evaluate_outcome(selection.primitive, success).await?;

        let report = ActionReport {
            iteration: request.iteration,
            primitive: selection.primitive,
            index: selection.index,
            predicted_value: selection.predicted_value,
            explored: selection.explored,
            used_heuristic: selection.used_heuristic,
        };
        {
            let mut state = self.state.write().await;
            state.last_action = Some(report);
            state.executing_action = false;
        }
        self.set_phase(ActionPhase::Idle);
        Ok(report)
    }

    fn select(
        &self,
        request: &ActionRequest,
        previous: Option<Primitive>,
        grasp_succeeded: bool,
    ) -> DomainResult<Selection> {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let explored = rng.gen::<f64>() < request.explore_prob;
        let push_draw = rng.gen_range(0..self.settings.push_frequency_one_in_n) == 0;
        let primitive = select_primitive(
            &self.settings,
            previous,
            grasp_succeeded,
            &request.scores,
            explored,
            push_draw,
        );
        let map = request.scores.get(primitive);

        let mut used_heuristic = false;
        let mut index = None;
        if self.settings.heuristic_bootstrap
            && primitive != Primitive::Place
            && request.no_change.get(primitive.family()) >= self.settings.heuristic_threshold
        {
            index = self.scorer.heuristic(primitive, &request.frame);
            used_heuristic = index.is_some();
        }
        if index.is_none()
            && self.settings.random_actions
            && explored
            && !self.settings.mode.is_testing()
            && rng.gen_bool(0.5)
        {
            let valid = map.valid_count();
            if valid > 0 {
                index = map.nth_valid(rng.gen_range(0..valid));
            }
        }
        let index = match index {
            Some(index) => index,
            None => map.argmax().map(|(i, _)| i).ok_or(DomainError::NoValidAction(primitive))?,
        };
        let predicted_value = map.get(index).filter(|v| v.is_finite()).unwrap_or(0.0);

        Ok(Selection {
            primitive,
            index,
            predicted_value,
            explored,
            used_heuristic,
        })
    }

    async fn measure(&self, primitive: Primitive, grasp_succeeded: bool) -> DomainResult<ProgressVerdict> {
        let (goal_progress, previous_height) = {
            let state = self.state.read().await;
            (
                state.goal.current_progress().to_vec(),
                state.previous_progress_height,
            )
        };
        let query = StructureQuery {
            variant: self.settings.variant,
            goal_prefix: goal_progress.clone(),
        };
        let measurement = self.robot.measure_structure(&query).await?;

        let object_count = if self.robot.is_simulation() {
            let scene = self.robot.get_object_state().await?;
            if scene.has_invalid_pose() {
                return Ok(ProgressVerdict {
                    height: measurement.height,
                    required: goal_progress.len(),
                    matches_goal: false,
                    partial_success: false,
                    failure: Some(FailureKind::InvalidScene),
                    reset_required: true,
                });
            }
            Some(scene.object_count())
        } else {
            None
        };

        let input = ProgressInput {
            primitive,
            place_check: primitive == Primitive::Place,
            goal_progress: &goal_progress,
            measurement: &measurement,
            previous_height,
            grasp_succeeded,
            object_count,
            required_objects: self.settings.required_objects,
        };
        Ok(evaluate(&self.policy, &input))
    }

    async fn evaluate_outcome(&self, primitive: Primitive, success: bool) -> DomainResult<()> {
        {
            let mut state = self.state.write().await;
            state.stats.actions += 1;
            state.actions_in_trial += 1;
            match primitive {
                Primitive::Push => {
                    state.outcome.push = success;
                    state.stats.pushes += 1;
                }
                Primitive::Grasp => {
                    state.outcome.grasp = success;
                    state.stats.grasps += 1;
                    if success {
                        state.stats.successful_grasps += 1;
                    }
                }
                Primitive::Place => {
                    state.outcome.place = success;
                    state.stats.places += 1;
                    state.intended_target = None;
                }
            }
        }
        if !self.settings.variant.measures_structure() {
            debug!(primitive = %primitive, success, "Action finished");
            return Ok(());
        }

        let verdict = self.measure(primitive, primitive == Primitive::Grasp && success).await?;
        let reposition = self.apply_verdict(primitive, success, &verdict).await;
        if reposition {
            self.reposition().await;
        }
        Ok(())
    }

    /// Fold a progress verdict into shared state. Returns whether the scene
    /// must be repositioned.
    async fn apply_verdict(&self, primitive: Primitive, success: bool, verdict: &ProgressVerdict) -> bool {
        let mut state = self.state.write().await;
        state.progress_height = verdict.height;

        if verdict.reset_required {
            let kind = verdict.failure.unwrap_or(FailureKind::ProgressReversal);
            warn!(
                primitive = %primitive,
                height = verdict.height,
                required = verdict.required,
                failure = %kind,
                "Progress reversal; resetting scene"
            );
            return state.fail_trial(kind);
        }
        if let Some(kind) = verdict.failure {
            info!(
                height = verdict.height,
                failure = %kind,
                "Progress reversal tolerated; scene left as is"
            );
            return false;
        }

        let credited = match primitive {
            Primitive::Place => success && verdict.partial_success,
            Primitive::Push | Primitive::Grasp => {
                self.settings.variant != TaskVariant::Stack
                    && verdict.partial_success
                    && verdict.height > state.previous_progress_height
            }
        };
        if credited {
            state.outcome.partial_stack = true;
            state.stats.partial_stacks += 1;
            state.goal.advance_to(verdict.height);
            info!(
                height = verdict.height,
                progress_index = state.goal.progress_index(),
                "Partial structure success"
            );
        }

        if verdict.partial_success && verdict.height >= state.goal.goal_size() {
            state.stats.full_stacks += 1;
            info!(
                height = verdict.height,
                trial = state.goal.trial(),
                "Structure complete; trial succeeded"
            );
            return state.complete_trial();
        }
        false
    }

    async fn reposition(&self) {
        match self.robot.reposition_objects().await {
            Ok(true) => {}
            Ok(false) => warn!("Scene reposition reported failure"),
            Err(e) => error!(error = %e, "Scene reposition failed"),
        }
    }
}
