//! Shared control state between the action task and the main task.
//!
//! Field ownership:
//! - The action task writes `chosen_primitive`, `outcome`, `progress_height`,
//!   `intended_target`, `last_action`, `stats`, goal progress, and flips
//!   `executing_action` from true to false.
//! - The main task sets `executing_action` to true together with `pending`,
//!   clears `trial_complete`, owns `finalize_log_pending`,
//!   `previous_progress_height` and the goal's trial counter.
//! - Either task may end a trial through [`SharedControlState::fail_trial`],
//!   which is idempotent while the trial is already complete.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::goal::GoalSequence;
use super::observation::{Frame, ScoreMaps};
use super::primitive::{ActionIndex, Pose, Primitive, PrimitiveFamily, SuccessFlags};
use super::task::TaskVariant;

/// Why a trial ended without success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Structure fell short of the goal prefix.
    ProgressReversal,
    /// Structure height dropped in a way no legal action explains.
    Toppled,
    /// Fewer objects in the scene than the task needs.
    InsufficientObjects,
    /// Blocks ended up in an order the trial cannot recover from.
    OrderMismatch,
    /// Repeated actions produced no visible change.
    Stagnation,
    /// Nothing left on the table for a construction task.
    EmptyWorkspace,
    /// The trial used up its action budget.
    TrialActionLimit,
    /// The simulator stopped making progress.
    SimulatorTimeout,
    /// Policy quality dropped far below its best.
    QualityDecline,
    /// Scene reported NaN or otherwise unusable object poses.
    InvalidScene,
    /// A robot call failed mid-action.
    ActionError,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ProgressReversal => "progress_reversal",
            Self::Toppled => "toppled",
            Self::InsufficientObjects => "insufficient_objects",
            Self::OrderMismatch => "order_mismatch",
            Self::Stagnation => "stagnation",
            Self::EmptyWorkspace => "empty_workspace",
            Self::TrialActionLimit => "trial_action_limit",
            Self::SimulatorTimeout => "simulator_timeout",
            Self::QualityDecline => "quality_decline",
            Self::InvalidScene => "invalid_scene",
            Self::ActionError => "action_error",
        };
        f.write_str(name)
    }
}

/// Consecutive no-change counts, one per primitive family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoChangeCounters {
    pub push: u32,
    pub grasp: u32,
}

impl NoChangeCounters {
    pub const fn new(push: u32, grasp: u32) -> Self {
        Self { push, grasp }
    }

    pub const fn get(&self, family: PrimitiveFamily) -> u32 {
        match family {
            PrimitiveFamily::Push => self.push,
            PrimitiveFamily::Grasp => self.grasp,
        }
    }

    pub fn reset(&mut self, family: PrimitiveFamily) {
        match family {
            PrimitiveFamily::Push => self.push = 0,
            PrimitiveFamily::Grasp => self.grasp = 0,
        }
    }

    pub fn increment(&mut self, family: PrimitiveFamily) {
        match family {
            PrimitiveFamily::Push => self.push += 1,
            PrimitiveFamily::Grasp => self.grasp += 1,
        }
    }

    pub const fn total(&self) -> u32 {
        self.push + self.grasp
    }
}

/// Everything the action task needs to run one cycle, handed over by main.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub iteration: u64,
    pub frame: Arc<Frame>,
    pub scores: Arc<ScoreMaps>,
    pub explore_prob: f64,
    pub no_change: NoChangeCounters,
}

/// What the action task did in its most recent cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActionReport {
    pub iteration: u64,
    pub primitive: Primitive,
    pub index: ActionIndex,
    pub predicted_value: f64,
    pub explored: bool,
    pub used_heuristic: bool,
}

/// Running counts of actions and outcomes over a whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionStats {
    pub actions: u64,
    pub pushes: u64,
    pub grasps: u64,
    pub successful_grasps: u64,
    pub places: u64,
    pub partial_stacks: u64,
    pub full_stacks: u64,
    pub successful_trials: u64,
    pub failed_trials: u64,
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

impl ActionStats {
    pub fn grasp_success_rate(&self) -> f64 {
        ratio(self.successful_grasps, self.grasps)
    }

    pub fn place_success_rate(&self) -> f64 {
        ratio(self.partial_stacks, self.places)
    }

    pub fn trial_success_rate(&self) -> f64 {
        ratio(self.successful_trials, self.successful_trials + self.failed_trials)
    }

    /// Actions spent per partially built structure; 0 before the first one.
    pub fn actions_per_partial(&self) -> f64 {
        ratio(self.actions, self.partial_stacks)
    }

    pub fn actions_per_full(&self) -> f64 {
        ratio(self.actions, self.full_stacks)
    }
}

/// The single mutable source of truth shared by both tasks.
#[derive(Debug, Clone)]
pub struct SharedControlState {
    pub variant: TaskVariant,
    pub executing_action: bool,
    pub pending: Option<ActionRequest>,
    pub chosen_primitive: Option<Primitive>,
    pub outcome: SuccessFlags,
    pub progress_height: usize,
    pub previous_progress_height: usize,
    pub trial_complete: bool,
    pub trial_success: bool,
    pub failure: Option<FailureKind>,
    pub finalize_log_pending: bool,
    pub intended_target: Option<Pose>,
    pub last_action: Option<ActionReport>,
    pub actions_in_trial: u64,
    pub goal: GoalSequence,
    pub stats: ActionStats,
}

impl SharedControlState {
    /// Fresh state at the start of trial zero.
    pub fn new(variant: TaskVariant, mut goal: GoalSequence) -> Self {
        if variant.measures_structure() {
            goal.restart();
        }
        let baseline = variant.baseline_height();
        Self {
            variant,
            executing_action: false,
            pending: None,
            chosen_primitive: None,
            outcome: SuccessFlags::default(),
            progress_height: baseline,
            previous_progress_height: baseline,
            trial_complete: false,
            trial_success: false,
            failure: None,
            finalize_log_pending: false,
            intended_target: None,
            last_action: None,
            actions_in_trial: 0,
            goal,
            stats: ActionStats::default(),
        }
    }

    fn restart_goal(&mut self) {
        if self.variant.measures_structure() {
            self.goal.restart();
        } else {
            self.goal.reset_sequence();
        }
    }

    /// End the current trial as failed and rewind the goal.
    ///
    /// Returns `false` without touching anything when the trial is already
    /// complete, so every failure source can call it unconditionally. The
    /// caller repositions the scene when this returns `true`.
    pub fn fail_trial(&mut self, kind: FailureKind) -> bool {
        if self.trial_complete {
            return false;
        }
        self.outcome.clear();
        self.trial_complete = true;
        self.trial_success = false;
        self.failure = Some(kind);
        self.intended_target = None;
        self.restart_goal();
        true
    }

    /// End the current trial as a full success and rewind the goal.
    pub fn complete_trial(&mut self) -> bool {
        if self.trial_complete {
            return false;
        }
        self.outcome = SuccessFlags::all_true();
        self.trial_complete = true;
        self.trial_success = true;
        self.failure = None;
        self.intended_target = None;
        self.stats.successful_trials += 1;
        self.restart_goal();
        true
    }

    /// Put progress heights back to the task baseline.
    pub fn reset_heights(&mut self) {
        let baseline = self.variant.baseline_height();
        self.progress_height = baseline;
        self.previous_progress_height = baseline;
    }

    /// Serializable view for crash-resume.
    pub fn snapshot(&self, iteration: u64) -> ControlSnapshot {
        ControlSnapshot {
            iteration,
            variant: self.variant,
            outcome: self.outcome,
            progress_height: self.progress_height,
            previous_progress_height: self.previous_progress_height,
            trial_complete: self.trial_complete,
            trial_success: self.trial_success,
            failure: self.failure,
            finalize_log_pending: self.finalize_log_pending,
            intended_target: self.intended_target,
            actions_in_trial: self.actions_in_trial,
            goal: self.goal.clone(),
            stats: self.stats,
            saved_at: Utc::now(),
        }
    }

    /// Restore persisted fields. The trial counter is left alone; resume
    /// reconstructs it from the transition log.
    pub fn restore(&mut self, snapshot: &ControlSnapshot) {
        let trial = self.goal.trial();
        self.outcome = snapshot.outcome;
        self.progress_height = snapshot.progress_height;
        self.previous_progress_height = snapshot.previous_progress_height;
        self.trial_complete = snapshot.trial_complete;
        self.trial_success = snapshot.trial_success;
        self.failure = snapshot.failure;
        self.finalize_log_pending = snapshot.finalize_log_pending;
        self.intended_target = snapshot.intended_target;
        self.actions_in_trial = snapshot.actions_in_trial;
        self.goal = snapshot.goal.clone();
        self.goal.set_trial(trial);
        self.stats = snapshot.stats;
        self.executing_action = false;
        self.chosen_primitive = None;
        self.pending = None;
    }
}

/// Persisted subset of [`SharedControlState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlSnapshot {
    pub iteration: u64,
    pub variant: TaskVariant,
    pub outcome: SuccessFlags,
    pub progress_height: usize,
    pub previous_progress_height: usize,
    pub trial_complete: bool,
    pub trial_success: bool,
    pub failure: Option<FailureKind>,
    pub finalize_log_pending: bool,
    pub intended_target: Option<Pose>,
    pub actions_in_trial: u64,
    pub goal: GoalSequence,
    pub stats: ActionStats,
    pub saved_at: DateTime<Utc>,
}
