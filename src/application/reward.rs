//! Change detection, reward labels and the exploration schedule.

use crate::domain::models::{
    DepthMap, NoChangeCounters, PolicyConfig, Primitive, RunMode, SuccessFlags,
};
use crate::domain::models::observation::{CHANGE_DEPTH_MAX, CHANGE_DEPTH_MIN};

/// Runs longer than this many actions use the slower exploration decay.
const LONG_RUN_ACTIONS: u64 = 20_000;
const INITIAL_EXPLORE_PROB: f64 = 0.5;
const MIN_EXPLORE_PROB: f64 = 0.01;

/// Outcome of comparing the depth maps before and after an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeDetection {
    pub changed_pixels: usize,
    pub detected: bool,
}

/// Decide whether the last action visibly changed the scene.
///
/// A successful grasp always counts as a change: the block left the table.
pub fn detect_change(
    before: &DepthMap,
    after: &DepthMap,
    grasp_succeeded: bool,
    pixel_threshold: usize,
) -> ChangeDetection {
    let changed_pixels = before.count_changed(after, CHANGE_DEPTH_MIN, CHANGE_DEPTH_MAX);
    ChangeDetection {
        changed_pixels,
        detected: changed_pixels > pixel_threshold || grasp_succeeded,
    }
}

/// Fold one action's change result into the per-family no-change counters.
///
/// Places reset their family on change but never count as a no-op.
pub fn update_no_change(counters: &mut NoChangeCounters, primitive: Primitive, detected: bool) {
    if detected {
        counters.reset(primitive.family());
    } else if primitive != Primitive::Place {
        counters.increment(primitive.family());
    }
}

/// Initial no-change counters: training starts primed so heuristics kick in early.
pub const fn initial_no_change(mode: RunMode) -> NoChangeCounters {
    match mode {
        RunMode::Training => NoChangeCounters::new(2, 2),
        RunMode::Testing => NoChangeCounters::new(0, 0),
    }
}

/// Reward and regression label for one transition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Label {
    pub reward: f64,
    pub value: f64,
}

/// Turns action outcomes into rewards and discounted labels.
#[derive(Debug, Clone, Copy)]
pub struct RewardModel {
    discount: f64,
    push_rewards: bool,
    height_reward: bool,
}

impl RewardModel {
    pub const fn new(config: &PolicyConfig) -> Self {
        Self {
            discount: config.future_reward_discount,
            push_rewards: config.push_rewards,
            height_reward: !config.no_height_reward,
        }
    }

    /// Immediate reward, scaled by the structure height the action started from.
    pub fn reward(
        &self,
        primitive: Primitive,
        outcome: &SuccessFlags,
        change_detected: bool,
        previous_height: usize,
    ) -> f64 {
        let base = match primitive {
            Primitive::Push if change_detected && self.push_rewards => 0.5,
            Primitive::Grasp if outcome.grasp => 1.0,
            Primitive::Place if outcome.partial_stack => 1.0,
            _ => 0.0,
        };
        let multiplier = if self.height_reward {
            previous_height.max(1) as f64
        } else {
            1.0
        };
        base * multiplier
    }

    /// Reward plus discounted best value of the next observation.
    ///
    /// A trial that just ended has no future to discount.
    pub fn label(
        &self,
        primitive: Primitive,
        outcome: &SuccessFlags,
        change_detected: bool,
        previous_height: usize,
        next_best_value: f64,
        trial_ended: bool,
    ) -> Label {
        let reward = self.reward(primitive, outcome, change_detected, previous_height);
        let future = if trial_ended || !next_best_value.is_finite() {
            0.0
        } else {
            next_best_value
        };
        Label {
            reward,
            value: reward + self.discount * future,
        }
    }
}

/// Probability of exploring at `iteration`.
pub fn explore_probability(
    mode: RunMode,
    decay: bool,
    iteration: u64,
    max_total_actions: Option<u64>,
) -> f64 {
    if mode.is_testing() {
        return 0.0;
    }
    if !decay {
        return INITIAL_EXPLORE_PROB;
    }
    let rate: f64 = if max_total_actions.is_some_and(|m| m > LONG_RUN_ACTIONS) {
        0.9999
    } else {
        0.9996
    };
    let exponent = i32::try_from(iteration).unwrap_or(i32::MAX);
    (INITIAL_EXPLORE_PROB * rate.powi(exponent)).max(MIN_EXPLORE_PROB)
}
