//! Goal-progress evaluation
//!
//! Pure comparison of a structure measurement against the current goal
//! prefix. The action executor feeds it what the robot reported and acts on
//! the verdict; nothing here touches shared state or hardware.

use crate::domain::models::{
    BlockColor, FailureKind, MatchRule, Primitive, ProgressConfig, RunMode, StructureMeasurement,
    TaskVariant,
};

/// How progress is judged for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressPolicy {
    pub variant: TaskVariant,
    pub match_rule: MatchRule,
    /// Reset the scene on a plain reversal. Topple, missing objects and
    /// order mismatches reset regardless.
    pub reset_on_reversal: bool,
    pub end_on_incorrect_order: bool,
}

impl ProgressPolicy {
    /// Testing mode never removes situations the policy got itself into.
    pub const fn new(variant: TaskVariant, mode: RunMode, config: &ProgressConfig) -> Self {
        Self {
            variant,
            match_rule: config.match_rule,
            reset_on_reversal: config.reset_on_reversal && !mode.is_testing(),
            end_on_incorrect_order: config.end_on_incorrect_order,
        }
    }
}

/// Everything needed to judge one action's effect on the structure.
#[derive(Debug, Clone, Copy)]
pub struct ProgressInput<'a> {
    pub primitive: Primitive,
    /// Placements are checked against the full prefix including the target.
    pub place_check: bool,
    pub goal_progress: &'a [BlockColor],
    pub measurement: &'a StructureMeasurement,
    pub previous_height: usize,
    pub grasp_succeeded: bool,
    /// Objects the robot reports in the scene, when it can tell.
    pub object_count: Option<usize>,
    pub required_objects: usize,
}

/// Result of a progress evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressVerdict {
    pub height: usize,
    /// Length of the prefix the measurement was compared against.
    pub required: usize,
    pub matches_goal: bool,
    pub partial_success: bool,
    /// Something went wrong with the structure, whether or not it is reset.
    pub failure: Option<FailureKind>,
    /// The scene must be reset and the trial ended.
    pub reset_required: bool,
}

impl ProgressVerdict {
    /// Progress may be credited only when nothing went wrong.
    pub const fn progress_allowed(&self) -> bool {
        self.failure.is_none()
    }
}

fn order_matches(order: &[BlockColor], prefix: &[BlockColor]) -> bool {
    order.iter().zip(prefix).all(|(a, b)| a == b)
}

/// Judge the measured structure against the goal prefix.
pub fn evaluate(policy: &ProgressPolicy, input: &ProgressInput<'_>) -> ProgressVerdict {
    let prefix = if input.place_check {
        input.goal_progress
    } else {
        &input.goal_progress[..input.goal_progress.len().saturating_sub(1)]
    };
    let shift = usize::from(input.place_check);
    let required = prefix.len();
    let height = input.measurement.height;
    let previous = input.previous_height;

    let measured_order = input
        .measurement
        .order
        .as_deref()
        .filter(|_| policy.variant == TaskVariant::Stack);
    let order_ok = measured_order.is_none_or(|order| order_matches(order, prefix));
    let matches_goal = policy.match_rule.matches(height, required) && order_ok;
    let partial_success = matches_goal && height > 1;

    let mut failure = None;
    let mut forced = false;

    if height < previous {
        failure = Some(FailureKind::Toppled);
        forced = true;
    } else if height < required.saturating_sub(shift) {
        failure = Some(FailureKind::ProgressReversal);
    }

    if policy.variant == TaskVariant::Unstack {
        let toppled = match input.primitive {
            Primitive::Place => height > previous,
            Primitive::Grasp if !input.grasp_succeeded => height > previous,
            _ => height > previous + 1,
        };
        if toppled {
            failure = Some(FailureKind::Toppled);
            forced = true;
        }
    }

    if policy.end_on_incorrect_order && policy.variant == TaskVariant::Stack {
        if let Some(order) = measured_order {
            let intact_below_top = if order.len() == 2 {
                prefix.get(1).is_none_or(|buried| order[0] != *buried)
            } else {
                order_matches(order, prefix)
            };
            let misordered = !intact_below_top && order.len() >= required;
            let collapsed = previous > 1 && order.len() < previous;
            if misordered || collapsed {
                failure = Some(FailureKind::OrderMismatch);
                forced = true;
            }
        }
    }

    if input
        .object_count
        .is_some_and(|count| count < input.required_objects)
    {
        failure = Some(FailureKind::InsufficientObjects);
        forced = true;
    }

    let reset_required = failure.is_some() && (forced || policy.reset_on_reversal);

    ProgressVerdict {
        height,
        required,
        matches_goal,
        partial_success,
        failure,
        reset_required,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use BlockColor::{Blue, Green, Red, Yellow};

    fn policy(variant: TaskVariant) -> ProgressPolicy {
        ProgressPolicy::new(variant, RunMode::Training, &ProgressConfig::default())
    }

    fn input<'a>(
        primitive: Primitive,
        goal: &'a [BlockColor],
        measurement: &'a StructureMeasurement,
        previous_height: usize,
    ) -> ProgressInput<'a> {
        ProgressInput {
            primitive,
            place_check: primitive == Primitive::Place,
            goal_progress: goal,
            measurement,
            previous_height,
            grasp_succeeded: false,
            object_count: None,
            required_objects: 4,
        }
    }

    #[test]
    fn test_place_reaching_height_matches() {
        let goal = [Red, Blue, Green];
        let m = StructureMeasurement::height_only(3);
        let verdict = evaluate(&policy(TaskVariant::Stack), &input(Primitive::Place, &goal, &m, 2));
        assert!(verdict.matches_goal);
        assert!(verdict.partial_success);
        assert!(verdict.progress_allowed());
        assert!(!verdict.reset_required);
    }

    #[test]
    fn test_at_least_rule_accepts_overshoot() {
        let goal = [Red, Blue, Green];
        let m = StructureMeasurement::height_only(4);
        let verdict = evaluate(&policy(TaskVariant::Stack), &input(Primitive::Place, &goal, &m, 2));
        assert!(verdict.matches_goal);

        let exact = ProgressPolicy {
            match_rule: MatchRule::Exact,
            ..policy(TaskVariant::Stack)
        };
        let verdict = evaluate(&exact, &input(Primitive::Place, &goal, &m, 2));
        assert!(!verdict.matches_goal);
    }

    #[test]
    fn test_height_one_never_partial() {
        let goal = [Red];
        let m = StructureMeasurement::height_only(1);
        let verdict = evaluate(&policy(TaskVariant::Stack), &input(Primitive::Place, &goal, &m, 1));
        assert!(verdict.matches_goal);
        assert!(!verdict.partial_success);
    }

    #[test]
    fn test_push_knocking_stack_down_topples() {
        let goal = [Red, Blue, Green];
        let m = StructureMeasurement::height_only(1);
        let verdict = evaluate(&policy(TaskVariant::Stack), &input(Primitive::Push, &goal, &m, 3));
        assert_eq!(verdict.failure, Some(FailureKind::Toppled));
        assert!(verdict.reset_required);
    }

    #[test]
    fn test_reversal_suppressed_when_reset_disabled() {
        let goal = [Red, Blue, Green];
        let m = StructureMeasurement::height_only(1);
        let testing = ProgressPolicy::new(TaskVariant::Stack, RunMode::Testing, &ProgressConfig::default());
        let verdict = evaluate(&testing, &input(Primitive::Grasp, &goal, &m, 1));
        assert_eq!(verdict.failure, Some(FailureKind::ProgressReversal));
        assert!(!verdict.reset_required);
        assert!(!verdict.progress_allowed());
    }

    #[test]
    fn test_topple_resets_even_in_testing() {
        let goal = [Red, Blue, Green];
        let m = StructureMeasurement::height_only(1);
        let testing = ProgressPolicy::new(TaskVariant::Stack, RunMode::Testing, &ProgressConfig::default());
        let verdict = evaluate(&testing, &input(Primitive::Push, &goal, &m, 3));
        assert!(verdict.reset_required);
    }

    #[test]
    fn test_insufficient_objects_forces_reset() {
        let goal = [Red, Blue];
        let m = StructureMeasurement::height_only(2);
        let mut inp = input(Primitive::Place, &goal, &m, 1);
        inp.object_count = Some(3);
        let verdict = evaluate(&policy(TaskVariant::Row), &inp);
        assert_eq!(verdict.failure, Some(FailureKind::InsufficientObjects));
        assert!(verdict.reset_required);
    }

    #[test]
    fn test_buried_second_goal_block_is_order_mismatch() {
        let goal = [Red, Blue];
        let m = StructureMeasurement {
            height: 2,
            order: Some(vec![Blue, Red]),
        };
        let verdict = evaluate(&policy(TaskVariant::Stack), &input(Primitive::Place, &goal, &m, 1));
        assert_eq!(verdict.failure, Some(FailureKind::OrderMismatch));
        assert!(!verdict.matches_goal);
    }

    #[test]
    fn test_wrong_top_block_on_two_stack_can_recover() {
        let goal = [Red, Blue];
        let m = StructureMeasurement {
            height: 2,
            order: Some(vec![Red, Green]),
        };
        let verdict = evaluate(&policy(TaskVariant::Stack), &input(Primitive::Place, &goal, &m, 1));
        assert_eq!(verdict.failure, None);
        assert!(!verdict.matches_goal);
    }

    #[test]
    fn test_misordered_tall_stack_ends_trial() {
        let goal = [Red, Blue, Green, Yellow];
        let m = StructureMeasurement {
            height: 4,
            order: Some(vec![Red, Green, Blue, Yellow]),
        };
        let verdict = evaluate(&policy(TaskVariant::Stack), &input(Primitive::Place, &goal, &m, 3));
        assert_eq!(verdict.failure, Some(FailureKind::OrderMismatch));
        assert!(verdict.reset_required);
    }

    #[test]
    fn test_correct_prefix_with_extra_block_is_not_misordered() {
        let goal = [Red, Blue, Green];
        let m = StructureMeasurement {
            height: 4,
            order: Some(vec![Red, Blue, Green, Yellow]),
        };
        let verdict = evaluate(&policy(TaskVariant::Stack), &input(Primitive::Place, &goal, &m, 3));
        assert_eq!(verdict.failure, None);
        assert!(verdict.matches_goal);
    }

    #[test]
    fn test_unstack_place_increase_is_topple() {
        let goal = [Red, Blue, Green];
        let m = StructureMeasurement::height_only(3);
        let verdict = evaluate(&policy(TaskVariant::Unstack), &input(Primitive::Place, &goal, &m, 2));
        assert_eq!(verdict.failure, Some(FailureKind::Toppled));

        let mut grasp = input(Primitive::Grasp, &goal, &m, 2);
        grasp.grasp_succeeded = true;
        let verdict = evaluate(&policy(TaskVariant::Unstack), &grasp);
        assert_eq!(verdict.failure, None);
    }
}
