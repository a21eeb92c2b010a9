//! Trial lifecycle - ending trials and the bookkeeping pass that follows.
//!
//! Only the main task advances the trial counter, and only through
//! [`TrialLifecycle::end_trial`].

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::application::watchdog::QualityMonitor;
use crate::domain::errors::DomainResult;
use crate::domain::models::{Config, FailureKind, RunMode, SharedControlState, TransitionRecord};
use crate::domain::ports::{ModelSnapshots, RobotInterface, StateStore, TransitionLog};

/// Snapshot tag of the model a testing run starts every trial from.
pub const PRETRIAL_SNAPSHOT: &str = "pretrial";
/// Snapshot tag of the most recent training weights.
pub const LATEST_SNAPSHOT: &str = "latest";
/// Snapshot tag of the weights with the best trial success rate.
pub const BEST_SNAPSHOT: &str = "best";

/// Summary of a trial that just ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrialSummary {
    pub trial: u64,
    pub success: bool,
    pub failure: Option<FailureKind>,
    pub next_trial: u64,
    /// The run has reached its trial budget.
    pub stop: bool,
}

/// Where a resumed run picks up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumePoint {
    pub next_iteration: u64,
    pub trial: u64,
}

impl ResumePoint {
    /// Continue after the last logged iteration with a fresh trial.
    pub fn from_records(records: &[TransitionRecord]) -> Self {
        records
            .iter()
            .fold(None, |acc: Option<(u64, u64)>, r| {
                Some(acc.map_or((r.iteration, r.trial), |(i, t)| {
                    (i.max(r.iteration), t.max(r.trial))
                }))
            })
            .map_or(
                Self {
                    next_iteration: 0,
                    trial: 0,
                },
                |(iteration, trial)| Self {
                    next_iteration: iteration + 1,
                    trial: trial + 1,
                },
            )
    }
}

/// Ends trials and runs the follow-up bookkeeping.
pub struct TrialLifecycle {
    robot: Arc<dyn RobotInterface>,
    transitions: Arc<dyn TransitionLog>,
    states: Arc<dyn StateStore>,
    snapshots: Arc<dyn ModelSnapshots>,
    mode: RunMode,
    goal_conditioned: bool,
    preset_cases: Vec<PathBuf>,
    trials_per_case: u64,
    max_test_trials: u64,
    max_total_actions: Option<u64>,
    rng: ChaCha8Rng,
}

impl TrialLifecycle {
    pub fn new(
        config: &Config,
        robot: Arc<dyn RobotInterface>,
        transitions: Arc<dyn TransitionLog>,
        states: Arc<dyn StateStore>,
        snapshots: Arc<dyn ModelSnapshots>,
    ) -> Self {
        Self {
            robot,
            transitions,
            states,
            snapshots,
            mode: config.run.mode,
            goal_conditioned: config.run.goal_conditioned,
            preset_cases: config.run.preset_cases.clone(),
            trials_per_case: config.run.trials_per_case.max(1),
            max_test_trials: config.run.max_test_trials,
            max_total_actions: config.run.max_total_actions,
            rng: ChaCha8Rng::seed_from_u64(config.run.seed.wrapping_add(1)),
        }
    }

    /// Preset case to load after `trials_done` trials.
    pub fn preset_case_index(&self, trials_done: u64) -> Option<usize> {
        if self.preset_cases.is_empty() {
            return None;
        }
        let index = usize::try_from(trials_done / self.trials_per_case).unwrap_or(usize::MAX);
        Some(index.min(self.preset_cases.len() - 1))
    }

    /// Load the first preset case before the first testing trial.
    pub async fn prepare_first_trial(&self) -> DomainResult<()> {
        if self.mode.is_testing() {
            if let Some(index) = self.preset_case_index(0) {
                self.robot.load_preset_case(&self.preset_cases[index]).await?;
            }
        }
        Ok(())
    }

    /// Close the current trial and open the next one.
    ///
    /// Port failures are logged; the next trial opens regardless.
    pub async fn end_trial(
        &mut self,
        state: &RwLock<SharedControlState>,
        quality: &mut QualityMonitor,
    ) -> TrialSummary {
        if let Err(e) = self.transitions.flush().await {
            error!(error = %e, "Transition log flush failed");
        }

        let summary = {
            let mut state = state.write().await;
            let trial = state.goal.trial();
            let success = state.trial_success;
            let failure = state.failure;
            if !success {
                state.stats.failed_trials += 1;
            }
            let next_trial = trial + 1;
            state.goal.set_trial(next_trial);
            if self.goal_conditioned && state.variant.places() {
                state.goal.reshuffle(&mut self.rng);
                state.goal.next();
            }
            state.trial_complete = false;
            state.trial_success = false;
            state.failure = None;
            state.finalize_log_pending = true;
            state.actions_in_trial = 0;
            state.chosen_primitive = None;
            state.outcome.clear();
            state.intended_target = None;

            TrialSummary {
                trial,
                success,
                failure,
                next_trial,
                stop: self.mode.is_testing() && next_trial >= self.max_test_trials,
            }
        };
        quality.record_trial(summary.success);

        info!(
            trial = summary.trial,
            success = summary.success,
            failure = ?summary.failure,
            next_trial = summary.next_trial,
            "Trial ended"
        );

        if self.mode.is_testing() && !summary.stop {
            match self.snapshots.load_snapshot(PRETRIAL_SNAPSHOT).await {
                Ok(true) => {}
                Ok(false) => warn!("No pre-trial snapshot to reload for testing"),
                Err(e) => error!(error = %e, "Pre-trial snapshot reload failed"),
            }
            if let Some(index) = self.preset_case_index(summary.next_trial) {
                let path = &self.preset_cases[index];
                info!(case = index, path = %path.display(), "Loading preset case");
                if let Err(e) = self.robot.load_preset_case(path).await {
                    error!(case = index, error = %e, "Preset case failed to load; keeping current scene");
                }
            }
        }
        summary
    }

    /// Persist state after a trial's log is finalized and rearm the heights.
    ///
    /// Returns true when the total action budget is spent. Save failures
    /// are logged and do not stop the run.
    pub async fn finalize_pending(&self, state: &RwLock<SharedControlState>, iteration: u64) -> bool {
        let snapshot = {
            let mut state = state.write().await;
            state.reset_heights();
            state.finalize_log_pending = false;
            state.snapshot(iteration)
        };
        if let Err(e) = self.states.save_state(&snapshot).await {
            error!(iteration, error = %e, "Control state save failed");
        }
        if !self.mode.is_testing() {
            if let Err(e) = self.snapshots.save_snapshot(LATEST_SNAPSHOT).await {
                error!(iteration, error = %e, "Model snapshot save failed");
            }
        }
        let exhausted = self.max_total_actions.is_some_and(|max| iteration >= max);
        if exhausted {
            info!(iteration, "Total action budget reached");
        }
        exhausted
    }
}
