//! Failure & recovery watchdog
//!
//! Detectors for the ways a long run goes wrong without any single action
//! failing:
//! - stagnation: repeated actions with no visible change
//! - workspace emptiness: everything knocked off or cleared away
//! - simulator timeouts, escalated from reposition to full restart
//! - quality decline, answered with snapshot rollback and scene reset
//!
//! Detectors only report. Ending the trial goes through
//! [`SharedControlState::fail_trial`] so repeated detections are harmless.

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::domain::errors::DomainResult;
use crate::domain::models::observation::OCCUPIED_DEPTH_THRESHOLD;
use crate::domain::models::{
    Config, DepthMap, FailureKind, NoChangeCounters, RunMode, SharedControlState, TaskVariant,
    WatchdogConfig,
};
use crate::domain::ports::RobotInterface;

/// What the occupied-pixel count says about the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceVerdict {
    Occupied,
    /// Clearing task finished: the table is empty.
    Cleared,
    /// Construction task lost its objects.
    Empty,
}

/// Stateless scene checks run by the main task every iteration.
#[derive(Debug, Clone)]
pub struct Watchdog {
    config: WatchdogConfig,
    variant: TaskVariant,
    mode: RunMode,
    simulation: bool,
    num_objects: usize,
    extra_objects: usize,
    max_actions_per_trial: u64,
}

impl Watchdog {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.watchdog.clone(),
            variant: config.run.task,
            mode: config.run.mode,
            simulation: config.run.simulation,
            num_objects: config.run.num_objects,
            extra_objects: config.run.extra_objects,
            max_actions_per_trial: config.run.max_actions_per_trial,
        }
    }

    /// Scene is stuck: both families exceeded their limit, or the combined
    /// count is high and the last grasp did not succeed either.
    ///
    /// Only simulation and testing runs restart on stagnation.
    pub fn is_stagnant(&self, counters: NoChangeCounters, previous_grasp_succeeded: bool) -> bool {
        if !(self.simulation || self.mode.is_testing()) {
            return false;
        }
        let limit = self.config.stagnation_limit;
        let both_stuck = counters.push > limit && counters.grasp > limit;
        let combined = !previous_grasp_succeeded
            && counters.total() > self.config.stagnation_combined_limit;
        both_stuck || combined
    }

    /// Occupied pixels below which the table counts as empty.
    pub fn empty_threshold(&self) -> usize {
        if self.variant == TaskVariant::Row {
            let objects = if self.mode.is_testing() {
                self.num_objects.saturating_sub(1)
            } else {
                self.num_objects
            };
            return self.config.empty_pixel_threshold * (objects + self.extra_objects);
        }
        if self.simulation && self.mode.is_testing() {
            self.config.empty_pixel_threshold_sim_testing
        } else {
            self.config.empty_pixel_threshold
        }
    }

    pub fn check_workspace(&self, depth: &DepthMap) -> WorkspaceVerdict {
        let occupied = depth.count_above(OCCUPIED_DEPTH_THRESHOLD);
        if occupied >= self.empty_threshold() {
            return WorkspaceVerdict::Occupied;
        }
        info!(occupied, threshold = self.empty_threshold(), "Workspace appears empty");
        if self.variant.places() {
            WorkspaceVerdict::Empty
        } else {
            WorkspaceVerdict::Cleared
        }
    }

    pub const fn trial_action_limit_reached(&self, actions_in_trial: u64) -> bool {
        actions_in_trial >= self.max_actions_per_trial
    }
}

/// Result of one simulator-timeout escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Escalation {
    pub problems: u32,
    pub restarted: bool,
}

/// Escalating response to a simulator that stops finishing iterations.
#[derive(Debug)]
pub struct SimTimeoutLadder {
    timeout: Duration,
    restart_threshold: u32,
    started: Instant,
    problems: u32,
}

impl SimTimeoutLadder {
    pub fn new(config: &WatchdogConfig, now: Instant) -> Self {
        Self {
            timeout: Duration::from_secs(config.sim_timeout_secs),
            restart_threshold: config.problem_restart_threshold,
            started: now,
            problems: 0,
        }
    }

    /// Start timing a new iteration; problems do not carry over.
    pub fn start_iteration(&mut self, now: Instant) {
        self.started = now;
        self.problems = 0;
    }

    pub fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started) > self.timeout
    }

    pub const fn problems(&self) -> u32 {
        self.problems
    }

    /// Check, reposition and, past the threshold, restart the simulator.
    ///
    /// The current trial is ended as failed and the timer restarts. A trial
    /// that was already ended had its scene reset by whoever ended it, so the
    /// ladder only repositions again when the simulator check fails.
    pub async fn escalate(
        &mut self,
        robot: &dyn RobotInterface,
        state: &RwLock<SharedControlState>,
        now: Instant,
    ) -> DomainResult<Escalation> {
        warn!(
            elapsed_secs = now.saturating_duration_since(self.started).as_secs(),
            problems = self.problems,
            "Simulator timeout; checking scene"
        );
        match robot.capture().await {
            Ok(frame) => info!(
                occupied = frame.depth.count_above(OCCUPIED_DEPTH_THRESHOLD),
                "Captured diagnostic frame"
            ),
            Err(e) => warn!(error = %e, "Diagnostic capture failed"),
        }
        let alive = robot.check_alive().await.unwrap_or(false);
        if !alive {
            warn!("Simulator check failed");
        }
        let ended_here = {
            let mut state = state.write().await;
            let ended = state.fail_trial(FailureKind::SimulatorTimeout);
            state.reset_heights();
            ended
        };
        if ended_here || !alive {
            if !robot.reposition_objects().await.unwrap_or(false) {
                self.problems += 3;
            }
        } else {
            debug!("Trial already ended; scene left to its reset");
        }
        self.problems += 1;

        let mut restarted = false;
        if self.problems > self.restart_threshold {
            error!(problems = self.problems, "Too many simulator problems; restarting");
            robot.restart().await?;
            robot.populate_objects().await?;
            restarted = true;
            self.problems = 0;
        }
        self.started = now;
        Ok(Escalation {
            problems: self.problems,
            restarted,
        })
    }
}

/// Rolling success rate over the last `capacity` outcomes.
#[derive(Debug, Clone)]
pub struct RollingRate {
    outcomes: VecDeque<bool>,
    capacity: usize,
    min_samples: usize,
}

impl RollingRate {
    pub fn new(capacity: usize, min_samples: usize) -> Self {
        Self {
            outcomes: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            min_samples,
        }
    }

    pub fn record(&mut self, success: bool) {
        if self.outcomes.len() == self.capacity {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(success);
    }

    /// `None` until enough outcomes have been recorded.
    pub fn rate(&self) -> Option<f64> {
        if self.outcomes.len() < self.min_samples.max(1) {
            return None;
        }
        let hits = self.outcomes.iter().filter(|s| **s).count();
        Some(hits as f64 / self.outcomes.len() as f64)
    }
}

/// `(best - 0.1) * scale > current`
pub fn is_bad_decline(best: f64, current: f64, scale: f64) -> bool {
    (best - 0.1) * scale > current
}

/// What to do about declining policy quality.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QualityVerdict {
    pub reload_snapshot: bool,
    pub reset_scene: bool,
}

/// Best-ever and rolling success rates for trials, grasps and places.
#[derive(Debug, Clone)]
pub struct QualityMonitor {
    trial: RollingRate,
    grasp: RollingRate,
    place: RollingRate,
    best_trial: Option<f64>,
    best_grasp: Option<f64>,
    best_place: Option<f64>,
    warmup: u64,
    cooldown: u64,
    last_intervention: u64,
}

const MIN_RATE_SAMPLES: usize = 10;

fn raise(best: &mut Option<f64>, current: Option<f64>) -> bool {
    match (current, *best) {
        (Some(c), Some(b)) if c <= b => false,
        (Some(c), _) => {
            *best = Some(c);
            true
        }
        (None, _) => false,
    }
}

fn declined(best: Option<f64>, current: Option<f64>, scale: f64) -> bool {
    matches!((best, current), (Some(b), Some(c)) if is_bad_decline(b, c, scale))
}

impl QualityMonitor {
    pub fn new(config: &WatchdogConfig) -> Self {
        Self {
            trial: RollingRate::new(config.quality_window, MIN_RATE_SAMPLES),
            grasp: RollingRate::new(config.quality_window, MIN_RATE_SAMPLES),
            place: RollingRate::new(config.quality_window, MIN_RATE_SAMPLES),
            best_trial: None,
            best_grasp: None,
            best_place: None,
            warmup: config.quality_warmup_iterations,
            cooldown: config.quality_cooldown_iterations,
            last_intervention: 0,
        }
    }

    pub fn record_trial(&mut self, success: bool) {
        self.trial.record(success);
    }

    pub fn record_grasp(&mut self, success: bool) {
        self.grasp.record(success);
    }

    pub fn record_place(&mut self, success: bool) {
        self.place.record(success);
    }

    pub fn trial_rate(&self) -> Option<f64> {
        self.trial.rate()
    }

    /// Raise best-ever rates. Returns true when the trial rate set a new best.
    pub fn update_best(&mut self) -> bool {
        raise(&mut self.best_grasp, self.grasp.rate());
        raise(&mut self.best_place, self.place.rate());
        raise(&mut self.best_trial, self.trial.rate())
    }

    /// Compare rolling rates with the best seen so far.
    pub fn check(&mut self, iteration: u64) -> QualityVerdict {
        if iteration < self.warmup || iteration < self.last_intervention + self.cooldown {
            return QualityVerdict::default();
        }
        let action_decline = declined(self.best_grasp, self.grasp.rate(), 0.6)
            || declined(self.best_place, self.place.rate(), 0.6);
        let verdict = QualityVerdict {
            reload_snapshot: action_decline
                || declined(self.best_trial, self.trial.rate(), 0.9),
            reset_scene: action_decline || declined(self.best_trial, self.trial.rate(), 0.6),
        };
        if verdict.reload_snapshot || verdict.reset_scene {
            warn!(
                iteration,
                trial_rate = ?self.trial.rate(),
                best_trial = ?self.best_trial,
                grasp_rate = ?self.grasp.rate(),
                best_grasp = ?self.best_grasp,
                reload = verdict.reload_snapshot,
                reset = verdict.reset_scene,
                "Policy quality declined"
            );
            self.last_intervention = iteration;
        }
        verdict
    }
}
