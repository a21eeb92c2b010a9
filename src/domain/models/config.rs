use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::task::{MatchRule, RunMode, TaskVariant};

/// Main configuration structure for stackbot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Run shape: mode, task, goal and action bounds
    #[serde(default)]
    pub run: RunConfig,

    /// Action selection and reward settings
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Goal-progress evaluation settings
    #[serde(default)]
    pub progress: ProgressConfig,

    /// Failure detection and recovery thresholds
    #[serde(default)]
    pub watchdog: WatchdogConfig,

    /// Experience replay settings
    #[serde(default)]
    pub replay: ReplayConfig,

    /// Operator interrupt handling
    #[serde(default)]
    pub pause: PauseConfig,

    /// Where run artifacts are written
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RunConfig {
    /// training or testing
    #[serde(default)]
    pub mode: RunMode,

    /// stack, row, unstack or clearing
    #[serde(default = "default_task")]
    pub task: TaskVariant,

    /// Drive the in-tree simulator instead of a physical robot
    #[serde(default = "default_true")]
    pub simulation: bool,

    /// Objects placed in the scene
    #[serde(default = "default_num_objects")]
    pub num_objects: usize,

    /// Objects in the scene beyond those the goal uses
    #[serde(default)]
    pub extra_objects: usize,

    /// Blocks in a completed structure
    #[serde(default = "default_goal_size")]
    pub goal_size: usize,

    /// Reshuffle the goal color order every trial
    #[serde(default = "default_true")]
    pub goal_conditioned: bool,

    /// Cursor position a freshly reset goal starts from
    #[serde(default)]
    pub start_offset: usize,

    /// Actions allowed in a single trial before it is ended
    #[serde(default = "default_max_actions_per_trial")]
    pub max_actions_per_trial: u64,

    /// Total actions before the run stops (unbounded when absent)
    #[serde(default)]
    pub max_total_actions: Option<u64>,

    /// Trials to run in testing mode before stopping
    #[serde(default = "default_max_test_trials")]
    pub max_test_trials: u64,

    /// Preset scene files loaded in turn during testing
    #[serde(default)]
    pub preset_cases: Vec<PathBuf>,

    /// Trials spent on each preset case
    #[serde(default = "default_trials_per_case")]
    pub trials_per_case: u64,

    /// Seed for exploration and replay sampling
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Heightmap rotations scored per primitive
    #[serde(default = "default_num_rotations")]
    pub num_rotations: usize,
}

const fn default_task() -> TaskVariant {
    TaskVariant::Stack
}

const fn default_true() -> bool {
    true
}

const fn default_num_objects() -> usize {
    4
}

const fn default_goal_size() -> usize {
    4
}

const fn default_max_actions_per_trial() -> u64 {
    30
}

const fn default_max_test_trials() -> u64 {
    100
}

const fn default_trials_per_case() -> u64 {
    1
}

const fn default_seed() -> u64 {
    1234
}

const fn default_num_rotations() -> usize {
    8
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::default(),
            task: default_task(),
            simulation: true,
            num_objects: default_num_objects(),
            extra_objects: 0,
            goal_size: default_goal_size(),
            goal_conditioned: true,
            start_offset: 0,
            max_actions_per_trial: default_max_actions_per_trial(),
            max_total_actions: None,
            max_test_trials: default_max_test_trials(),
            preset_cases: vec![],
            trials_per_case: default_trials_per_case(),
            seed: default_seed(),
            num_rotations: default_num_rotations(),
        }
    }
}

/// Action selection, exploration and reward configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PolicyConfig {
    /// Never push; only grasp (and place when the task places)
    #[serde(default)]
    pub grasp_only: bool,

    /// Decay the exploration probability over iterations
    #[serde(default = "default_true")]
    pub explore_rate_decay: bool,

    /// Exploring pushes are chosen one time in this many
    #[serde(default = "default_push_frequency")]
    pub push_frequency_one_in_n: u32,

    /// Sometimes act at a uniformly random location while exploring
    #[serde(default)]
    pub random_actions: bool,

    /// Use the scorer heuristic after repeated no-change actions
    #[serde(default)]
    pub heuristic_bootstrap: bool,

    /// Consecutive no-change actions before the heuristic is used
    #[serde(default = "default_heuristic_threshold")]
    pub heuristic_threshold: u32,

    /// Discount on the best next value when building labels
    #[serde(default = "default_future_reward_discount")]
    pub future_reward_discount: f64,

    /// Reward pushes that changed the scene
    #[serde(default = "default_true")]
    pub push_rewards: bool,

    /// Do not scale rewards by structure height
    #[serde(default)]
    pub no_height_reward: bool,
}

const fn default_push_frequency() -> u32 {
    5
}

const fn default_heuristic_threshold() -> u32 {
    2
}

const fn default_future_reward_discount() -> f64 {
    0.5
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            grasp_only: false,
            explore_rate_decay: true,
            push_frequency_one_in_n: default_push_frequency(),
            random_actions: false,
            heuristic_bootstrap: false,
            heuristic_threshold: default_heuristic_threshold(),
            future_reward_discount: default_future_reward_discount(),
            push_rewards: true,
            no_height_reward: false,
        }
    }
}

/// Goal-progress evaluation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ProgressConfig {
    /// at_least or exact
    #[serde(default)]
    pub match_rule: MatchRule,

    /// Reset the scene when progress reverses (forced off in testing)
    #[serde(default = "default_true")]
    pub reset_on_reversal: bool,

    /// End the trial when blocks are stacked out of goal order
    #[serde(default = "default_true")]
    pub end_on_incorrect_order: bool,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            match_rule: MatchRule::default(),
            reset_on_reversal: true,
            end_on_incorrect_order: true,
        }
    }
}

/// Watchdog thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WatchdogConfig {
    /// No-change actions per family before both families count as stuck
    #[serde(default = "default_stagnation_limit")]
    pub stagnation_limit: u32,

    /// Combined no-change actions that also count as stuck
    #[serde(default = "default_stagnation_combined_limit")]
    pub stagnation_combined_limit: u32,

    /// Changed pixels needed to call an action effective
    #[serde(default = "default_change_pixel_threshold")]
    pub change_pixel_threshold: usize,

    /// Occupied pixels per expected object before the table counts as empty
    #[serde(default = "default_empty_pixel_threshold")]
    pub empty_pixel_threshold: usize,

    /// Occupied-pixel threshold when testing in simulation
    #[serde(default = "default_empty_pixel_threshold_sim_testing")]
    pub empty_pixel_threshold_sim_testing: usize,

    /// Seconds without finishing an iteration before the simulator is checked
    #[serde(default = "default_sim_timeout_secs")]
    pub sim_timeout_secs: u64,

    /// Problem count above which the simulator is restarted
    #[serde(default = "default_problem_restart_threshold")]
    pub problem_restart_threshold: u32,

    /// Iterations before quality decline is monitored
    #[serde(default = "default_quality_warmup_iterations")]
    pub quality_warmup_iterations: u64,

    /// Iterations between quality interventions
    #[serde(default = "default_quality_cooldown_iterations")]
    pub quality_cooldown_iterations: u64,

    /// Recent outcomes each rolling rate is computed over
    #[serde(default = "default_quality_window")]
    pub quality_window: usize,

    /// Homing problems before a human-visible warning
    #[serde(default = "default_homing_warn_threshold")]
    pub homing_warn_threshold: u32,
}

const fn default_stagnation_limit() -> u32 {
    2
}

const fn default_stagnation_combined_limit() -> u32 {
    10
}

const fn default_change_pixel_threshold() -> usize {
    300
}

const fn default_empty_pixel_threshold() -> usize {
    300
}

const fn default_empty_pixel_threshold_sim_testing() -> usize {
    10
}

const fn default_sim_timeout_secs() -> u64 {
    60
}

const fn default_problem_restart_threshold() -> u32 {
    2
}

const fn default_quality_warmup_iterations() -> u64 {
    1000
}

const fn default_quality_cooldown_iterations() -> u64 {
    60
}

const fn default_quality_window() -> usize {
    200
}

const fn default_homing_warn_threshold() -> u32 {
    2
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            stagnation_limit: default_stagnation_limit(),
            stagnation_combined_limit: default_stagnation_combined_limit(),
            change_pixel_threshold: default_change_pixel_threshold(),
            empty_pixel_threshold: default_empty_pixel_threshold(),
            empty_pixel_threshold_sim_testing: default_empty_pixel_threshold_sim_testing(),
            sim_timeout_secs: default_sim_timeout_secs(),
            problem_restart_threshold: default_problem_restart_threshold(),
            quality_warmup_iterations: default_quality_warmup_iterations(),
            quality_cooldown_iterations: default_quality_cooldown_iterations(),
            quality_window: default_quality_window(),
            homing_warn_threshold: default_homing_warn_threshold(),
        }
    }
}

/// Experience replay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ReplayConfig {
    /// Train on past transitions while waiting
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Exponent of the rank distribution (higher favors surprising samples)
    #[serde(default = "default_power_law_exponent")]
    pub power_law_exponent: f64,

    /// Probability of ignoring outcome stratification for one draw
    #[serde(default = "default_all_history_prob")]
    pub all_history_prob: f64,

    /// Frames kept in memory for replay
    #[serde(default = "default_frame_cache_capacity")]
    pub frame_cache_capacity: usize,

    /// Sleep between waits when replay has nothing to do
    #[serde(default = "default_idle_sleep_ms")]
    pub idle_sleep_ms: u64,
}

const fn default_power_law_exponent() -> f64 {
    2.0
}

const fn default_all_history_prob() -> f64 {
    0.05
}

const fn default_frame_cache_capacity() -> usize {
    2000
}

const fn default_idle_sleep_ms() -> u64 {
    100
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            power_law_exponent: default_power_law_exponent(),
            all_history_prob: default_all_history_prob(),
            frame_cache_capacity: default_frame_cache_capacity(),
            idle_sleep_ms: default_idle_sleep_ms(),
        }
    }
}

/// Operator interrupt configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PauseConfig {
    /// Seconds between interrupts that still count as one burst
    #[serde(default = "default_pause_window_secs")]
    pub window_secs: u64,

    /// Interrupts in one burst that request a clean stop
    #[serde(default = "default_stop_threshold")]
    pub stop_threshold: u32,

    /// Interrupts in one burst that request an immediate stop
    #[serde(default = "default_hard_stop_threshold")]
    pub hard_stop_threshold: u32,
}

const fn default_pause_window_secs() -> u64 {
    5
}

const fn default_stop_threshold() -> u32 {
    3
}

const fn default_hard_stop_threshold() -> u32 {
    5
}

impl Default for PauseConfig {
    fn default() -> Self {
        Self {
            window_secs: default_pause_window_secs(),
            stop_threshold: default_stop_threshold(),
            hard_stop_threshold: default_hard_stop_threshold(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StorageConfig {
    /// Directory holding one subdirectory per run
    #[serde(default = "default_runs_dir")]
    pub runs_dir: PathBuf,
}

fn default_runs_dir() -> PathBuf {
    PathBuf::from(".stackbot/runs")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            runs_dir: default_runs_dir(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Also write JSON logs into the run directory
    #[serde(default = "default_true")]
    pub file_output: bool,

    /// File rotation: daily, hourly or never
    #[serde(default = "default_rotation")]
    pub rotation: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file_output: true,
            rotation: default_rotation(),
        }
    }
}
