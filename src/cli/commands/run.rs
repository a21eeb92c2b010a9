//! Implementation of the `stackbot run` command.

use anyhow::{bail, Context, Result};
use clap::Args;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::adapters::scoring::HeightmapScorer;
use crate::adapters::sim::{BlockWorldSim, SimOptions};
use crate::adapters::storage::FileRunStore;
use crate::application::trial_lifecycle::LATEST_SNAPSHOT;
use crate::application::{PauseControl, RunCoordinator, RunPorts, RunSummary, StopReason};
use crate::cli::output::{key_value_table, output, percent, CommandOutput};
use crate::domain::models::{ActionStats, Config, GoalMask, RunMode, TaskVariant};
use crate::domain::ports::ModelSnapshots;
use crate::infrastructure::config::ConfigLoader;
use crate::infrastructure::logging::LoggerImpl;

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Configuration file (defaults to .stackbot/config.yaml)
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Evaluate a fixed model instead of training
    #[arg(long)]
    pub testing: bool,

    /// Task variant: stack, row, unstack or clearing
    #[arg(long)]
    pub task: Option<TaskVariant>,

    /// Blocks in the goal structure
    #[arg(long)]
    pub goal_size: Option<usize>,

    /// Actions allowed per trial
    #[arg(long)]
    pub max_trial_actions: Option<u64>,

    /// Actions allowed for the whole run
    #[arg(long)]
    pub max_actions: Option<u64>,

    /// Trials to run in testing mode
    #[arg(long)]
    pub max_test_trials: Option<u64>,

    /// Resume a run directory, or `last` for the most recent one
    #[arg(long, value_name = "DIR|last")]
    pub resume: Option<String>,

    /// Seed for exploration, replay and the simulator
    #[arg(long)]
    pub seed: Option<u64>,

    /// Drive a physical robot instead of the simulator
    #[arg(long)]
    pub real: bool,

    /// JSON goal mask (rows, cols, weights) applied to every value map
    #[arg(long, value_name = "FILE")]
    pub goal_mask: Option<PathBuf>,
}

impl RunArgs {
    /// Fold command-line overrides into a loaded configuration.
    pub fn apply(&self, config: &mut Config) {
        if self.testing {
            config.run.mode = RunMode::Testing;
        }
        if let Some(task) = self.task {
            config.run.task = task;
        }
        if let Some(goal_size) = self.goal_size {
            config.run.goal_size = goal_size;
        }
        if let Some(max) = self.max_trial_actions {
            config.run.max_actions_per_trial = max;
        }
        if self.max_actions.is_some() {
            config.run.max_total_actions = self.max_actions;
        }
        if let Some(max) = self.max_test_trials {
            config.run.max_test_trials = max;
        }
        if let Some(seed) = self.seed {
            config.run.seed = seed;
        }
        if self.real {
            config.run.simulation = false;
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RunOutput {
    pub run_dir: PathBuf,
    pub task: TaskVariant,
    pub mode: RunMode,
    pub first_iteration: u64,
    pub last_iteration: u64,
    pub trials: u64,
    pub stop_reason: StopReason,
    pub stats: ActionStats,
}

impl RunOutput {
    fn new(run_dir: PathBuf, config: &Config, summary: RunSummary) -> Self {
        Self {
            run_dir,
            task: config.run.task,
            mode: config.run.mode,
            first_iteration: summary.first_iteration,
            last_iteration: summary.last_iteration,
            trials: summary.trials,
            stop_reason: summary.stop_reason,
            stats: summary.stats,
        }
    }
}

impl CommandOutput for RunOutput {
    fn to_human(&self) -> String {
        let s = &self.stats;
        let table = key_value_table([
            ("Run directory", self.run_dir.display().to_string()),
            ("Task", self.task.to_string()),
            ("Mode", format!("{:?}", self.mode).to_lowercase()),
            ("Iterations", format!("{}..{}", self.first_iteration, self.last_iteration)),
            ("Trials", self.trials.to_string()),
            ("Stopped by", format!("{:?}", self.stop_reason)),
            ("Actions", s.actions.to_string()),
            ("Grasp success", percent(s.grasp_success_rate())),
            ("Place success", percent(s.place_success_rate())),
            ("Trial success", percent(s.trial_success_rate())),
            ("Actions per partial", format!("{:.1}", s.actions_per_partial())),
            ("Actions per full", format!("{:.1}", s.actions_per_full())),
        ]);
        table.to_string()
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// Read and check a goal mask file.
pub fn load_goal_mask(path: &Path) -> Result<GoalMask> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read goal mask {}", path.display()))?;
    let mask: GoalMask = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse goal mask {}", path.display()))?;
    mask.validate()
        .with_context(|| format!("Invalid goal mask {}", path.display()))?;
    Ok(mask)
}

/// Feed Ctrl+C presses into the pause state machine.
fn spawn_interrupt_listener(pause: Arc<PauseControl>) {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            pause.interrupt(Instant::now());
        }
    });
}

pub async fn execute(args: RunArgs, json_mode: bool) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => ConfigLoader::load_from_file(path)?,
        None => ConfigLoader::load()?,
    };
    args.apply(&mut config);
    ConfigLoader::validate(&config).context("Invalid configuration after command-line overrides")?;
    if !config.run.simulation {
        bail!("No physical robot driver is built into this binary; implement RobotInterface for the hardware or run the simulator");
    }

    let store = match args.resume.as_deref() {
        Some("last") => {
            let dir = FileRunStore::latest_run(&config.storage.runs_dir)
                .await?
                .with_context(|| format!("No run to resume under {}", config.storage.runs_dir.display()))?;
            FileRunStore::open(&dir).await?
        }
        Some(dir) => FileRunStore::open(&PathBuf::from(dir)).await?,
        None => FileRunStore::create(&config.storage.runs_dir).await?,
    };
    let store = Arc::new(store);
    store.write_config(&config).await?;
    let _logger = LoggerImpl::init(&config.logging, Some(store.dir()))?;

    let robot = Arc::new(BlockWorldSim::new(SimOptions::from_config(&config)));
    let scorer = Arc::new(HeightmapScorer::new(config.run.num_rotations, store.models_dir()));
    if args.resume.is_some() && !scorer.load_snapshot(LATEST_SNAPSHOT).await? {
        warn!("No saved model in the resumed run; starting from initial weights");
    }

    let ports = RunPorts {
        robot,
        scorer: scorer.clone(),
        transitions: store.clone(),
        states: store.clone(),
        snapshots: scorer,
    };
    let pause = Arc::new(PauseControl::new(&config.pause));
    spawn_interrupt_listener(Arc::clone(&pause));

    let mut coordinator = RunCoordinator::new(config.clone(), ports, pause);
    if let Some(path) = &args.goal_mask {
        coordinator = coordinator.with_goal_mask(load_goal_mask(path)?)?;
    }
    if args.resume.is_some() {
        coordinator = coordinator.resume().await.context("Failed to resume run")?;
    }
    info!(dir = %store.dir().display(), "Starting run");
    let summary = coordinator.run().await?;

    output(&RunOutput::new(store.dir().to_path_buf(), &config, summary), json_mode);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let args = RunArgs {
            testing: true,
            task: Some(TaskVariant::Row),
            goal_size: Some(3),
            max_actions: Some(50),
            seed: Some(9),
            ..RunArgs::default()
        };
        let mut config = Config::default();
        args.apply(&mut config);
        assert_eq!(config.run.mode, RunMode::Testing);
        assert_eq!(config.run.task, TaskVariant::Row);
        assert_eq!(config.run.goal_size, 3);
        assert_eq!(config.run.max_total_actions, Some(50));
        assert_eq!(config.run.seed, 9);
        assert!(config.run.simulation);
    }

    #[test]
    fn test_load_goal_mask_checks_weight_count() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.json");
        std::fs::write(&good, r#"{"rows": 1, "cols": 2, "weights": [0.0, 1.0]}"#).unwrap();
        let mask = load_goal_mask(&good).unwrap();
        assert_eq!(mask.weights, vec![0.0, 1.0]);

        let short = dir.path().join("short.json");
        std::fs::write(&short, r#"{"rows": 2, "cols": 2, "weights": [1.0]}"#).unwrap();
        let err = load_goal_mask(&short).unwrap_err();
        assert!(err.to_string().contains("Invalid goal mask"));
    }
}
