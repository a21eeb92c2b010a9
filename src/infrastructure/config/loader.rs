use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use std::path::Path;
use thiserror::Error;

use crate::domain::models::config::Config;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid goal_size: {goal_size}. Must be between 1 and num_objects ({num_objects})")]
    InvalidGoalSize { goal_size: usize, num_objects: usize },

    #[error("Invalid start_offset: {0}. Cannot exceed goal_size")]
    InvalidStartOffset(usize),

    #[error("Invalid {0}: must be at least 1")]
    InvalidActionLimit(&'static str),

    #[error("Invalid num_objects: {0}. The palette has 10 colors")]
    InvalidObjectCount(usize),

    #[error("Invalid {name}: {value}. Must be between 0 and 1")]
    InvalidProbability { name: &'static str, value: f64 },

    #[error("Invalid power_law_exponent: {0}. Must be positive")]
    InvalidExponent(f64),

    #[error(
        "Invalid pause thresholds: stop ({stop}) must be at least 2 and below hard stop ({hard_stop})"
    )]
    InvalidPauseThresholds { stop: u32, hard_stop: u32 },

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid log rotation: {0}. Must be one of: daily, hourly, never")]
    InvalidRotation(String),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .stackbot/config.yaml (project config)
    /// 3. .stackbot/local.yaml (per-machine overrides, optional)
    /// 4. Environment variables (STACKBOT_* prefix, `__` separates sections)
    pub fn load() -> Result<Config> {
        let config: Config = Self::figment(Path::new(".stackbot/config.yaml"))
            .merge(Yaml::file(".stackbot/local.yaml"))
            .merge(Env::prefixed("STACKBOT_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file, still honoring environment
    /// overrides.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let config: Config = Self::figment(path)
            .merge(Env::prefixed("STACKBOT_").split("__"))
            .extract()
            .with_context(|| format!("Failed to load config from {}", path.display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path))
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        let run = &config.run;
        if run.num_objects == 0 || run.num_objects > 10 {
            return Err(ConfigError::InvalidObjectCount(run.num_objects));
        }
        if run.goal_size == 0 || run.goal_size > run.num_objects {
            return Err(ConfigError::InvalidGoalSize {
                goal_size: run.goal_size,
                num_objects: run.num_objects,
            });
        }
        if run.start_offset > run.goal_size {
            return Err(ConfigError::InvalidStartOffset(run.start_offset));
        }
        if run.extra_objects >= run.num_objects {
            return Err(ConfigError::ValidationFailed(format!(
                "extra_objects ({}) must leave at least one goal object",
                run.extra_objects
            )));
        }

        if run.max_actions_per_trial == 0 {
            return Err(ConfigError::InvalidActionLimit("max_actions_per_trial"));
        }
        if run.max_total_actions == Some(0) {
            return Err(ConfigError::InvalidActionLimit("max_total_actions"));
        }
        if run.mode.is_testing() && run.max_test_trials == 0 {
            return Err(ConfigError::InvalidActionLimit("max_test_trials"));
        }
        if run.trials_per_case == 0 {
            return Err(ConfigError::InvalidActionLimit("trials_per_case"));
        }
        if run.num_rotations == 0 {
            return Err(ConfigError::InvalidActionLimit("num_rotations"));
        }
        if config.policy.push_frequency_one_in_n == 0 {
            return Err(ConfigError::InvalidActionLimit("push_frequency_one_in_n"));
        }

        let discount = config.policy.future_reward_discount;
        if !(0.0..=1.0).contains(&discount) {
            return Err(ConfigError::InvalidProbability {
                name: "future_reward_discount",
                value: discount,
            });
        }
        let all_history = config.replay.all_history_prob;
        if !(0.0..=1.0).contains(&all_history) {
            return Err(ConfigError::InvalidProbability {
                name: "all_history_prob",
                value: all_history,
            });
        }
        let exponent = config.replay.power_law_exponent;
        if !exponent.is_finite() || exponent <= 0.0 {
            return Err(ConfigError::InvalidExponent(exponent));
        }

        let pause = &config.pause;
        if pause.stop_threshold < 2 || pause.stop_threshold >= pause.hard_stop_threshold {
            return Err(ConfigError::InvalidPauseThresholds {
                stop: pause.stop_threshold,
                hard_stop: pause.hard_stop_threshold,
            });
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }
        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }
        let valid_rotations = ["daily", "hourly", "never"];
        if !valid_rotations.contains(&config.logging.rotation.as_str()) {
            return Err(ConfigError::InvalidRotation(config.logging.rotation.clone()));
        }

        Ok(())
    }
}
