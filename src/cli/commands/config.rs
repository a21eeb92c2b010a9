//! Implementation of the `stackbot config` commands.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;
use std::path::PathBuf;

use crate::cli::output::{output, CommandOutput};
use crate::domain::models::Config;
use crate::infrastructure::config::ConfigLoader;

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show {
        /// Configuration file (defaults to .stackbot/config.yaml)
        #[arg(long, short)]
        config: Option<PathBuf>,
    },

    /// Load and validate the configuration
    Validate {
        /// Configuration file (defaults to .stackbot/config.yaml)
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Serialize)]
struct ShowOutput {
    config: Config,
}

impl CommandOutput for ShowOutput {
    fn to_human(&self) -> String {
        serde_yaml::to_string(&self.config).unwrap_or_default()
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.config).unwrap_or_default()
    }
}

#[derive(Debug, Serialize)]
struct ValidateOutput {
    valid: bool,
    source: String,
}

impl CommandOutput for ValidateOutput {
    fn to_human(&self) -> String {
        format!("Configuration from {} is valid.", self.source)
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

fn load(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => ConfigLoader::load_from_file(path),
        None => ConfigLoader::load(),
    }
}

pub fn execute(args: ConfigArgs, json_mode: bool) -> Result<()> {
    match args.command {
        ConfigCommands::Show { config } => {
            let config = load(config.as_ref())?;
            output(&ShowOutput { config }, json_mode);
        }
        ConfigCommands::Validate { config } => {
            let source = config
                .as_ref()
                .map_or_else(|| ".stackbot/config.yaml".to_string(), |p| p.display().to_string());
            load(config.as_ref()).with_context(|| format!("Configuration from {source} is invalid"))?;
            output(&ValidateOutput { valid: true, source }, json_mode);
        }
    }
    Ok(())
}
