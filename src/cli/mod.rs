//! Command-line interface.

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};

use commands::config::ConfigArgs;
use commands::run::RunArgs;

#[derive(Parser, Debug)]
#[command(name = "stackbot")]
#[command(about = "Stackbot - trial and action control loop for block stacking", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output in JSON format
    #[arg(short, long, global = true)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run training or testing trials
    Run(RunArgs),

    /// Inspect and validate configuration
    Config(ConfigArgs),
}

/// Report a command failure and exit with a non-zero status.
pub fn handle_error(err: anyhow::Error, json_mode: bool) -> ! {
    if json_mode {
        let chain: Vec<String> = err.chain().map(ToString::to_string).collect();
        let body = serde_json::json!({ "error": err.to_string(), "causes": chain });
        eprintln!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
    } else {
        eprintln!("Error: {err:#}");
    }
    std::process::exit(1);
}
