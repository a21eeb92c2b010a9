//! Stackbot CLI entry point.

use clap::Parser;

use stackbot::cli::{Cli, Commands};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run(args) => stackbot::cli::commands::run::execute(args, cli.json).await,
        Commands::Config(args) => stackbot::cli::commands::config::execute(args, cli.json),
    };

    if let Err(err) = result {
        stackbot::cli::handle_error(err, cli.json);
    }
}
