//! git-annex-remote-remake
//!
//! CLI entry point: serves the special remote protocol, or runs a
//! maintenance subcommand.

use clap::Parser;
use console::style;
use remake::cli::{Cli, Commands};
use remake::config::{Config, ConfigManager};
use remake::error::RemakeResult;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Environment variable overriding the log filter
const LOG_ENV: &str = "REMAKE_LOG";

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr; stdout belongs to the protocol
fn init_logging(verbose: u8, config: &Config) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| match verbose {
        0 => EnvFilter::new("remake=warn"),
        1 => EnvFilter::new("remake=info"),
        _ => EnvFilter::new("remake=debug"),
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if config.general.log_format == "json" {
        builder.json().init();
    } else {
        builder.without_time().init();
    }
}

async fn run() -> RemakeResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = config_manager.load().await?;

    init_logging(cli.verbose, &config);

    match cli.command {
        None => remake::cli::commands::remote(config).await,
        Some(Commands::DeleteWorktree(args)) => remake::cli::commands::delete_worktree(args).await,
        Some(Commands::Config(args)) => {
            remake::cli::commands::config(args, &config_manager, &config).await
        }
    }
}
