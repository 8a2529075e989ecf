//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

/// remake - compute-on-demand special remote for git-annex
///
/// Without a subcommand, speaks the external special remote protocol on
/// stdin/stdout. git-annex starts it as `git-annex-remote-remake`.
#[derive(Parser, Debug)]
#[command(name = "git-annex-remote-remake")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute (default: serve the protocol)
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "REMAKE_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Delete a worktree left behind by an interrupted retrieval
    DeleteWorktree(DeleteWorktreeArgs),

    /// Show or edit configuration
    Config(ConfigArgs),
}

/// Arguments for the delete-worktree command
#[derive(Parser, Debug)]
pub struct DeleteWorktreeArgs {
    /// Path of the worktree to delete
    pub path: PathBuf,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Set a configuration value
    Set {
        /// Configuration key (e.g., trust.backend)
        key: String,
        /// Value to set
        value: String,
    },
}
