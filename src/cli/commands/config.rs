//! Config command - show or edit configuration

use crate::cli::args::{ConfigAction, ConfigArgs};
use crate::config::{Config, ConfigManager, TrustBackend};
use crate::error::{RemakeError, RemakeResult};
use console::style;
use std::path::PathBuf;

/// Execute the config command
pub async fn execute(args: ConfigArgs, manager: &ConfigManager, config: &Config) -> RemakeResult<()> {
    match args.action {
        None | Some(ConfigAction::Show) => show_config(config)?,
        Some(ConfigAction::Path) => println!("{}", manager.path().display()),
        Some(ConfigAction::Init { force }) => init_config(manager, force).await?,
        Some(ConfigAction::Set { key, value }) => {
            let mut updated = config.clone();
            set_value(&mut updated, &key, &value)?;
            manager.save(&updated).await?;
            println!("{} Set {} = {}", style("✓").green(), key, value);
        }
    }

    Ok(())
}

fn show_config(config: &Config) -> RemakeResult<()> {
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

async fn init_config(manager: &ConfigManager, force: bool) -> RemakeResult<()> {
    let path = manager.path();

    if path.exists() && !force {
        eprintln!(
            "{} Config already exists at {}",
            style("!").yellow(),
            path.display()
        );
        eprintln!("  {}", style("Use --force to overwrite").dim());
        return Ok(());
    }

    manager.save(&Config::default()).await?;
    println!(
        "{} Configuration initialized {}",
        style("✓").green(),
        style(path.display()).dim()
    );
    Ok(())
}

/// Apply a dot-separated key to the configuration
fn set_value(config: &mut Config, key: &str, value: &str) -> RemakeResult<()> {
    let parts: Vec<&str> = key.split('.').collect();

    match parts.as_slice() {
        ["general", "log_format"] => match value {
            "text" | "json" => config.general.log_format = value.to_string(),
            _ => return Err(RemakeError::User(format!("Invalid log format: {}. Use text/json", value))),
        },
        ["general", "audit_log"] => config.general.audit_log = parse_bool(value)?,

        ["trust", "backend"] => config.trust.backend = parse_backend(value)?,
        ["trust", "trusted_keys"] => config.trust.trusted_keys = parse_list(value),
        ["trust", "git_config_key"] => config.trust.git_config_key = value.to_string(),

        ["execution", "timeout_secs"] => config.execution.timeout_secs = parse_u64(value)?,
        ["execution", "shell"] => config.execution.shell = value.to_string(),

        ["worktree", "base_dir"] => config.worktree.base_dir = optional_path(value),
        ["dataset", "search_boundary"] => config.dataset.search_boundary = optional_path(value),

        _ => {
            eprintln!("Valid keys:");
            for key in VALID_KEYS {
                eprintln!("  {}", key);
            }
            return Err(RemakeError::User(format!("Unknown config key: {}", key)));
        }
    }

    Ok(())
}

const VALID_KEYS: [&str; 9] = [
    "general.log_format",
    "general.audit_log",
    "trust.backend",
    "trust.trusted_keys",
    "trust.git_config_key",
    "execution.timeout_secs",
    "execution.shell",
    "worktree.base_dir",
    "dataset.search_boundary",
];

fn parse_bool(value: &str) -> RemakeResult<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(RemakeError::User(format!(
            "Invalid boolean value: {}. Use true/false",
            value
        ))),
    }
}

fn parse_u64(value: &str) -> RemakeResult<u64> {
    value
        .parse()
        .map_err(|_| RemakeError::User(format!("Invalid number: {}", value)))
}

fn parse_backend(value: &str) -> RemakeResult<TrustBackend> {
    match value.to_lowercase().as_str() {
        "git" => Ok(TrustBackend::Git),
        "ed25519" => Ok(TrustBackend::Ed25519),
        _ => Err(RemakeError::User(format!(
            "Invalid trust backend: {}. Use git/ed25519",
            value
        ))),
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// An empty value resets the path to its default
fn optional_path(value: &str) -> Option<PathBuf> {
    (!value.trim().is_empty()).then(|| PathBuf::from(value.trim()))
}
