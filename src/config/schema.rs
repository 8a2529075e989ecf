//! Configuration schema for remake
//!
//! Configuration is stored at `~/.config/remake/config.toml`

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Recipe trust settings
    pub trust: TrustConfig,

    /// Method execution settings
    pub execution: ExecutionConfig,

    /// Worktree placement
    pub worktree: WorktreeConfig,

    /// Dataset discovery
    pub dataset: DatasetConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,

    /// Enable the retrieval event log
    pub audit_log: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
            audit_log: true,
        }
    }
}

/// Signature backend used to authorize recipes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustBackend {
    /// Signed commits, checked with `git verify-commit`
    #[default]
    Git,
    /// Detached ed25519 signatures stored next to the file
    Ed25519,
}

/// Trust settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    pub backend: TrustBackend,

    /// Key identifiers whose signatures authorize execution
    pub trusted_keys: Vec<String>,

    /// Git config variable holding additional comma-separated key ids
    pub git_config_key: String,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            backend: TrustBackend::Git,
            trusted_keys: vec![],
            git_config_key: "remake.trusted-keys".to_string(),
        }
    }
}

/// Method execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Wall-clock limit for a single method run in seconds (0 = none)
    pub timeout_secs: u64,

    /// Shell used for templates with `use_shell = true`
    pub shell: String,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 0,
            shell: "/bin/sh".to_string(),
        }
    }
}

/// Worktree placement
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorktreeConfig {
    /// Directory under which disposable worktrees are created
    pub base_dir: Option<PathBuf>,
}

impl WorktreeConfig {
    /// Effective base directory
    pub fn base_dir(&self) -> PathBuf {
        self.base_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("remake-worktrees"))
    }
}

/// Dataset discovery settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Upward dataset search never leaves this directory
    pub search_boundary: Option<PathBuf>,
}
