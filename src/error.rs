//! Error types for remake
//!
//! All modules use `RemakeResult<T>` as their return type.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for remake operations
pub type RemakeResult<T> = Result<T, RemakeError>;

/// Why a source path blocks provisioning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DirtyState {
    /// Tracked, but the working tree differs from the committed state
    Modified,
    /// Present in the working tree but not tracked
    Untracked,
}

impl fmt::Display for DirtyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Modified => write!(f, "modified"),
            Self::Untracked => write!(f, "untracked"),
        }
    }
}

/// A single path that prevents a clean checkout of the inputs
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DirtyPath {
    /// Path relative to the dataset root
    pub path: String,
    pub state: DirtyState,
}

impl fmt::Display for DirtyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot provision {} input: {}", self.state, self.path)
    }
}

fn join_dirty(entries: &[DirtyPath]) -> String {
    entries
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn join_parameters(parameters: &BTreeMap<String, String>) -> String {
    parameters
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(" ")
}

/// All errors that can occur in remake
#[derive(Error, Debug)]
pub enum RemakeError {
    // Address and protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid specification {path}: {reason}")]
    Specification { path: String, reason: String },

    // Dataset errors
    #[error("Could not find dataset with commit {commit}, starting from {}", .start.display())]
    DatasetNotFound { commit: String, start: PathBuf },

    // Trust errors
    #[error("Verification of {path} failed: {reason}")]
    Verification { path: String, reason: String },

    // Worktree errors
    #[error("Unclean source: {}", join_dirty(.entries))]
    UncleanSource { entries: Vec<DirtyPath> },

    #[error("Stale worktree registration for {} remains in {}", .path.display(), .repository.display())]
    StaleWorktree { path: PathBuf, repository: PathBuf },

    // Computation errors
    #[error("Computation failed: method {method} with parameters [{}]: {reason}", join_parameters(.parameters))]
    ComputationFailed {
        method: String,
        parameters: BTreeMap<String, String>,
        reason: String,
    },

    #[error("Computation timed out after {seconds}s: method {method}")]
    ComputationTimeout { method: String, seconds: u64 },

    #[error("Requested output was not produced: {path}")]
    MissingOutput { path: String },

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid glob pattern {pattern}: {reason}")]
    Glob { pattern: String, reason: String },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command execution error: {command}, stderr: {stderr}")]
    CommandExecution { command: String, stderr: String },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("{0}")]
    User(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RemakeError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a command execution error
    pub fn command_exec(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::CommandExecution {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    /// Create a verification error
    pub fn verification(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Verification {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a specification error
    pub fn specification(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Specification {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Short machine-readable category, used for event records
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "protocol",
            Self::Specification { .. } => "specification",
            Self::DatasetNotFound { .. } => "dataset_not_found",
            Self::Verification { .. } => "verification",
            Self::UncleanSource { .. } => "unclean_source",
            Self::StaleWorktree { .. } => "stale_worktree",
            Self::ComputationFailed { .. } => "computation_failed",
            Self::ComputationTimeout { .. } => "computation_timeout",
            Self::MissingOutput { .. } => "missing_output",
            Self::ConfigInvalid { .. } | Self::ConfigDirCreate { .. } => "config",
            Self::Glob { .. } => "glob",
            Self::Io { .. } => "io",
            Self::CommandFailed { .. } | Self::CommandExecution { .. } => "command",
            Self::Json(_) | Self::TomlParse(_) | Self::TomlSerialize(_) => "serialization",
            Self::User(_) => "user",
            Self::Internal(_) => "internal",
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::Verification { .. } => Some(
                "Add the signer to trust.trusted_keys, or set allow_untrusted_execution=true on the remote (dangerous)",
            ),
            Self::UncleanSource { .. } => Some("Save or discard local changes to the inputs first"),
            Self::StaleWorktree { .. } => Some("Run: git worktree prune"),
            Self::DatasetNotFound { .. } => {
                Some("Fetch the dataset history that contains the recorded root version")
            }
            _ => None,
        }
    }
}
