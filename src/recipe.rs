//! Recipe specifications and dataset discovery
//!
//! A specification is a JSON document stored under
//! `.remake/specifications/<name>` in the dataset it was registered against:
//!
//! ```json
//! {
//!   "method": "one-to-many",
//!   "input": ["raw/*.csv"],
//!   "output": ["summary.txt", "sub/plot.svg"],
//!   "parameter": {"threshold": "0.5"}
//! }
//! ```
//!
//! All four fields are required and typed; a document that does not fit is
//! rejected when it is loaded.

use crate::error::{RemakeError, RemakeResult};
use crate::store::VersionStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Directory (relative to a dataset root) holding specifications
pub const SPECIFICATION_DIR: &str = ".remake/specifications";

/// Directory (relative to a dataset root) holding method templates
pub const METHOD_DIR: &str = ".remake/methods";

/// A registered computation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Specification {
    /// Method template name
    pub method: String,
    /// Input patterns, relative to the dataset root
    pub input: Vec<String>,
    /// Output patterns, relative to the dataset root
    pub output: Vec<String>,
    pub parameter: BTreeMap<String, String>,
}

impl Specification {
    /// Parse a specification document, naming `path` in errors
    pub fn parse(path: &str, bytes: &[u8]) -> RemakeResult<Self> {
        let spec: Self = serde_json::from_slice(bytes)
            .map_err(|e| RemakeError::specification(path, e.to_string()))?;
        if spec.method.trim().is_empty() {
            return Err(RemakeError::specification(path, "empty method name"));
        }
        Ok(spec)
    }
}

/// Dataset-relative path of a specification file
pub fn specification_path(name: &str) -> String {
    format!("{}/{}", SPECIFICATION_DIR, name)
}

/// Dataset-relative path of a method template
pub fn method_path(name: &str) -> String {
    format!("{}/{}", METHOD_DIR, name)
}

/// Find the first directory, from `start` upward, whose repository knows `commit`
///
/// The search stops after `boundary` (when given) or at the filesystem root.
pub async fn find_dataset(
    store: &dyn VersionStore,
    start: &Path,
    commit: &str,
    boundary: Option<&Path>,
) -> RemakeResult<PathBuf> {
    for candidate in start.ancestors() {
        debug!("Looking for commit {} in {}", commit, candidate.display());
        if store.has_commit(candidate, commit).await? {
            return Ok(candidate.to_path_buf());
        }
        if boundary.is_some_and(|b| candidate == b) {
            break;
        }
    }

    Err(RemakeError::DatasetNotFound {
        commit: commit.to_string(),
        start: start.to_path_buf(),
    })
}

/// Read a recipe file as recorded in `commit`, failing if it is absent
pub async fn read_recorded(
    store: &dyn VersionStore,
    dataset: &Path,
    commit: &str,
    path: &str,
) -> RemakeResult<Vec<u8>> {
    store
        .read_at(dataset, commit, path)
        .await?
        .ok_or_else(|| RemakeError::specification(path, format!("not recorded in commit {}", commit)))
}
