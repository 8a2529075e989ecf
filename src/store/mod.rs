//! Access to the permanent versioned store
//!
//! The pipeline only needs a handful of store primitives: commit lookup,
//! reading a file as recorded in a commit, mapping a tracked path to its
//! content key, finding locally realized content and reinjecting freshly
//! computed bytes. [`VersionStore`] names exactly those; [`GitAnnexStore`]
//! provides them with `git` / `git annex`.

mod git;

pub use git::{Git, GitAnnexStore};

use crate::error::RemakeResult;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Store primitives used by the retrieval pipeline
#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Whether the repository enclosing `dir` knows `commit`
    async fn has_commit(&self, dir: &Path, commit: &str) -> RemakeResult<bool>;

    /// Contents of `path` as recorded in `commit`, `None` if absent there
    async fn read_at(&self, repo: &Path, commit: &str, path: &str) -> RemakeResult<Option<Vec<u8>>>;

    /// Content key of a tracked path, `None` if the path is not under content addressing
    async fn annex_key(&self, repo: &Path, path: &str) -> RemakeResult<Option<String>>;

    /// Location of the locally realized content for `key`, if present
    async fn content_location(&self, repo: &Path, key: &str) -> RemakeResult<Option<PathBuf>>;

    /// Make `source` the realized content of the tracked `path`
    async fn reinject(&self, repo: &Path, source: &Path, path: &str) -> RemakeResult<()>;
}

/// Split a dataset-relative path into its owning repository and the path inside it
///
/// The owner is the deepest directory along `relative` that carries a `.git`
/// entry; `root` itself is the fallback.
pub fn owning_repository(root: &Path, relative: &str) -> (PathBuf, String) {
    let components: Vec<&str> = relative.split('/').filter(|c| !c.is_empty()).collect();
    let mut owner = root.to_path_buf();
    let mut owner_depth = 0;
    let mut current = root.to_path_buf();

    // The last component is the file itself
    for (depth, component) in components
        .iter()
        .enumerate()
        .take(components.len().saturating_sub(1))
    {
        current.push(component);
        if current.join(".git").exists() {
            owner = current.clone();
            owner_depth = depth + 1;
        }
    }

    (owner, components[owner_depth..].join("/"))
}
