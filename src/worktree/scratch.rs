//! Empty scratch directories for recipes that bring no dataset checkout

use super::{TreeProvider, Worktree};
use crate::error::{RemakeError, RemakeResult};
use crate::pattern::PatternSet;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

/// Hands out fresh empty directories below `base_dir`
pub struct ScratchProvider {
    base_dir: PathBuf,
}

impl ScratchProvider {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }
}

#[async_trait]
impl TreeProvider for ScratchProvider {
    async fn materialize(&self, _dataset: &Path, commit: &str, _inputs: &PatternSet) -> RemakeResult<Worktree> {
        let name = format!("remake-inline-{}", Uuid::new_v4().simple());
        let path = self.base_dir.join(&name);
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| RemakeError::io(format!("creating {}", path.display()), e))?;

        Ok(Worktree {
            path,
            name,
            commit: commit.to_string(),
            inputs: BTreeSet::new(),
            sub_repositories: Vec::new(),
        })
    }

    /// Removal failures are logged only; the content was already delivered
    async fn release(&self, worktree: &Worktree) -> RemakeResult<()> {
        if let Err(e) = tokio::fs::remove_dir_all(&worktree.path).await {
            warn!("Failed to remove {}: {}", worktree.path.display(), e);
        }
        Ok(())
    }
}
