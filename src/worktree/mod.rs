//! Disposable worktrees for running computations
//!
//! A computation never runs in the dataset itself. [`TreeProvider`] builds a
//! fresh checkout of the recorded commit with the inputs present, and
//! [`with_worktree`] guarantees the checkout is released again on every exit
//! path of the work done inside it, panics included.

mod cleanup;
mod provider;
mod scratch;

pub use cleanup::delete_worktree;
pub use provider::GitTreeProvider;
pub use scratch::ScratchProvider;

use crate::error::RemakeResult;
use crate::pattern::PatternSet;
use async_trait::async_trait;
use futures_util::FutureExt;
use std::collections::BTreeSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A materialized checkout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worktree {
    /// Root directory of the checkout
    pub path: PathBuf,
    /// Unique name, also used for the tracking branches
    pub name: String,
    /// Commit the root repository was checked out at
    pub commit: String,
    /// Input files present in the checkout, relative to its root
    pub inputs: BTreeSet<String>,
    /// Nested repositories populated inside the checkout, relative to its root
    pub sub_repositories: Vec<String>,
}

/// Builds and tears down worktrees
#[async_trait]
pub trait TreeProvider: Send + Sync {
    /// Check out `commit` of `dataset` with every file matching `inputs` available
    async fn materialize(
        &self,
        dataset: &Path,
        commit: &str,
        inputs: &PatternSet,
    ) -> RemakeResult<Worktree>;

    /// Remove the checkout and everything registered for it
    async fn release(&self, worktree: &Worktree) -> RemakeResult<()>;
}

/// Run `body` inside a fresh worktree and release it afterwards
///
/// Release happens whether `body` succeeds, fails or panics. An error from
/// `body` takes precedence over a release error; a panic is resumed after
/// release.
pub async fn with_worktree<T, F, Fut>(
    provider: &dyn TreeProvider,
    dataset: &Path,
    commit: &str,
    inputs: &PatternSet,
    body: F,
) -> RemakeResult<T>
where
    F: FnOnce(Worktree) -> Fut,
    Fut: Future<Output = RemakeResult<T>>,
{
    let worktree = provider.materialize(dataset, commit, inputs).await?;
    debug!("Materialized worktree {}", worktree.path.display());

    let outcome = AssertUnwindSafe(body(worktree.clone())).catch_unwind().await;
    let released = provider.release(&worktree).await;

    match outcome {
        Err(panic) => {
            if let Err(e) = released {
                warn!("Failed to release worktree after panic: {}", e);
            }
            std::panic::resume_unwind(panic)
        }
        Ok(Err(e)) => {
            if let Err(release_error) = released {
                warn!(
                    "Failed to release worktree {}: {}",
                    worktree.path.display(),
                    release_error
                );
            }
            Err(e)
        }
        Ok(Ok(value)) => released.map(|()| value),
    }
}
