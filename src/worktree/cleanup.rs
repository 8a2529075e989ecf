//! Worktree removal
//!
//! Removal works from what is on disk, not from what the creating process
//! remembers, so the same routine serves normal release and recovery of
//! worktrees orphaned by a crash. Every linked checkout below the path (the
//! root one and any nested sub-repository checkouts) is found through its
//! `.git` file, removed, pruned from its repository and checked for leftover
//! registrations.

use crate::error::{RemakeError, RemakeResult};
use crate::store::Git;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// A linked checkout found inside a worktree directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Registration {
    /// Checked-out directory
    pub worktree: PathBuf,
    /// Per-checkout admin directory inside the owning repository
    pub admin_dir: PathBuf,
    /// Repository database the checkout belongs to
    pub common_dir: PathBuf,
    pub branch: Option<String>,
}

/// Target of a `gitdir:` line in a `.git` file
pub(crate) fn parse_gitdir(content: &str) -> Option<&str> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("gitdir:"))
        .map(str::trim)
        .filter(|target| !target.is_empty())
}

/// Branch named by a symbolic `HEAD`, `None` when detached
pub(crate) fn parse_head_branch(content: &str) -> Option<String> {
    content
        .trim()
        .strip_prefix("ref: refs/heads/")
        .map(String::from)
}

/// Lexically resolve `.` and `..` components
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

async fn read_registration(dot_git: &Path) -> RemakeResult<Option<Registration>> {
    let Some(worktree) = dot_git.parent() else {
        return Ok(None);
    };
    let content = fs::read_to_string(dot_git)
        .await
        .map_err(|e| RemakeError::io(format!("reading {}", dot_git.display()), e))?;
    let Some(target) = parse_gitdir(&content) else {
        return Ok(None);
    };
    let admin_dir = normalize(&worktree.join(target));

    // Only linked worktrees have a commondir; submodule checkouts do not
    let Ok(common) = fs::read_to_string(admin_dir.join("commondir")).await else {
        debug!("{} is not a linked worktree", worktree.display());
        return Ok(None);
    };
    let common_dir = normalize(&admin_dir.join(common.trim()));
    let branch = fs::read_to_string(admin_dir.join("HEAD"))
        .await
        .ok()
        .and_then(|head| parse_head_branch(&head));

    Ok(Some(Registration {
        worktree: worktree.to_path_buf(),
        admin_dir,
        common_dir,
        branch,
    }))
}

/// Every linked checkout at or below `root`, deepest first
pub(crate) async fn find_registrations(root: &Path) -> RemakeResult<Vec<Registration>> {
    let dot_gits: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name() == ".git" && entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect();

    let mut registrations = Vec::with_capacity(dot_gits.len());
    for dot_git in dot_gits {
        if let Some(registration) = read_registration(&dot_git).await? {
            registrations.push(registration);
        }
    }
    registrations.sort_by_key(|r| std::cmp::Reverse(r.worktree.components().count()));
    Ok(registrations)
}

async fn is_still_listed(registration: &Registration) -> RemakeResult<bool> {
    if registration.admin_dir.exists() {
        return Ok(true);
    }
    let listing = Git::with_git_dir(&registration.common_dir)
        .lines(&["worktree", "list", "--porcelain"])
        .await?;
    Ok(listing
        .iter()
        .filter_map(|line| line.strip_prefix("worktree "))
        .any(|listed| Path::new(listed) == registration.worktree))
}

/// Delete the worktree at `path` together with all nested checkouts
///
/// Fails with [`RemakeError::StaleWorktree`] if any repository still
/// registers one of the removed checkouts afterwards.
pub async fn delete_worktree(path: &Path) -> RemakeResult<()> {
    let path = fs::canonicalize(path)
        .await
        .map_err(|e| RemakeError::io(format!("resolving worktree {}", path.display()), e))?;

    let registrations = find_registrations(&path).await?;
    if registrations.is_empty() {
        warn!("No worktree registrations found below {}", path.display());
    }

    for registration in &registrations {
        if registration.worktree.exists() {
            fs::remove_dir_all(&registration.worktree).await.map_err(|e| {
                RemakeError::io(format!("removing {}", registration.worktree.display()), e)
            })?;
        }
    }
    if path.exists() {
        fs::remove_dir_all(&path)
            .await
            .map_err(|e| RemakeError::io(format!("removing {}", path.display()), e))?;
    }

    for registration in &registrations {
        let git = Git::with_git_dir(&registration.common_dir);
        git.run(&["worktree", "prune"]).await?;
        if let Some(ref branch) = registration.branch {
            if let Err(e) = git.run(&["branch", "-D", branch]).await {
                warn!("Could not delete branch {}: {}", branch, e);
            }
        }
    }

    for registration in &registrations {
        if is_still_listed(registration).await? {
            return Err(RemakeError::StaleWorktree {
                path: registration.worktree.clone(),
                repository: registration.common_dir.clone(),
            });
        }
    }

    info!(
        "Deleted worktree {} ({} registrations)",
        path.display(),
        registrations.len()
    );
    Ok(())
}
