//! Worktrees built with `git worktree`
//!
//! The root checkout is a linked worktree of the dataset at the recorded
//! commit. Nested repositories recorded at that commit are populated as
//! linked worktrees of their installed counterparts, at the recorded gitlink
//! commit, but only where an input pattern can reach into them. Annexed
//! inputs are fetched with `git annex get` afterwards.

use crate::error::{DirtyPath, DirtyState, RemakeError, RemakeResult};
use crate::pattern::{resolve_pattern_set, PatternSet};
use crate::store::{owning_repository, Git};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::cleanup::delete_worktree;
use super::{TreeProvider, Worktree};

/// Prefix of worktree directory and branch names
const NAME_PREFIX: &str = "remake-";

/// One repository to check out
#[derive(Debug, Clone, PartialEq, Eq)]
struct Checkout {
    /// Location relative to the worktree root, empty for the root
    relative: String,
    /// Installed repository providing the objects
    source: PathBuf,
    commit: String,
}

/// Gitlink entries (`path`, `commit`) from `ls-tree -r -z` output
pub(crate) fn parse_gitlinks(output: &[u8]) -> Vec<(String, String)> {
    String::from_utf8_lossy(output)
        .split('\0')
        .filter_map(|entry| {
            let (meta, path) = entry.split_once('\t')?;
            let mut fields = meta.split_whitespace();
            let (_mode, kind, object) = (fields.next()?, fields.next()?, fields.next()?);
            (kind == "commit").then(|| (path.to_string(), object.to_string()))
        })
        .collect()
}

/// Dirty entries from `status --porcelain=v1 -z` output
pub(crate) fn parse_status(output: &[u8]) -> Vec<(DirtyState, String)> {
    let text = String::from_utf8_lossy(output);
    let mut fields = text.split('\0');
    let mut entries = Vec::new();

    while let Some(entry) = fields.next() {
        if entry.len() < 4 || !entry.is_char_boundary(3) {
            continue;
        }
        let (code, path) = entry.split_at(3);
        let state = if code.starts_with("??") {
            DirtyState::Untracked
        } else {
            DirtyState::Modified
        };
        // Renames and copies carry the source path as an extra field
        if code.starts_with('R') || code.starts_with('C') {
            fields.next();
        }
        entries.push((state, path.to_string()));
    }
    entries
}

fn join_relative(prefix: &str, path: &str) -> String {
    if prefix.is_empty() {
        path.to_string()
    } else {
        format!("{}/{}", prefix, path)
    }
}

/// [`TreeProvider`] that shells out to `git worktree` and `git annex`
#[derive(Debug, Clone)]
pub struct GitTreeProvider {
    base_dir: PathBuf,
}

impl GitTreeProvider {
    /// Worktrees will be created as `<base_dir>/remake-<uuid>`
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Repositories the inputs can reach, parents before children
    async fn plan(
        &self,
        dataset: &Path,
        commit: &str,
        inputs: &PatternSet,
    ) -> RemakeResult<Vec<Checkout>> {
        let mut plan = vec![Checkout {
            relative: String::new(),
            source: dataset.to_path_buf(),
            commit: commit.to_string(),
        }];

        let mut index = 0;
        while index < plan.len() {
            let parent = plan[index].clone();
            index += 1;

            let listing = Git::new(&parent.source)
                .stdout_if_success(&["ls-tree", "-r", "-z", &parent.commit])
                .await?
                .ok_or_else(|| {
                    RemakeError::command_exec(
                        format!("git ls-tree {}", parent.commit),
                        format!("cannot list tree in {}", parent.source.display()),
                    )
                })?;

            for (path, sub_commit) in parse_gitlinks(&listing) {
                let relative = join_relative(&parent.relative, &path);
                if !inputs.may_contain(&relative) {
                    continue;
                }
                let source = parent.source.join(&path);
                if !source.join(".git").exists() {
                    warn!("Sub-repository {} is not installed, skipping", relative);
                    continue;
                }
                plan.push(Checkout {
                    relative,
                    source,
                    commit: sub_commit,
                });
            }
        }

        Ok(plan)
    }

    /// Every input path that is modified or untracked in a source repository
    async fn dirty_inputs(
        &self,
        plan: &[Checkout],
        inputs: &PatternSet,
    ) -> RemakeResult<Vec<DirtyPath>> {
        let mut dirty = BTreeSet::new();
        for checkout in plan {
            let status = Git::new(&checkout.source)
                .run_bytes(&[
                    "status",
                    "--porcelain=v1",
                    "-z",
                    "--untracked-files=all",
                    "--ignore-submodules=all",
                ])
                .await?;

            for (state, path) in parse_status(&status) {
                let path = join_relative(&checkout.relative, &path);
                if inputs.is_match(&path) {
                    dirty.insert(DirtyPath { path, state });
                }
            }
        }
        Ok(dirty.into_iter().collect())
    }

    async fn populate(&self, plan: &[Checkout], worktree: &mut Worktree) -> RemakeResult<()> {
        for checkout in plan {
            let target = if checkout.relative.is_empty() {
                worktree.path.clone()
            } else {
                worktree.path.join(&checkout.relative)
            };
            let target_str = target.to_string_lossy();
            Git::new(&checkout.source)
                .run(&[
                    "worktree",
                    "add",
                    "-b",
                    &worktree.name,
                    &target_str,
                    &checkout.commit,
                ])
                .await?;
            if !checkout.relative.is_empty() {
                worktree.sub_repositories.push(checkout.relative.clone());
            }
        }
        Ok(())
    }

    async fn fetch_inputs(&self, worktree: &mut Worktree, inputs: &PatternSet) -> RemakeResult<()> {
        worktree.inputs = resolve_pattern_set(&worktree.path, inputs)?;

        let mut by_repository: BTreeMap<PathBuf, Vec<String>> = BTreeMap::new();
        for input in &worktree.inputs {
            let (repository, path) = owning_repository(&worktree.path, input);
            by_repository.entry(repository).or_default().push(path);
        }

        for (repository, paths) in by_repository {
            let git = Git::new(&repository);
            if !git.success(&["config", "--get", "annex.uuid"]).await {
                continue;
            }
            let mut args = vec!["annex", "get", "--"];
            args.extend(paths.iter().map(String::as_str));
            git.run(&args).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl TreeProvider for GitTreeProvider {
    async fn materialize(
        &self,
        dataset: &Path,
        commit: &str,
        inputs: &PatternSet,
    ) -> RemakeResult<Worktree> {
        let plan = self.plan(dataset, commit, inputs).await?;

        let dirty = self.dirty_inputs(&plan, inputs).await?;
        if !dirty.is_empty() {
            return Err(RemakeError::UncleanSource { entries: dirty });
        }

        fs::create_dir_all(&self.base_dir)
            .await
            .map_err(|e| RemakeError::io(format!("creating {}", self.base_dir.display()), e))?;

        let name = format!("{}{}", NAME_PREFIX, Uuid::new_v4().simple());
        let mut worktree = Worktree {
            path: self.base_dir.join(&name),
            name,
            commit: commit.to_string(),
            inputs: BTreeSet::new(),
            sub_repositories: Vec::new(),
        };

        let built = match self.populate(&plan, &mut worktree).await {
            Ok(()) => self.fetch_inputs(&mut worktree, inputs).await,
            Err(e) => Err(e),
        };
        if let Err(e) = built {
            if worktree.path.exists() {
                if let Err(cleanup) = delete_worktree(&worktree.path).await {
                    warn!("Failed to remove partial worktree: {}", cleanup);
                }
            }
            return Err(e);
        }

        info!(
            "Provisioned {} with {} inputs across {} sub-repositories",
            worktree.path.display(),
            worktree.inputs.len(),
            worktree.sub_repositories.len()
        );
        Ok(worktree)
    }

    async fn release(&self, worktree: &Worktree) -> RemakeResult<()> {
        debug!("Releasing worktree {}", worktree.path.display());
        delete_worktree(&worktree.path).await
    }
}
