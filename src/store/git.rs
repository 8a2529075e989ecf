//! Git and git-annex subprocess plumbing

use crate::error::{RemakeError, RemakeResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::debug;

use super::VersionStore;

/// Git invocation bound to a working directory (or an explicit git dir)
#[derive(Debug, Clone)]
pub struct Git {
    dir: PathBuf,
    git_dir: Option<PathBuf>,
}

impl Git {
    /// Run git with `dir` as the working directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            git_dir: None,
        }
    }

    /// Run git against a repository database directly (`--git-dir`)
    pub fn with_git_dir(git_dir: impl Into<PathBuf>) -> Self {
        let git_dir = git_dir.into();
        let dir = git_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));
        Self {
            dir,
            git_dir: Some(git_dir),
        }
    }

    fn describe(&self, args: &[&str]) -> String {
        format!("git {} (in {})", args.join(" "), self.dir.display())
    }

    /// Execute git and return the raw output
    pub async fn output(&self, args: &[&str]) -> RemakeResult<Output> {
        debug!("Executing: {}", self.describe(args));

        let mut command = Command::new("git");
        if let Some(ref git_dir) = self.git_dir {
            command.arg("--git-dir").arg(git_dir);
        }
        command
            .args(args)
            .current_dir(&self.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| RemakeError::command_failed(self.describe(args), e))
    }

    /// Execute git, failing on a nonzero exit, and return trimmed stdout
    pub async fn run(&self, args: &[&str]) -> RemakeResult<String> {
        let output = self.output(args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(RemakeError::command_exec(self.describe(args), stderr.trim()))
        }
    }

    /// Execute git, failing on a nonzero exit, and return raw stdout
    pub async fn run_bytes(&self, args: &[&str]) -> RemakeResult<Vec<u8>> {
        let output = self.output(args).await?;
        if output.status.success() {
            Ok(output.stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(RemakeError::command_exec(self.describe(args), stderr.trim()))
        }
    }

    /// Execute git and report only whether it exited successfully
    pub async fn success(&self, args: &[&str]) -> bool {
        self.output(args)
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Stdout of a successful run, `None` for a nonzero exit
    pub async fn stdout_if_success(&self, args: &[&str]) -> RemakeResult<Option<Vec<u8>>> {
        let output = self.output(args).await?;
        Ok(output.status.success().then_some(output.stdout))
    }

    /// Execute git and split stdout into non-empty lines
    pub async fn lines(&self, args: &[&str]) -> RemakeResult<Vec<String>> {
        Ok(self
            .run(args)
            .await?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }
}

/// [`VersionStore`] backed by the `git` and `git annex` command line tools
#[derive(Debug, Default)]
pub struct GitAnnexStore;

impl GitAnnexStore {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl VersionStore for GitAnnexStore {
    async fn has_commit(&self, dir: &Path, commit: &str) -> RemakeResult<bool> {
        if !dir.is_dir() {
            return Ok(false);
        }
        let object_type = Git::new(dir).stdout_if_success(&["cat-file", "-t", commit]).await?;
        Ok(object_type.is_some_and(|t| String::from_utf8_lossy(&t).trim() == "commit"))
    }

    async fn read_at(&self, repo: &Path, commit: &str, path: &str) -> RemakeResult<Option<Vec<u8>>> {
        let object = format!("{}:{}", commit, path);
        Git::new(repo)
            .stdout_if_success(&["cat-file", "blob", &object])
            .await
    }

    async fn annex_key(&self, repo: &Path, path: &str) -> RemakeResult<Option<String>> {
        let key = Git::new(repo)
            .stdout_if_success(&["annex", "lookupkey", "--", path])
            .await?;
        Ok(key
            .map(|k| String::from_utf8_lossy(&k).trim().to_string())
            .filter(|k| !k.is_empty()))
    }

    async fn content_location(&self, repo: &Path, key: &str) -> RemakeResult<Option<PathBuf>> {
        let location = Git::new(repo)
            .stdout_if_success(&["annex", "contentlocation", key])
            .await?;
        Ok(location
            .map(|l| String::from_utf8_lossy(&l).trim().to_string())
            .filter(|l| !l.is_empty())
            .map(|l| repo.join(l)))
    }

    async fn reinject(&self, repo: &Path, source: &Path, path: &str) -> RemakeResult<()> {
        let source = source.to_string_lossy();
        Git::new(repo)
            .run(&["annex", "reinject", "--", &source, path])
            .await
            .map(|_| ())
    }
}
