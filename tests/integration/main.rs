//! Integration tests for remake

use std::path::{Path, PathBuf};

/// Config file that keeps tests from writing the user's event log
fn quiet_config(dir: &Path) -> PathBuf {
    let path = dir.join("config.toml");
    std::fs::write(&path, "[general]\naudit_log = false\n").unwrap();
    path
}

mod cli_tests {
    use super::quiet_config;
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use tempfile::TempDir;

    fn remake() -> Command {
        cargo_bin_cmd!("git-annex-remote-remake")
    }

    #[test]
    fn help_displays() {
        remake()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("compute-on-demand special remote"));
    }

    #[test]
    fn version_displays() {
        remake()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("git-annex-remote-remake"));
    }

    #[test]
    fn config_path_honors_flag() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        remake()
            .args(["--config", path.to_str().unwrap(), "config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("custom.toml"));
    }

    #[test]
    fn config_show_defaults() {
        let dir = TempDir::new().unwrap();
        remake()
            .args(["--config", dir.path().join("none.toml").to_str().unwrap(), "config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[trust]"))
            .stdout(predicate::str::contains("backend = \"git\""));
    }

    #[test]
    fn config_init_then_set() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/config.toml");
        let path_str = path.to_str().unwrap();

        remake()
            .args(["--config", path_str, "config", "init"])
            .assert()
            .success();
        assert!(path.exists());

        remake()
            .args(["--config", path_str, "config", "set", "execution.timeout_secs", "90"])
            .assert()
            .success();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("timeout_secs = 90"));
    }

    #[test]
    fn config_set_unknown_key() {
        let dir = TempDir::new().unwrap();
        let config = quiet_config(dir.path());
        remake()
            .args(["--config", config.to_str().unwrap(), "config", "set", "vm.name", "x"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown config key"));
    }

    #[test]
    fn invalid_config_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[general\n").unwrap();
        remake()
            .args(["--config", path.to_str().unwrap(), "config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"));
    }

    #[test]
    fn delete_missing_worktree_fails() {
        let dir = TempDir::new().unwrap();
        let config = quiet_config(dir.path());
        remake()
            .args([
                "--config",
                config.to_str().unwrap(),
                "delete-worktree",
                dir.path().join("gone").to_str().unwrap(),
            ])
            .assert()
            .failure()
            .stderr(predicate::str::contains("resolving worktree"));
    }
}

mod protocol_tests {
    use super::quiet_config;
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use tempfile::TempDir;

    fn remote(dir: &TempDir) -> Command {
        let mut cmd = cargo_bin_cmd!("git-annex-remote-remake");
        cmd.env("REMAKE_CONFIG", quiet_config(dir.path()));
        cmd
    }

    #[test]
    fn greets_and_reports_cost() {
        let dir = TempDir::new().unwrap();
        remote(&dir)
            .write_stdin("GETCOST\n")
            .assert()
            .success()
            .stdout("VERSION 1\nCOST 500\n");
    }

    #[test]
    fn claims_reserved_scheme_only() {
        let dir = TempDir::new().unwrap();
        remote(&dir)
            .write_stdin(
                "CLAIMURL remake:///?root_version=a&specification=b&this=c\nCLAIMURL https://example.com/f\n",
            )
            .assert()
            .success()
            .stdout("VERSION 1\nCLAIMURL-SUCCESS\nCLAIMURL-FAILURE\n");
    }

    #[test]
    fn answers_unknown_requests() {
        let dir = TempDir::new().unwrap();
        remote(&dir)
            .write_stdin("EXTENSIONS INFO ASYNC\nSOMETHING NEW\nLISTCONFIGS\n")
            .assert()
            .success()
            .stdout(predicate::str::contains("EXTENSIONS\nUNSUPPORTED-REQUEST\n"))
            .stdout(predicate::str::contains("CONFIG allow_untrusted_execution"))
            .stdout(predicate::str::ends_with("CONFIGEND\n"));
    }

    #[test]
    fn store_and_remove_need_prepare() {
        let dir = TempDir::new().unwrap();
        remote(&dir)
            .write_stdin("TRANSFER STORE K1 /tmp/f\nREMOVE K1\n")
            .assert()
            .success()
            .stdout(predicate::str::contains("TRANSFER-FAILURE STORE K1"))
            .stdout(predicate::str::contains("REMOVE-FAILURE K1"));
    }

    #[test]
    fn malformed_address_fails_retrieval() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out");
        let input = format!(
            "PREPARE\nVALUE {}/.git\nVALUE true\nTRANSFER RETRIEVE K1 {}\nVALUE remake:///?root_version=a\nVALUE\n",
            dir.path().display(),
            dest.display()
        );
        remote(&dir)
            .write_stdin(input)
            .assert()
            .success()
            .stdout(predicate::str::contains("PREPARE-SUCCESS"))
            .stdout(predicate::str::contains("TRANSFER-FAILURE RETRIEVE K1 Protocol error"));
        assert!(!dest.exists());
    }
}

mod worktree_tests {
    use remake::error::{DirtyPath, DirtyState, RemakeError};
    use remake::pattern::PatternSet;
    use remake::worktree::{delete_worktree, GitTreeProvider, TreeProvider};
    use std::path::{Path, PathBuf};
    use std::process::Command;
    use tempfile::TempDir;

    fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn git(dir: &Path, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .env("GIT_AUTHOR_NAME", "Remake Test")
            .env("GIT_AUTHOR_EMAIL", "remake@example.com")
            .env("GIT_COMMITTER_NAME", "Remake Test")
            .env("GIT_COMMITTER_EMAIL", "remake@example.com")
            .env("GIT_CONFIG_COUNT", "3")
            .env("GIT_CONFIG_KEY_0", "protocol.file.allow")
            .env("GIT_CONFIG_VALUE_0", "always")
            .env("GIT_CONFIG_KEY_1", "commit.gpgsign")
            .env("GIT_CONFIG_VALUE_1", "false")
            .env("GIT_CONFIG_KEY_2", "init.defaultBranch")
            .env("GIT_CONFIG_VALUE_2", "main")
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    fn make_repo(dir: &Path, files: &[(&str, &str)], subs: &[(&Path, &str)]) {
        std::fs::create_dir_all(dir).unwrap();
        git(dir, &["init", "-q"]);
        for (name, content) in files {
            std::fs::write(dir.join(name), content).unwrap();
        }
        for (source, name) in subs {
            git(dir, &["submodule", "add", "-q", source.to_str().unwrap(), name]);
        }
        git(dir, &["add", "-A"]);
        git(dir, &["commit", "-q", "-m", "initial"]);
    }

    /// ds/{a.txt, other.dat, s0/{b.txt, s1/{c.txt, s2/{d.txt}}}}
    fn hierarchy(root: &Path) -> PathBuf {
        let sources = root.join("sources");
        make_repo(&sources.join("s2"), &[("d.txt", "d")], &[]);
        make_repo(&sources.join("s1"), &[("c.txt", "c")], &[(sources.join("s2").as_path(), "s2")]);
        make_repo(&sources.join("s0"), &[("b.txt", "b")], &[(sources.join("s1").as_path(), "s1")]);

        let dataset = root.join("ds");
        make_repo(
            &dataset,
            &[("a.txt", "a"), ("other.dat", "x")],
            &[(sources.join("s0").as_path(), "s0")],
        );
        git(&dataset, &["submodule", "update", "-q", "--init", "--recursive"]);
        dataset
    }

    fn worktree_count(repo: &Path) -> usize {
        git(repo, &["worktree", "list", "--porcelain"])
            .lines()
            .filter(|l| l.starts_with("worktree "))
            .count()
    }

    fn assert_no_registrations(dataset: &Path) {
        for repo in ["", "s0", "s0/s1", "s0/s1/s2"] {
            let repo = dataset.join(repo);
            assert_eq!(worktree_count(&repo), 1, "stale worktree in {}", repo.display());
            assert_eq!(git(&repo, &["branch", "--list", "remake-*"]), "");
        }
    }

    #[tokio::test]
    async fn provisions_only_reachable_sub_repositories() {
        if !git_available() {
            eprintln!("git not available, skipping");
            return;
        }
        let root = TempDir::new().unwrap();
        let dataset = hierarchy(root.path());
        let commit = git(&dataset, &["rev-parse", "HEAD"]);
        let provider = GitTreeProvider::new(root.path().join("worktrees"));
        let inputs = PatternSet::new(&["*.txt", "s0/*.txt", "s0/s1/*.txt"]).unwrap();

        let worktree = provider.materialize(&dataset, &commit, &inputs).await.unwrap();

        assert_eq!(worktree.sub_repositories, vec!["s0", "s0/s1"]);
        let inputs: Vec<&str> = worktree.inputs.iter().map(String::as_str).collect();
        assert_eq!(inputs, vec!["a.txt", "s0/b.txt", "s0/s1/c.txt"]);
        assert_eq!(
            std::fs::read_to_string(worktree.path.join("s0/s1/c.txt")).unwrap(),
            "c"
        );
        assert!(!worktree.path.join("s0/s1/s2/d.txt").exists());

        provider.release(&worktree).await.unwrap();

        assert!(!worktree.path.exists());
        assert_no_registrations(&dataset);
    }

    #[tokio::test]
    async fn delete_by_path_recovers_orphaned_worktree() {
        if !git_available() {
            eprintln!("git not available, skipping");
            return;
        }
        let root = TempDir::new().unwrap();
        let dataset = hierarchy(root.path());
        let commit = git(&dataset, &["rev-parse", "HEAD"]);
        let provider = GitTreeProvider::new(root.path().join("worktrees"));
        let inputs = PatternSet::new(&["**/*.txt"]).unwrap();

        let worktree = provider.materialize(&dataset, &commit, &inputs).await.unwrap();
        assert_eq!(worktree.sub_repositories, vec!["s0", "s0/s1", "s0/s1/s2"]);
        assert_eq!(worktree_count(&dataset.join("s0/s1/s2")), 2);

        delete_worktree(&worktree.path).await.unwrap();

        assert!(!worktree.path.exists());
        assert_no_registrations(&dataset);
    }

    #[tokio::test]
    async fn unclean_inputs_block_provisioning() {
        if !git_available() {
            eprintln!("git not available, skipping");
            return;
        }
        let root = TempDir::new().unwrap();
        let dataset = hierarchy(root.path());
        let commit = git(&dataset, &["rev-parse", "HEAD"]);
        let base = root.path().join("worktrees");
        let provider = GitTreeProvider::new(&base);
        let inputs = PatternSet::new(&["*.txt", "s0/*.txt"]).unwrap();

        std::fs::write(dataset.join("a.txt"), "changed").unwrap();
        std::fs::write(dataset.join("s0/new.txt"), "new").unwrap();
        std::fs::write(dataset.join("notes.md"), "not an input").unwrap();

        let err = provider
            .materialize(&dataset, &commit, &inputs)
            .await
            .unwrap_err();

        match err {
            RemakeError::UncleanSource { entries } => assert_eq!(
                entries,
                vec![
                    DirtyPath {
                        path: "a.txt".to_string(),
                        state: DirtyState::Modified,
                    },
                    DirtyPath {
                        path: "s0/new.txt".to_string(),
                        state: DirtyState::Untracked,
                    },
                ]
            ),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!base.exists());

        // Saving the changes makes the same request succeed
        git(&dataset.join("s0"), &["add", "new.txt"]);
        git(&dataset.join("s0"), &["commit", "-q", "-m", "save"]);
        git(&dataset, &["add", "-A"]);
        git(&dataset, &["commit", "-q", "-m", "save"]);
        let saved = git(&dataset, &["rev-parse", "HEAD"]);

        let worktree = provider.materialize(&dataset, &saved, &inputs).await.unwrap();
        assert!(worktree.inputs.contains("s0/new.txt"));
        provider.release(&worktree).await.unwrap();
        assert_no_registrations(&dataset);
    }
}
