//! Trust backed by signed commits
//!
//! The commit that last changed the file (as of the recorded commit) must
//! carry a good signature, and the signing key must be trusted. The commit
//! signature covers the whole tree, so the file content is implicitly
//! covered as well.

use crate::error::{RemakeError, RemakeResult};
use crate::store::Git;
use async_trait::async_trait;
use tracing::debug;

use super::{SignedFile, TrustVerifier, TrustedKeySet};

/// Verifies files through `git verify-commit`
#[derive(Debug, Default)]
pub struct GitCommitVerifier;

impl GitCommitVerifier {
    pub fn new() -> Self {
        Self
    }
}

/// Key ids and fingerprints reported by a successful `--raw` verification
pub(crate) fn signer_ids(status: &str) -> Vec<String> {
    let mut ids = Vec::new();
    for line in status.lines() {
        let mut fields = line.split_whitespace();
        if fields.next() != Some("[GNUPG:]") {
            continue;
        }
        match fields.next() {
            // VALIDSIG <fingerprint> ... <primary key fingerprint>
            Some("VALIDSIG") => {
                let rest: Vec<&str> = fields.collect();
                if let Some(fpr) = rest.first() {
                    ids.push((*fpr).to_string());
                }
                if let Some(primary) = rest.last().filter(|p| p.len() >= 16) {
                    ids.push((*primary).to_string());
                }
            }
            Some("GOODSIG") => {
                if let Some(key_id) = fields.next() {
                    ids.push(key_id.to_string());
                }
            }
            _ => {}
        }
    }
    ids
}

#[async_trait]
impl TrustVerifier for GitCommitVerifier {
    async fn verify(&self, file: SignedFile<'_>, trusted: &TrustedKeySet) -> RemakeResult<String> {
        let git = Git::new(file.repo);
        let commit = git
            .run(&["log", "-1", "--format=%H", file.commit, "--", file.path])
            .await
            .map_err(|e| RemakeError::verification(file.path, e.to_string()))?;
        if commit.is_empty() {
            return Err(RemakeError::verification(
                file.path,
                format!("no commit records the file at {}", file.commit),
            ));
        }

        let output = git.output(&["verify-commit", "--raw", &commit]).await?;
        let status = String::from_utf8_lossy(&output.stderr);
        debug!("verify-commit {}: {}", commit, status.trim());

        if !output.status.success() {
            return Err(RemakeError::verification(
                file.path,
                format!("commit {} has no valid signature", commit),
            ));
        }

        signer_ids(&status)
            .into_iter()
            .find(|id| trusted.contains(id))
            .ok_or_else(|| {
                RemakeError::verification(
                    file.path,
                    format!("commit {} is not signed by a trusted key", commit),
                )
            })
    }

    fn backend_name(&self) -> &'static str {
        "git"
    }
}
