//! Recipe trust decisions
//!
//! A recipe (its specification and its method template) may only run when a
//! signature over it verifies against a key from the [`TrustedKeySet`].
//! Verification fails closed: a missing signature, an unknown signer or a
//! signature that does not cover the content all abort the retrieval before
//! anything executes. The only way around it is the explicit
//! [`TrustDecision::Bypass`], which is reported as an insecure event.

mod ed25519;
mod git;
mod keys;

pub use ed25519::{key_id, DetachedSignature, DetachedSignatureVerifier, SIGNATURE_SUFFIX};
pub use git::GitCommitVerifier;
pub use keys::load_trusted_keys;

use crate::config::TrustBackend;
use crate::error::RemakeResult;
use crate::events::EventSink;
use crate::store::VersionStore;
use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// Minimum length of a key id that may match a longer fingerprint by suffix
const MIN_SUFFIX_LEN: usize = 16;

/// Identities allowed to authorize execution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustedKeySet {
    ids: BTreeSet<String>,
}

impl TrustedKeySet {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            ids: ids
                .into_iter()
                .map(|id| id.as_ref().trim().to_ascii_uppercase())
                .filter(|id| !id.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether `id` (a key id or full fingerprint) belongs to a trusted key
    ///
    /// A configured long key id accepts any reported fingerprint ending in
    /// it. A configured fingerprint accepts only that exact fingerprint.
    pub fn contains(&self, id: &str) -> bool {
        let id = id.trim().to_ascii_uppercase();
        if id.is_empty() {
            return false;
        }
        self.ids.iter().any(|trusted| {
            *trusted == id
                || (trusted.len() >= MIN_SUFFIX_LEN && id.ends_with(trusted.as_str()))
        })
    }
}

/// Whether signatures are checked for this session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustDecision {
    /// Check signatures against these keys
    Verify(TrustedKeySet),
    /// Untrusted execution was explicitly allowed; nothing is checked
    Bypass,
}

/// A file submitted for verification, as recorded in a commit
#[derive(Debug, Clone, Copy)]
pub struct SignedFile<'a> {
    /// Repository that records the file
    pub repo: &'a Path,
    pub commit: &'a str,
    /// Repository-relative path
    pub path: &'a str,
    pub content: &'a [u8],
}

/// Signature check capability
#[async_trait]
pub trait TrustVerifier: Send + Sync {
    /// Verify the file's signature, returning the id of the trusted signer
    async fn verify(&self, file: SignedFile<'_>, trusted: &TrustedKeySet) -> RemakeResult<String>;

    /// Human-readable backend name
    fn backend_name(&self) -> &'static str;
}

/// Create the verifier for the configured backend
pub fn create_verifier(backend: TrustBackend, store: Arc<dyn VersionStore>) -> Arc<dyn TrustVerifier> {
    match backend {
        TrustBackend::Git => Arc::new(GitCommitVerifier::new()),
        TrustBackend::Ed25519 => Arc::new(DetachedSignatureVerifier::new(store)),
    }
}

/// Apply the session's trust decision to one file
pub async fn authorize(
    verifier: &dyn TrustVerifier,
    decision: &TrustDecision,
    file: SignedFile<'_>,
    events: &dyn EventSink,
) -> RemakeResult<()> {
    match decision {
        TrustDecision::Bypass => {
            warn!("Executing {} without signature verification", file.path);
            events
                .record(
                    "verification.bypassed",
                    &json!({ "path": file.path, "commit": file.commit }),
                )
                .await;
            Ok(())
        }
        TrustDecision::Verify(trusted) => match verifier.verify(file, trusted).await {
            Ok(signer) => {
                events
                    .record(
                        "verification.passed",
                        &json!({
                            "path": file.path,
                            "commit": file.commit,
                            "signer": signer,
                            "backend": verifier.backend_name(),
                        }),
                    )
                    .await;
                Ok(())
            }
            Err(e) => {
                events
                    .record(
                        "verification.failed",
                        &json!({ "path": file.path, "reason": e.to_string() }),
                    )
                    .await;
                Err(e)
            }
        },
    }
}
