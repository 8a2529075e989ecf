//! Trust backed by detached ed25519 signatures
//!
//! The signature for `<path>` lives in `<path>.sig` at the same commit:
//!
//! ```json
//! { "key": "<hex public key>", "signature": "<hex signature over the file bytes>" }
//! ```
//!
//! A key's identity is the hex SHA-256 of its public key bytes.

use crate::error::{RemakeError, RemakeResult};
use crate::store::VersionStore;
use async_trait::async_trait;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use super::{SignedFile, TrustVerifier, TrustedKeySet};

/// Suffix appended to a file path to find its detached signature
pub const SIGNATURE_SUFFIX: &str = ".sig";

/// On-disk detached signature document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetachedSignature {
    /// Hex-encoded 32-byte public key
    pub key: String,
    /// Hex-encoded 64-byte signature
    pub signature: String,
}

/// Identity of a verifying key
pub fn key_id(key: &VerifyingKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.to_bytes());
    hex::encode(hasher.finalize())
}

/// Verifies `<file>.sig` documents read from the store
pub struct DetachedSignatureVerifier {
    store: Arc<dyn VersionStore>,
}

impl DetachedSignatureVerifier {
    pub fn new(store: Arc<dyn VersionStore>) -> Self {
        Self { store }
    }
}

fn check_signature(
    path: &str,
    document: &[u8],
    content: &[u8],
    trusted: &TrustedKeySet,
) -> RemakeResult<String> {
    let fail = |reason: String| RemakeError::verification(path, reason);

    let detached: DetachedSignature = serde_json::from_slice(document)
        .map_err(|e| fail(format!("malformed signature document: {}", e)))?;

    let key_bytes: [u8; 32] = hex::decode(&detached.key)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| fail("public key must be 32 hex-encoded bytes".to_string()))?;
    let key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|_| fail("invalid public key".to_string()))?;

    let id = key_id(&key);
    if !trusted.contains(&id) {
        return Err(fail(format!("signed by untrusted key {}", id)));
    }

    let signature_bytes = hex::decode(&detached.signature)
        .map_err(|_| fail("signature is not hex-encoded".to_string()))?;
    let signature = Signature::from_slice(&signature_bytes)
        .map_err(|_| fail("signature must be 64 bytes".to_string()))?;

    key.verify(content, &signature)
        .map_err(|_| fail("signature does not match content".to_string()))?;

    Ok(id)
}

#[async_trait]
impl TrustVerifier for DetachedSignatureVerifier {
    async fn verify(&self, file: SignedFile<'_>, trusted: &TrustedKeySet) -> RemakeResult<String> {
        let signature_path = format!("{}{}", file.path, SIGNATURE_SUFFIX);
        let document = self
            .store
            .read_at(file.repo, file.commit, &signature_path)
            .await?
            .ok_or_else(|| RemakeError::verification(file.path, "missing signature"))?;

        check_signature(file.path, &document, file.content, trusted)
    }

    fn backend_name(&self) -> &'static str {
        "ed25519"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ed25519_dalek::{Signer, SigningKey};
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};

    /// Serves recorded files from memory
    struct RecordedFiles(HashMap<String, Vec<u8>>);

    #[async_trait]
    impl VersionStore for RecordedFiles {
        async fn has_commit(&self, _: &Path, _: &str) -> RemakeResult<bool> {
            Ok(true)
        }
        async fn read_at(&self, _: &Path, _: &str, path: &str) -> RemakeResult<Option<Vec<u8>>> {
            Ok(self.0.get(path).cloned())
        }
        async fn annex_key(&self, _: &Path, _: &str) -> RemakeResult<Option<String>> {
            Ok(None)
        }
        async fn content_location(&self, _: &Path, _: &str) -> RemakeResult<Option<PathBuf>> {
            Ok(None)
        }
        async fn reinject(&self, _: &Path, _: &Path, _: &str) -> RemakeResult<()> {
            Ok(())
        }
    }

    fn signed_file(path: &str) -> SignedFile<'_> {
        SignedFile {
            repo: Path::new("/ds"),
            commit: "c0ffee",
            path,
            content: CONTENT,
        }
    }

    const CONTENT: &[u8] = br#"{"method":"m","input":[],"output":["a.txt"],"parameter":{}}"#;

    fn sign(seed: u8, content: &[u8]) -> (String, Vec<u8>) {
        let signing = SigningKey::from_bytes(&[seed; 32]);
        let document = DetachedSignature {
            key: hex::encode(signing.verifying_key().to_bytes()),
            signature: hex::encode(signing.sign(content).to_bytes()),
        };
        (
            key_id(&signing.verifying_key()),
            serde_json::to_vec(&document).unwrap(),
        )
    }

    #[test]
    fn accepts_trusted_signature() {
        let (id, document) = sign(7, CONTENT);
        let trusted = TrustedKeySet::new([id.clone()]);
        assert_eq!(
            check_signature("spec", &document, CONTENT, &trusted)
                .unwrap()
                .to_ascii_uppercase(),
            id.to_ascii_uppercase()
        );
    }

    #[test]
    fn rejects_untrusted_signer() {
        let (_, document) = sign(7, CONTENT);
        let (other, _) = sign(8, CONTENT);
        let err = check_signature("spec", &document, CONTENT, &TrustedKeySet::new([other]))
            .unwrap_err();
        assert!(err.to_string().contains("untrusted key"));
    }

    #[test]
    fn rejects_modified_content() {
        let (id, document) = sign(7, CONTENT);
        let err = check_signature("spec", &document, b"tampered", &TrustedKeySet::new([id]))
            .unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn rejects_malformed_document() {
        let trusted = TrustedKeySet::new(["x"]);
        let err = check_signature("spec", b"not json", CONTENT, &trusted).unwrap_err();
        assert!(matches!(err, RemakeError::Verification { .. }));

        let short_key = br#"{"key":"abcd","signature":"00"}"#;
        assert!(check_signature("spec", short_key, CONTENT, &trusted).is_err());
    }

    #[tokio::test]
    async fn verifier_reads_signature_next_to_file() {
        let (id, document) = sign(7, CONTENT);
        let mut files = HashMap::new();
        files.insert(".remake/specifications/s.sig".to_string(), document);
        let verifier = DetachedSignatureVerifier::new(Arc::new(RecordedFiles(files)));
        let trusted = TrustedKeySet::new([id.clone()]);

        let signer = verifier
            .verify(signed_file(".remake/specifications/s"), &trusted)
            .await
            .unwrap();
        assert_eq!(signer.to_ascii_uppercase(), id.to_ascii_uppercase());
    }

    #[tokio::test]
    async fn missing_signature_file_is_rejected() {
        let (id, _) = sign(7, CONTENT);
        let verifier = DetachedSignatureVerifier::new(Arc::new(RecordedFiles(HashMap::new())));

        let err = verifier
            .verify(signed_file(".remake/specifications/s"), &TrustedKeySet::new([id]))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RemakeError::Verification { ref path, ref reason }
                if path == ".remake/specifications/s" && reason == "missing signature"
        ));
    }
}
