//! Trusted key loading

use crate::config::schema::TrustConfig;
use crate::store::Git;
use std::path::Path;
use tracing::debug;

use super::TrustedKeySet;

/// Collect trusted key ids from the configuration file and git config
///
/// The git config variable holds comma-separated ids; an unset variable or
/// a directory outside any repository contributes nothing.
pub async fn load_trusted_keys(config: &TrustConfig, repo: &Path) -> TrustedKeySet {
    let mut ids: Vec<String> = config.trusted_keys.clone();

    if !config.git_config_key.is_empty() && repo.is_dir() {
        match Git::new(repo)
            .run(&["config", "--get", &config.git_config_key])
            .await
        {
            Ok(value) => ids.extend(value.split(',').map(|s| s.trim().to_string())),
            Err(e) => debug!("No trusted keys in git config: {}", e),
        }
    }

    let set = TrustedKeySet::new(ids);
    debug!("Loaded {} trusted keys", set.len());
    set
}
