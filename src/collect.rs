//! Result collection
//!
//! After a method ran, the requested output is copied to the caller's
//! destination. Every other declared output that is already tracked under
//! content addressing in its owning repository gets the fresh bytes
//! reinjected, so a later retrieval of it finds the content realized.

use crate::error::{RemakeError, RemakeResult};
use crate::events::EventSink;
use crate::pattern::{resolve_pattern_set, PatternSet};
use crate::store::{owning_repository, VersionStore};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// What happened to the outputs of one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectReport {
    /// Outputs whose content was reinjected, relative to the dataset root
    pub reinjected: Vec<String>,
    /// Outputs that were not tracked under content addressing
    pub skipped: Vec<String>,
    /// Outputs whose reinjection failed
    pub failed: Vec<String>,
}

/// Collects outputs from a finished worktree
pub struct Collector<'a> {
    store: &'a dyn VersionStore,
    events: &'a dyn EventSink,
}

impl<'a> Collector<'a> {
    pub fn new(store: &'a dyn VersionStore, events: &'a dyn EventSink) -> Self {
        Self { store, events }
    }

    /// Deliver `requested` to `destination` and reinject the other outputs into `dataset`
    pub async fn collect(
        &self,
        worktree: &Path,
        outputs: &PatternSet,
        requested: &str,
        dataset: &Path,
        destination: &Path,
    ) -> RemakeResult<CollectReport> {
        let produced = resolve_pattern_set(worktree, outputs)?;
        debug!("Method produced {} declared outputs", produced.len());

        // Only a declared output found inside the worktree may be delivered
        if !produced.contains(requested) {
            return Err(RemakeError::MissingOutput {
                path: requested.to_string(),
            });
        }
        let requested_path = worktree.join(requested);

        let mut report = CollectReport::default();
        for output in produced.iter().filter(|o| o.as_str() != requested) {
            self.reinject(worktree, dataset, output, &mut report).await;
        }

        copy_file(&requested_path, destination).await?;
        Ok(report)
    }

    async fn reinject(&self, worktree: &Path, dataset: &Path, output: &str, report: &mut CollectReport) {
        let (repository, path) = owning_repository(dataset, output);
        let source = worktree.join(output);

        match self.store.annex_key(&repository, &path).await {
            Ok(Some(key)) => match self.store.reinject(&repository, &source, &path).await {
                Ok(()) => {
                    self.events
                        .record("output.reinjected", &json!({ "path": output, "key": key }))
                        .await;
                    report.reinjected.push(output.to_string());
                }
                Err(e) => {
                    warn!("Could not reinject {}: {}", output, e);
                    self.events
                        .record(
                            "output.reinject_failed",
                            &json!({ "path": output, "key": key, "reason": e.to_string() }),
                        )
                        .await;
                    report.failed.push(output.to_string());
                }
            },
            Ok(None) => {
                self.events
                    .record("output.skipped", &json!({ "path": output }))
                    .await;
                report.skipped.push(output.to_string());
            }
            Err(e) => {
                warn!("Could not look up {}: {}", output, e);
                report.failed.push(output.to_string());
            }
        }
    }
}

/// Copy a file, creating the destination's parent directory
pub(crate) async fn copy_file(source: &Path, destination: &Path) -> RemakeResult<()> {
    if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| RemakeError::io(format!("creating {}", parent.display()), e))?;
    }
    tokio::fs::copy(source, destination).await.map_err(|e| {
        RemakeError::io(
            format!("copying {} to {}", source.display(), destination.display()),
            e,
        )
    })?;
    Ok(())
}

/// Absolute form of a caller-supplied destination
pub(crate) fn absolute_destination(destination: &Path) -> RemakeResult<PathBuf> {
    if destination.is_absolute() {
        return Ok(destination.to_path_buf());
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(destination))
        .map_err(|e| RemakeError::io("getting current directory", e))
}
