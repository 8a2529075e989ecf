//! Structured retrieval events
//!
//! Every pipeline component reports what it did through an injected
//! [`EventSink`]. The file-backed [`AuditLog`] writes JSON lines to
//! `~/.local/state/remake/events.log`; [`TracingSink`] forwards to the
//! `tracing` subscriber. Recording an event never fails the caller.

use crate::config::{schema::Config, ConfigManager};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

/// Receiver of structured pipeline events
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Record a named event with structured data
    async fn record(&self, event: &str, data: &Value);
}

/// File-based event logger that appends JSON lines
pub struct AuditLog {
    enabled: bool,
    path: PathBuf,
}

impl AuditLog {
    /// Create a new event logger from config
    pub fn new(config: &Config) -> Self {
        Self {
            enabled: config.general.audit_log,
            path: ConfigManager::audit_log_path(),
        }
    }

    async fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl EventSink for AuditLog {
    async fn record(&self, event: &str, data: &Value) {
        if !self.enabled {
            return;
        }

        let entry = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "pid": std::process::id(),
            "event": event,
            "data": data,
        });

        let mut line = match serde_json::to_string(&entry) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to serialize event: {}", e);
                return;
            }
        };
        line.push('\n');

        if let Err(e) = self.append(&line).await {
            warn!("Failed to write event log: {}", e);
        }
    }
}

/// Forwards events to the `tracing` subscriber
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    async fn record(&self, event: &str, data: &Value) {
        if event == "verification.bypassed" {
            warn!(event, %data, "executing without signature verification");
        } else {
            info!(event, %data);
        }
    }
}

/// Delivers every event to each contained sink in order
pub struct Fanout(pub Vec<Arc<dyn EventSink>>);

#[async_trait]
impl EventSink for Fanout {
    async fn record(&self, event: &str, data: &Value) {
        for sink in &self.0 {
            sink.record(event, data).await;
        }
    }
}

/// Keeps events in memory
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<(String, Value)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of all recorded events, oldest first
    pub fn names(&self) -> Vec<String> {
        self.events
            .lock()
            .map(|events| events.iter().map(|(name, _)| name.clone()).collect())
            .unwrap_or_default()
    }

    /// Data of every event with the given name
    pub fn data_of(&self, name: &str) -> Vec<Value> {
        self.events
            .lock()
            .map(|events| {
                events
                    .iter()
                    .filter(|(n, _)| n == name)
                    .map(|(_, d)| d.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn record(&self, event: &str, data: &Value) {
        if let Ok(mut events) = self.events.lock() {
            events.push((event.to_string(), data.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_audit_log(dir: &TempDir, enabled: bool) -> AuditLog {
        AuditLog {
            enabled,
            path: dir.path().join("events.log"),
        }
    }

    #[tokio::test]
    async fn writes_json_line() {
        let dir = TempDir::new().unwrap();
        let audit = test_audit_log(&dir, true);

        audit
            .record(
                "retrieve.started",
                &serde_json::json!({"key": "MD5E-s4--abc.txt"}),
            )
            .await;

        let content = tokio::fs::read_to_string(&audit.path).await.unwrap();
        let parsed: Value = serde_json::from_str(content.trim()).unwrap();

        assert_eq!(parsed["event"], "retrieve.started");
        assert_eq!(parsed["data"]["key"], "MD5E-s4--abc.txt");
        assert!(parsed["timestamp"].is_string());
    }

    #[tokio::test]
    async fn appends_multiple_lines() {
        let dir = TempDir::new().unwrap();
        let audit = test_audit_log(&dir, true);

        audit.record("event.one", &serde_json::json!({})).await;
        audit.record("event.two", &serde_json::json!({})).await;

        let content = tokio::fs::read_to_string(&audit.path).await.unwrap();
        let lines: Vec<&str> = content.trim().lines().collect();
        assert_eq!(lines.len(), 2);
    }

    #[tokio::test]
    async fn skips_when_disabled() {
        let dir = TempDir::new().unwrap();
        let audit = test_audit_log(&dir, false);

        audit.record("should.not.appear", &serde_json::json!({})).await;

        assert!(!audit.path.exists());
    }

    #[tokio::test]
    async fn fanout_reaches_every_sink() {
        let first = Arc::new(MemorySink::new());
        let second = Arc::new(MemorySink::new());
        let fanout = Fanout(vec![first.clone(), second.clone()]);

        fanout.record("x", &serde_json::json!({"n": 1})).await;

        assert_eq!(first.names(), vec!["x"]);
        assert_eq!(second.data_of("x")[0]["n"], 1);
    }
}
