//! Line-level plumbing of the special remote protocol

use crate::error::{RemakeError, RemakeResult};
use crate::events::EventSink;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{trace, warn};

/// A request from git-annex
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Extensions(Vec<String>),
    InitRemote,
    Prepare,
    TransferRetrieve { key: String, file: String },
    TransferStore { key: String, file: String },
    CheckPresent(String),
    Remove(String),
    ClaimUrl(String),
    CheckUrl(String),
    GetCost,
    GetAvailability,
    ListConfigs,
    ExportSupported,
    WhereIs(String),
    GetInfo,
    /// git-annex gave up on us
    Error(String),
    Unsupported(String),
}

impl Request {
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));

        match verb {
            "EXTENSIONS" => Self::Extensions(rest.split_whitespace().map(String::from).collect()),
            "INITREMOTE" => Self::InitRemote,
            "PREPARE" => Self::Prepare,
            "TRANSFER" => {
                let mut parts = rest.splitn(3, ' ');
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(direction), Some(key), Some(file)) if !key.is_empty() && !file.is_empty() => {
                        let (key, file) = (key.to_string(), file.to_string());
                        match direction {
                            "RETRIEVE" => Self::TransferRetrieve { key, file },
                            "STORE" => Self::TransferStore { key, file },
                            _ => Self::Unsupported(line.to_string()),
                        }
                    }
                    _ => Self::Unsupported(line.to_string()),
                }
            }
            "CHECKPRESENT" if !rest.is_empty() => Self::CheckPresent(rest.to_string()),
            "REMOVE" if !rest.is_empty() => Self::Remove(rest.to_string()),
            "CLAIMURL" if !rest.is_empty() => Self::ClaimUrl(rest.to_string()),
            "CHECKURL" if !rest.is_empty() => Self::CheckUrl(rest.to_string()),
            "GETCOST" => Self::GetCost,
            "GETAVAILABILITY" => Self::GetAvailability,
            "LISTCONFIGS" => Self::ListConfigs,
            "EXPORTSUPPORTED" => Self::ExportSupported,
            "WHEREIS" if !rest.is_empty() => Self::WhereIs(rest.to_string()),
            "GETINFO" => Self::GetInfo,
            "ERROR" => Self::Error(rest.to_string()),
            _ => Self::Unsupported(line.to_string()),
        }
    }
}

/// Collapse a message onto one protocol line
pub fn single_line(message: &str) -> String {
    message.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Shared, line-oriented writer to git-annex
pub struct AnnexWriter<W> {
    inner: Arc<Mutex<W>>,
}

impl<W> Clone for AnnexWriter<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W: AsyncWrite + Unpin + Send> AnnexWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    /// Write one line and flush it
    pub async fn send(&self, line: &str) -> RemakeResult<()> {
        trace!("-> {}", line);
        let mut writer = self.inner.lock().await;
        writer
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .map_err(|e| RemakeError::io("writing to git-annex", e))?;
        writer
            .flush()
            .await
            .map_err(|e| RemakeError::io("flushing output to git-annex", e))
    }
}

/// Mirrors pipeline events into git-annex's debug output
pub struct AnnexDebugSink<W> {
    writer: AnnexWriter<W>,
}

impl<W> AnnexDebugSink<W> {
    pub fn new(writer: AnnexWriter<W>) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> EventSink for AnnexDebugSink<W> {
    async fn record(&self, event: &str, data: &Value) {
        let line = single_line(&format!("DEBUG {} {}", event, data));
        if let Err(e) = self.writer.send(&line).await {
            warn!("Failed to send debug line: {}", e);
        }
    }
}

/// Bidirectional protocol channel
pub struct Channel<R, W> {
    reader: R,
    writer: AnnexWriter<W>,
}

impl<R, W> Channel<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: AnnexWriter<W>) -> Self {
        Self { reader, writer }
    }

    pub fn writer(&self) -> &AnnexWriter<W> {
        &self.writer
    }

    pub async fn send(&self, line: &str) -> RemakeResult<()> {
        self.writer.send(line).await
    }

    /// Next line from git-annex, `None` at end of input
    pub async fn read_line(&mut self) -> RemakeResult<Option<String>> {
        let mut line = String::new();
        let read = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(|e| RemakeError::io("reading from git-annex", e))?;
        if read == 0 {
            return Ok(None);
        }
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        trace!("<- {}", line);
        Ok(Some(line))
    }

    /// Send a query and return the payload of its `VALUE` reply
    pub async fn query(&mut self, line: &str) -> RemakeResult<String> {
        self.send(line).await?;
        self.read_value(line).await
    }

    async fn read_value(&mut self, query: &str) -> RemakeResult<String> {
        let reply = self
            .read_line()
            .await?
            .ok_or_else(|| RemakeError::protocol(format!("input closed while waiting for reply to {}", query)))?;
        if reply == "VALUE" {
            return Ok(String::new());
        }
        match reply.strip_prefix("VALUE ") {
            Some(value) => Ok(value.to_string()),
            None => Err(RemakeError::protocol(format!(
                "expected VALUE reply to {}, got {}",
                query, reply
            ))),
        }
    }

    /// Value of a remote configuration setting, empty when unset
    pub async fn get_config(&mut self, name: &str) -> RemakeResult<String> {
        self.query(&format!("GETCONFIG {}", name)).await
    }

    /// Path of the repository's git directory
    pub async fn get_git_dir(&mut self) -> RemakeResult<String> {
        self.query("GETGITDIR").await
    }

    /// URLs recorded for `key` that start with `prefix`
    ///
    /// git-annex answers with one `VALUE` per URL and an empty `VALUE` last.
    pub async fn get_urls(&mut self, key: &str, prefix: &str) -> RemakeResult<Vec<String>> {
        let query = format!("GETURLS {} {}", key, prefix);
        self.send(&query).await?;

        let mut urls = Vec::new();
        loop {
            let value = self.read_value(&query).await?;
            if value.is_empty() {
                return Ok(urls);
            }
            urls.push(value);
        }
    }
}
