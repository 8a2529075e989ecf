//! git-annex external special remote protocol
//!
//! One [`Session`] serves one git-annex process, one request at a time.
//! The only state carried between requests is what `PREPARE` establishes:
//! the trust decision and where the requesting repository lives.

mod channel;

pub use channel::{single_line, AnnexDebugSink, AnnexWriter, Channel, Request};

use crate::address::{is_claimed, Address, URL_PREFIX};
use crate::config::schema::Config;
use crate::collect::absolute_destination;
use crate::error::{RemakeError, RemakeResult};
use crate::events::{EventSink, Fanout};
use crate::execute::Executor;
use crate::pipeline::{Retrieved, Retriever, RetrieverParts};
use crate::store::GitAnnexStore;
use crate::trust::{create_verifier, load_trusted_keys, TrustDecision};
use crate::worktree::GitTreeProvider;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tracing::{debug, error, info, warn};

/// Protocol version spoken by this remote
pub const PROTOCOL_VERSION: u32 = 1;

/// Relative cost reported to git-annex; computing is expensive
pub const COST: u32 = 500;

/// Remote setting that disables signature verification
pub const ALLOW_UNTRUSTED: &str = "allow_untrusted_execution";

/// Builds the retriever once `PREPARE` has settled the trust decision
pub type Assembler =
    Box<dyn Fn(&Config, TrustDecision, Arc<dyn EventSink>) -> Retriever + Send + Sync>;

/// Retriever wired to git, git-annex and the configured trust backend
pub fn assemble_default(config: &Config, trust: TrustDecision, events: Arc<dyn EventSink>) -> Retriever {
    let store = Arc::new(GitAnnexStore::new());
    let base_dir = config.worktree.base_dir();
    Retriever::new(RetrieverParts {
        verifier: create_verifier(config.trust.backend, store.clone()),
        store,
        trees: Arc::new(GitTreeProvider::new(base_dir.clone())),
        executor: Executor::new(&config.execution),
        events,
        trust,
        search_boundary: config.dataset.search_boundary.clone(),
        scratch_dir: base_dir,
    })
}

/// Interpret an `allow_untrusted_execution` value
pub fn allows_untrusted(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "yes" | "on" | "1"
    )
}

/// Repository root for a git directory reported by git-annex
fn repository_root(git_dir: &Path) -> PathBuf {
    if git_dir.file_name().is_some_and(|name| name == ".git") {
        git_dir.parent().map(Path::to_path_buf).unwrap_or_else(|| git_dir.to_path_buf())
    } else {
        git_dir.to_path_buf()
    }
}

enum Flow {
    Continue,
    Stop,
}

struct Prepared {
    retriever: Retriever,
    repository: PathBuf,
}

/// Protocol state machine over one channel
pub struct Session<R, W> {
    channel: Channel<R, W>,
    config: Config,
    events: Arc<dyn EventSink>,
    assemble: Assembler,
    prepared: Option<Prepared>,
}

impl<R, W> Session<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Session with the default collaborators; `events` receives every pipeline event
    pub fn new(reader: R, writer: W, config: Config, events: Arc<dyn EventSink>) -> Self {
        Self::with_assembler(reader, writer, config, events, Box::new(assemble_default))
    }

    pub fn with_assembler(
        reader: R,
        writer: W,
        config: Config,
        events: Arc<dyn EventSink>,
        assemble: Assembler,
    ) -> Self {
        Self {
            channel: Channel::new(reader, AnnexWriter::new(writer)),
            config,
            events,
            assemble,
            prepared: None,
        }
    }

    /// Serve requests until git-annex closes the channel
    pub async fn run(mut self) -> RemakeResult<()> {
        self.channel
            .send(&format!("VERSION {}", PROTOCOL_VERSION))
            .await?;

        while let Some(line) = self.channel.read_line().await? {
            if line.is_empty() {
                continue;
            }
            match self.handle(Request::parse(&line)).await? {
                Flow::Continue => {}
                Flow::Stop => break,
            }
        }
        debug!("git-annex closed the protocol channel");
        Ok(())
    }

    async fn handle(&mut self, request: Request) -> RemakeResult<Flow> {
        let reply = match request {
            Request::Extensions(offered) => {
                debug!("git-annex offers extensions: {:?}", offered);
                "EXTENSIONS".to_string()
            }
            Request::InitRemote => "INITREMOTE-SUCCESS".to_string(),
            Request::Prepare => match self.prepare().await {
                Ok(()) => "PREPARE-SUCCESS".to_string(),
                Err(e @ RemakeError::Protocol(_)) => return Err(e),
                Err(e) => format!("PREPARE-FAILURE {}", single_line(&e.to_string())),
            },
            Request::TransferRetrieve { key, file } => {
                let outcome = if self.prepared.is_some() {
                    // A broken reply desynchronizes the channel and ends the session
                    let urls = self.addresses(&key).await?;
                    self.transfer_retrieve(&key, &urls, Path::new(&file)).await
                } else {
                    Err(RemakeError::protocol("remote is not prepared"))
                };
                match outcome {
                    Ok(()) => format!("TRANSFER-SUCCESS RETRIEVE {}", key),
                    Err(e) => {
                        error!("Retrieving {} failed: {}", key, e);
                        format!("TRANSFER-FAILURE RETRIEVE {} {}", key, single_line(&e.to_string()))
                    }
                }
            }
            Request::TransferStore { key, .. } => {
                debug!("Ignoring store of {}", key);
                if self.prepared.is_some() {
                    format!("TRANSFER-SUCCESS STORE {}", key)
                } else {
                    format!("TRANSFER-FAILURE STORE {} remote is not prepared", key)
                }
            }
            Request::CheckPresent(key) => match self.check_present(&key).await {
                Ok(true) => format!("CHECKPRESENT-SUCCESS {}", key),
                Ok(false) => format!("CHECKPRESENT-FAILURE {}", key),
                Err(e @ RemakeError::Protocol(_)) if self.prepared.is_some() => return Err(e),
                Err(e) => format!("CHECKPRESENT-UNKNOWN {} {}", key, single_line(&e.to_string())),
            },
            Request::Remove(key) => {
                if self.prepared.is_some() {
                    format!("REMOVE-SUCCESS {}", key)
                } else {
                    format!("REMOVE-FAILURE {} remote is not prepared", key)
                }
            }
            Request::ClaimUrl(url) => {
                if is_claimed(&url) {
                    "CLAIMURL-SUCCESS".to_string()
                } else {
                    "CLAIMURL-FAILURE".to_string()
                }
            }
            Request::CheckUrl(url) => {
                if is_claimed(&url) {
                    "CHECKURL-CONTENTS UNKNOWN".to_string()
                } else {
                    "CHECKURL-FAILURE".to_string()
                }
            }
            Request::GetCost => format!("COST {}", COST),
            Request::GetAvailability => "AVAILABILITY LOCAL".to_string(),
            Request::ListConfigs => {
                self.channel
                    .send(&format!(
                        "CONFIG {} run recipes without signature verification (dangerous)",
                        ALLOW_UNTRUSTED
                    ))
                    .await?;
                "CONFIGEND".to_string()
            }
            Request::ExportSupported => "EXPORTSUPPORTED-FAILURE".to_string(),
            Request::WhereIs(_) => "WHEREIS-FAILURE".to_string(),
            Request::GetInfo => {
                for (field, value) in self.info() {
                    self.channel.send(&format!("INFOFIELD {}", field)).await?;
                    self.channel.send(&format!("INFOVALUE {}", value)).await?;
                }
                "INFOEND".to_string()
            }
            Request::Error(message) => {
                error!("git-annex reported an error: {}", message);
                return Ok(Flow::Stop);
            }
            Request::Unsupported(line) => {
                debug!("Unsupported request: {}", line);
                "UNSUPPORTED-REQUEST".to_string()
            }
        };

        self.channel.send(&reply).await?;
        Ok(Flow::Continue)
    }

    fn info(&self) -> Vec<(&'static str, String)> {
        let verification = match self.prepared.as_ref().map(|p| p.retriever.trust()) {
            Some(TrustDecision::Bypass) => "disabled".to_string(),
            Some(TrustDecision::Verify(keys)) => format!("{} trusted keys", keys.len()),
            None => "not prepared".to_string(),
        };
        vec![
            ("trust backend", format!("{:?}", self.config.trust.backend).to_lowercase()),
            ("signature verification", verification),
            ("worktree directory", self.config.worktree.base_dir().display().to_string()),
        ]
    }

    async fn prepare(&mut self) -> RemakeResult<()> {
        let git_dir = self.channel.get_git_dir().await?;
        let repository = if git_dir.is_empty() {
            std::env::current_dir().map_err(|e| RemakeError::io("getting current directory", e))?
        } else {
            repository_root(Path::new(&git_dir))
        };

        let trust = if allows_untrusted(&self.channel.get_config(ALLOW_UNTRUSTED).await?) {
            warn!("Signature verification is disabled for this remote");
            TrustDecision::Bypass
        } else {
            TrustDecision::Verify(load_trusted_keys(&self.config.trust, &repository).await)
        };

        let sinks: Vec<Arc<dyn EventSink>> = vec![
            self.events.clone(),
            Arc::new(AnnexDebugSink::new(self.channel.writer().clone())),
        ];
        let events: Arc<dyn EventSink> = Arc::new(Fanout(sinks));
        let retriever = (self.assemble)(&self.config, trust, events);

        info!("Prepared remote for {}", repository.display());
        self.prepared = Some(Prepared {
            retriever,
            repository,
        });
        Ok(())
    }

    async fn addresses(&mut self, key: &str) -> RemakeResult<Vec<String>> {
        self.channel.get_urls(key, URL_PREFIX).await
    }

    async fn check_present(&mut self, key: &str) -> RemakeResult<bool> {
        if self.prepared.is_none() {
            return Err(RemakeError::protocol("remote is not prepared"));
        }
        Ok(!self.addresses(key).await?.is_empty())
    }

    /// Run the pipeline for the first recorded address of `key`
    async fn transfer_retrieve(&self, key: &str, urls: &[String], file: &Path) -> RemakeResult<()> {
        let url = urls
            .first()
            .ok_or_else(|| RemakeError::protocol(format!("no {} address recorded for {}", URL_PREFIX, key)))?;
        let address = Address::parse(url)?;
        let destination = absolute_destination(file)?;

        let prepared = self
            .prepared
            .as_ref()
            .ok_or_else(|| RemakeError::Internal("prepared state vanished".to_string()))?;
        match prepared
            .retriever
            .retrieve(key, &address, &prepared.repository, &destination)
            .await?
        {
            Retrieved::Computed(report) => info!(
                "Computed {}: {} outputs reinjected, {} skipped",
                key,
                report.reinjected.len(),
                report.skipped.len()
            ),
            Retrieved::AlreadyRealized => info!("Delivered already realized content for {}", key),
        }
        Ok(())
    }
}

/// Serve the protocol on stdin/stdout
pub async fn serve_stdio(config: Config, events: Arc<dyn EventSink>) -> RemakeResult<()> {
    let reader = tokio::io::BufReader::new(tokio::io::stdin());
    Session::new(reader, tokio::io::stdout(), config, events)
        .run()
        .await
}
