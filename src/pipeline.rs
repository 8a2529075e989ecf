//! The retrieval pipeline
//!
//! For a specification address: find the dataset that knows the recorded
//! commit, deliver already realized content if there is any, otherwise load
//! and authorize the recipe, run it in a disposable worktree and collect the
//! outputs. Each collaborator is injected, so the pipeline itself never
//! touches git directly.

use crate::address::{Address, ComputationAddress, InlineAddress};
use crate::collect::{copy_file, CollectReport, Collector};
use crate::error::{RemakeError, RemakeResult};
use crate::events::EventSink;
use crate::execute::{Executor, MethodTemplate};
use crate::pattern::PatternSet;
use crate::recipe::{find_dataset, method_path, read_recorded, specification_path, Specification};
use crate::store::{owning_repository, VersionStore};
use crate::trust::{authorize, SignedFile, TrustDecision, TrustVerifier};
use crate::worktree::{with_worktree, ScratchProvider, TreeProvider};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Collaborators of a [`Retriever`]
pub struct RetrieverParts {
    pub store: Arc<dyn VersionStore>,
    pub verifier: Arc<dyn TrustVerifier>,
    pub trees: Arc<dyn TreeProvider>,
    pub executor: Executor,
    pub events: Arc<dyn EventSink>,
    pub trust: TrustDecision,
    /// Upper bound of the dataset search
    pub search_boundary: Option<PathBuf>,
    /// Parent directory for scratch space of inline recipes
    pub scratch_dir: PathBuf,
}

/// How a retrieval was satisfied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Retrieved {
    /// The method ran
    Computed(CollectReport),
    /// The content was already present locally
    AlreadyRealized,
}

/// Materializes the content behind `remake:` addresses
pub struct Retriever {
    store: Arc<dyn VersionStore>,
    verifier: Arc<dyn TrustVerifier>,
    trees: Arc<dyn TreeProvider>,
    executor: Executor,
    events: Arc<dyn EventSink>,
    trust: TrustDecision,
    search_boundary: Option<PathBuf>,
    scratch_dir: PathBuf,
}

/// A recipe that passed authorization
struct AuthorizedRecipe {
    specification: Specification,
    template: MethodTemplate,
}

impl Retriever {
    pub fn new(parts: RetrieverParts) -> Self {
        Self {
            store: parts.store,
            verifier: parts.verifier,
            trees: parts.trees,
            executor: parts.executor,
            events: parts.events,
            trust: parts.trust,
            search_boundary: parts.search_boundary,
            scratch_dir: parts.scratch_dir,
        }
    }

    pub fn trust(&self) -> &TrustDecision {
        &self.trust
    }

    /// Produce the content for `key` at `destination`
    ///
    /// `start` is where the dataset search begins, normally the root of the
    /// repository that asked for the key.
    pub async fn retrieve(
        &self,
        key: &str,
        address: &Address,
        start: &Path,
        destination: &Path,
    ) -> RemakeResult<Retrieved> {
        self.events
            .record("retrieve.started", &json!({ "key": key, "address": address_text(address) }))
            .await;

        let result = match address {
            Address::Specification(address) => {
                self.retrieve_specification(address, start, destination).await
            }
            Address::Inline(address) => self.retrieve_inline(address, start, destination).await,
        };

        match &result {
            Ok(retrieved) => {
                self.events
                    .record(
                        "retrieve.succeeded",
                        &json!({
                            "key": key,
                            "computed": matches!(retrieved, Retrieved::Computed(_)),
                        }),
                    )
                    .await;
            }
            Err(e) => {
                self.events
                    .record(
                        "retrieve.failed",
                        &json!({ "key": key, "kind": e.kind(), "error": e.to_string() }),
                    )
                    .await;
            }
        }
        result
    }

    async fn retrieve_specification(
        &self,
        address: &ComputationAddress,
        start: &Path,
        destination: &Path,
    ) -> RemakeResult<Retrieved> {
        let dataset = find_dataset(
            self.store.as_ref(),
            start,
            &address.root_version,
            self.search_boundary.as_deref(),
        )
        .await?;
        info!("Dataset for {} is {}", address.root_version, dataset.display());

        if self.deliver_realized(&dataset, &address.this, destination).await? {
            return Ok(Retrieved::AlreadyRealized);
        }

        let recipe = self.load_recipe(&dataset, address).await?;
        let specification = &recipe.specification;
        let template = &recipe.template;
        let inputs = PatternSet::new(&specification.input)?;
        let outputs = PatternSet::new(&specification.output)?;
        let dataset_ref = dataset.as_path();

        let report = with_worktree(
            self.trees.as_ref(),
            &dataset,
            &address.root_version,
            &inputs,
            |worktree| async move {
                let execution = self
                    .executor
                    .run(
                        &specification.method,
                        template,
                        &specification.parameter,
                        &worktree.path,
                    )
                    .await?;
                self.events
                    .record(
                        "method.executed",
                        &json!({
                            "method": specification.method,
                            "command": execution.argv,
                            "worktree": worktree.path,
                            "duration_ms": execution.duration.as_millis() as u64,
                        }),
                    )
                    .await;

                Collector::new(self.store.as_ref(), self.events.as_ref())
                    .collect(
                        &worktree.path,
                        &outputs,
                        &address.this,
                        dataset_ref,
                        destination,
                    )
                    .await
            },
        )
        .await?;

        Ok(Retrieved::Computed(report))
    }

    /// Copy locally present content for `this`, reporting whether there was any
    async fn deliver_realized(&self, dataset: &Path, this: &str, destination: &Path) -> RemakeResult<bool> {
        let (repository, path) = owning_repository(dataset, this);
        let Some(key) = self.store.annex_key(&repository, &path).await? else {
            return Ok(false);
        };
        let Some(location) = self.store.content_location(&repository, &key).await? else {
            return Ok(false);
        };
        if !location.is_file() {
            return Ok(false);
        }

        copy_file(&location, destination).await?;
        self.events
            .record("retrieve.already_realized", &json!({ "path": this, "key": key }))
            .await;
        Ok(true)
    }

    /// Read, authorize and parse the specification and its method template
    async fn load_recipe(
        &self,
        dataset: &Path,
        address: &ComputationAddress,
    ) -> RemakeResult<AuthorizedRecipe> {
        let commit = address.root_version.as_str();

        let spec_file = specification_path(&address.specification);
        let spec_bytes = read_recorded(self.store.as_ref(), dataset, commit, &spec_file).await?;
        self.authorize(dataset, commit, &spec_file, &spec_bytes).await?;
        let specification = Specification::parse(&spec_file, &spec_bytes)?;

        let method_file = method_path(&specification.method);
        let method_bytes = read_recorded(self.store.as_ref(), dataset, commit, &method_file).await?;
        self.authorize(dataset, commit, &method_file, &method_bytes).await?;
        let template = MethodTemplate::parse(&method_file, &method_bytes)?;
        template.check_parameters(&method_file, &specification.parameter)?;

        Ok(AuthorizedRecipe {
            specification,
            template,
        })
    }

    async fn authorize(&self, repo: &Path, commit: &str, path: &str, content: &[u8]) -> RemakeResult<()> {
        let file = SignedFile {
            repo,
            commit,
            path,
            content,
        };
        authorize(self.verifier.as_ref(), &self.trust, file, self.events.as_ref()).await
    }

    /// Run an inline recipe in scratch space; only allowed without verification
    async fn retrieve_inline(
        &self,
        address: &InlineAddress,
        start: &Path,
        destination: &Path,
    ) -> RemakeResult<Retrieved> {
        let method_file = method_path(&address.method);
        if self.trust != TrustDecision::Bypass {
            return Err(RemakeError::verification(
                method_file,
                "inline recipes carry no signature",
            ));
        }

        let template_path = start.join(&method_file);
        let bytes = tokio::fs::read(&template_path)
            .await
            .map_err(|e| RemakeError::io(format!("reading {}", template_path.display()), e))?;
        self.authorize(start, "HEAD", &method_file, &bytes).await?;
        let template = MethodTemplate::parse(&method_file, &bytes)?;

        let scratch = ScratchProvider::new(self.scratch_dir.clone());
        let no_inputs = PatternSet::new::<&str>(&[])?;
        with_worktree(&scratch, start, "HEAD", &no_inputs, |worktree| async move {
            self.run_inline(address, &template, &worktree.path, destination)
                .await
        })
        .await?;

        Ok(Retrieved::Computed(CollectReport::default()))
    }

    async fn run_inline(
        &self,
        address: &InlineAddress,
        template: &MethodTemplate,
        scratch: &Path,
        destination: &Path,
    ) -> RemakeResult<()> {
        self.executor
            .run(&address.method, template, &address.parameters, scratch)
            .await?;

        let produced = scratch.join(&address.output);
        if !produced.is_file() {
            return Err(RemakeError::MissingOutput {
                path: address.output.clone(),
            });
        }
        copy_file(&produced, destination).await
    }
}

fn address_text(address: &Address) -> String {
    match address {
        Address::Specification(a) => a.encode(),
        Address::Inline(a) => a.encode(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ExecutionConfig;
    use crate::events::MemorySink;
    use crate::trust::TrustedKeySet;
    use crate::worktree::Worktree;
    use async_trait::async_trait;
    use std::collections::{BTreeMap, BTreeSet, HashMap};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    const COMMIT: &str = "c0ffee";
    const SIGNER: &str = "0123456789ABCDEF";

    /// In-memory store: recorded files, tracked keys and realized content
    struct FakeStore {
        dataset: PathBuf,
        files: HashMap<String, Vec<u8>>,
        tracked: HashMap<(PathBuf, String), String>,
        content_dir: PathBuf,
        realized: Mutex<HashMap<String, PathBuf>>,
    }

    #[async_trait]
    impl VersionStore for FakeStore {
        async fn has_commit(&self, dir: &Path, commit: &str) -> RemakeResult<bool> {
            Ok(dir == self.dataset && commit == COMMIT)
        }
        async fn read_at(&self, _: &Path, commit: &str, path: &str) -> RemakeResult<Option<Vec<u8>>> {
            Ok((commit == COMMIT).then(|| self.files.get(path).cloned()).flatten())
        }
        async fn annex_key(&self, repo: &Path, path: &str) -> RemakeResult<Option<String>> {
            Ok(self.tracked.get(&(repo.to_path_buf(), path.to_string())).cloned())
        }
        async fn content_location(&self, _: &Path, key: &str) -> RemakeResult<Option<PathBuf>> {
            Ok(self.realized.lock().unwrap().get(key).cloned())
        }
        async fn reinject(&self, repo: &Path, source: &Path, path: &str) -> RemakeResult<()> {
            let key = self.tracked[&(repo.to_path_buf(), path.to_string())].clone();
            let target = self.content_dir.join(&key);
            std::fs::copy(source, &target).unwrap();
            self.realized.lock().unwrap().insert(key, target);
            Ok(())
        }
    }

    /// Plain directories standing in for checkouts
    struct FakeTrees {
        base: PathBuf,
        materialized: AtomicUsize,
        released: AtomicUsize,
    }

    #[async_trait]
    impl TreeProvider for FakeTrees {
        async fn materialize(&self, _: &Path, commit: &str, _: &PatternSet) -> RemakeResult<Worktree> {
            let n = self.materialized.fetch_add(1, Ordering::SeqCst);
            let path = self.base.join(format!("wt-{}", n));
            std::fs::create_dir_all(&path).unwrap();
            Ok(Worktree {
                path,
                name: format!("wt-{}", n),
                commit: commit.to_string(),
                inputs: BTreeSet::new(),
                sub_repositories: Vec::new(),
            })
        }
        async fn release(&self, worktree: &Worktree) -> RemakeResult<()> {
            std::fs::remove_dir_all(&worktree.path).unwrap();
            self.released.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Accepts any file when the fixed signer is trusted
    struct FixedSigner;

    #[async_trait]
    impl TrustVerifier for FixedSigner {
        async fn verify(&self, file: SignedFile<'_>, trusted: &TrustedKeySet) -> RemakeResult<String> {
            if trusted.contains(SIGNER) {
                Ok(SIGNER.to_string())
            } else {
                Err(RemakeError::verification(file.path, "signed by untrusted key"))
            }
        }
        fn backend_name(&self) -> &'static str {
            "fixed"
        }
    }

    struct Fixture {
        root: TempDir,
        store: Arc<FakeStore>,
        trees: Arc<FakeTrees>,
        events: Arc<MemorySink>,
    }

    impl Fixture {
        /// A dataset with three nested repositories and a recipe writing into all of them
        fn new() -> Self {
            let root = TempDir::new().unwrap();
            let dataset = root.path().join("ds");
            for repo in ["", "s0", "s0/s1", "s0/s1/s2"] {
                std::fs::create_dir_all(dataset.join(repo).join(".git")).unwrap();
            }
            let content_dir = root.path().join("content");
            std::fs::create_dir_all(&content_dir).unwrap();

            let spec = serde_json::json!({
                "method": "fan-out",
                "input": [],
                "output": ["a.txt", "s0/b.txt", "s0/s1/s2/c.txt", "s0/s1/untracked.txt"],
                "parameter": {"log": root.path().join("runs.log").display().to_string(), "value": "42"},
            });
            let template = r#"
parameters = ["log", "value"]
use_shell = true
command = ["echo run >> '{log}'; mkdir -p s0/s1/s2; printf 'A{value}' > a.txt; printf B > s0/b.txt; printf C > s0/s1/s2/c.txt; printf U > s0/s1/untracked.txt"]
"#;
            let mut files = HashMap::new();
            files.insert(specification_path("spec"), serde_json::to_vec(&spec).unwrap());
            files.insert(method_path("fan-out"), template.as_bytes().to_vec());

            let mut tracked = HashMap::new();
            tracked.insert((dataset.clone(), "a.txt".to_string()), "KEY-A".to_string());
            tracked.insert((dataset.join("s0"), "b.txt".to_string()), "KEY-B".to_string());
            tracked.insert((dataset.join("s0/s1/s2"), "c.txt".to_string()), "KEY-C".to_string());

            let trees_base = root.path().join("worktrees");
            Self {
                store: Arc::new(FakeStore {
                    dataset,
                    files,
                    tracked,
                    content_dir,
                    realized: Mutex::new(HashMap::new()),
                }),
                trees: Arc::new(FakeTrees {
                    base: trees_base,
                    materialized: AtomicUsize::new(0),
                    released: AtomicUsize::new(0),
                }),
                events: Arc::new(MemorySink::new()),
                root,
            }
        }

        fn retriever(&self, trust: TrustDecision) -> Retriever {
            Retriever::new(RetrieverParts {
                store: self.store.clone(),
                verifier: Arc::new(FixedSigner),
                trees: self.trees.clone(),
                executor: Executor::new(&ExecutionConfig::default()),
                events: self.events.clone(),
                trust,
                search_boundary: None,
                scratch_dir: self.root.path().join("scratch"),
            })
        }

        fn dataset(&self) -> PathBuf {
            self.store.dataset.clone()
        }

        fn runs(&self) -> usize {
            std::fs::read_to_string(self.root.path().join("runs.log"))
                .map(|s| s.lines().count())
                .unwrap_or(0)
        }

        fn destination(&self, name: &str) -> PathBuf {
            self.root.path().join("dest").join(name)
        }
    }

    fn trusted() -> TrustDecision {
        TrustDecision::Verify(TrustedKeySet::new([SIGNER]))
    }

    fn address(this: &str) -> Address {
        Address::Specification(ComputationAddress::new(COMMIT, "spec", this))
    }

    #[tokio::test]
    async fn computes_once_and_reinjects_siblings() {
        let fx = Fixture::new();
        let retriever = fx.retriever(trusted());
        let start = fx.dataset().join("s0");

        let first = retriever
            .retrieve("KEY-A", &address("a.txt"), &start, &fx.destination("a"))
            .await
            .unwrap();

        assert_eq!(fx.runs(), 1);
        assert_eq!(std::fs::read(fx.destination("a")).unwrap(), b"A42");
        match first {
            Retrieved::Computed(report) => {
                assert_eq!(report.reinjected, vec!["s0/b.txt", "s0/s1/s2/c.txt"]);
                assert_eq!(report.skipped, vec!["s0/s1/untracked.txt"]);
            }
            other => panic!("expected a computation, got {other:?}"),
        }
        assert_eq!(fx.trees.released.load(Ordering::SeqCst), 1);
        let executed = fx.events.data_of("method.executed");
        assert_eq!(executed[0]["command"][0], "/bin/sh");

        let second = retriever
            .retrieve("KEY-C", &address("s0/s1/s2/c.txt"), &start, &fx.destination("c"))
            .await
            .unwrap();

        assert_eq!(second, Retrieved::AlreadyRealized);
        assert_eq!(fx.runs(), 1);
        assert_eq!(std::fs::read(fx.destination("c")).unwrap(), b"C");
        assert_eq!(fx.trees.materialized.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn untrusted_signer_prevents_execution() {
        let fx = Fixture::new();
        let retriever = fx.retriever(TrustDecision::Verify(TrustedKeySet::default()));

        let err = retriever
            .retrieve("KEY-A", &address("a.txt"), &fx.dataset(), &fx.destination("a"))
            .await
            .unwrap_err();

        assert!(matches!(err, RemakeError::Verification { .. }));
        assert_eq!(fx.runs(), 0);
        assert_eq!(fx.trees.materialized.load(Ordering::SeqCst), 0);
        assert!(!fx.destination("a").exists());
        assert_eq!(fx.events.data_of("retrieve.failed")[0]["kind"], "verification");
    }

    #[tokio::test]
    async fn bypass_executes_with_empty_key_set() {
        let fx = Fixture::new();
        let retriever = fx.retriever(TrustDecision::Bypass);

        retriever
            .retrieve("KEY-A", &address("a.txt"), &fx.dataset(), &fx.destination("a"))
            .await
            .unwrap();

        assert_eq!(fx.runs(), 1);
        // Specification and method template
        assert_eq!(fx.events.data_of("verification.bypassed").len(), 2);
    }

    #[tokio::test]
    async fn unknown_commit_is_dataset_not_found() {
        let fx = Fixture::new();
        let retriever = fx.retriever(trusted());
        let missing = Address::Specification(ComputationAddress::new("feedface", "spec", "a.txt"));

        let err = retriever
            .retrieve("KEY-A", &missing, &fx.dataset(), &fx.destination("a"))
            .await
            .unwrap_err();

        assert!(matches!(err, RemakeError::DatasetNotFound { .. }));
        assert_eq!(fx.trees.materialized.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_output_still_releases_worktree() {
        let fx = Fixture::new();
        let retriever = fx.retriever(trusted());

        let err = retriever
            .retrieve("KEY-X", &address("never.txt"), &fx.dataset(), &fx.destination("x"))
            .await
            .unwrap_err();

        assert!(matches!(err, RemakeError::MissingOutput { .. }));
        assert_eq!(fx.trees.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn inline_address_requires_untrusted_mode() {
        let fx = Fixture::new();
        let inline = Address::Inline(InlineAddress {
            dependencies: "none".to_string(),
            method: "fan-out".to_string(),
            output: "a.txt".to_string(),
            parameters: BTreeMap::new(),
        });

        let err = fx
            .retriever(trusted())
            .retrieve("KEY-A", &inline, &fx.dataset(), &fx.destination("a"))
            .await
            .unwrap_err();

        assert!(matches!(err, RemakeError::Verification { .. }));
        assert_eq!(fx.runs(), 0);
    }

    #[tokio::test]
    async fn inline_address_runs_local_template() {
        let fx = Fixture::new();
        let methods = fx.dataset().join(crate::recipe::METHOD_DIR);
        std::fs::create_dir_all(&methods).unwrap();
        std::fs::write(
            methods.join("greet"),
            "parameters = [\"name\"]\nuse_shell = true\ncommand = [\"printf 'hi {name}' > out.txt\"]\n",
        )
        .unwrap();
        let mut parameters = BTreeMap::new();
        parameters.insert("name".to_string(), "there".to_string());
        let inline = Address::Inline(InlineAddress {
            dependencies: "none".to_string(),
            method: "greet".to_string(),
            output: "out.txt".to_string(),
            parameters,
        });

        fx.retriever(TrustDecision::Bypass)
            .retrieve("KEY-I", &inline, &fx.dataset(), &fx.destination("i"))
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(fx.destination("i")).unwrap(), "hi there");
        let leftovers = std::fs::read_dir(fx.root.path().join("scratch")).unwrap().count();
        assert_eq!(leftovers, 0);
    }
}
