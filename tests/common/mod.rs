//! Fakes and a small harness shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use repolens::analysis::{AnalysisConfig, AnalysisHandler};
use repolens::broker::MemoryBroker;
use repolens::error::{FetchError, LlmError};
use repolens::fetch::{FetchHandler, RepoFetcher};
use repolens::llm::{Choice, GenerationRequest, GenerationResponse, LlmProvider, Message, Usage};
use repolens::scheduler::{
    Coordinator, CoordinatorConfig, JobHandler, JobId, JobKind, JobState, JobStatus, RepoLocator,
    RetryPolicy, WorkerPool, WorkerPoolConfig,
};
use repolens::storage::RepoSnapshot;

pub const REPORT: &str = r#"{
    "summary": "A small widget library",
    "complexity": ["render() nests four loops"],
    "security": [],
    "best_practices": ["Add a CI workflow"],
    "documentation": ["README lacks usage examples"]
}"#;

/// Fetcher serving fixed snapshots keyed by `host/owner/name`.
///
/// Ref `missing` does not exist. With a gate, `resolve` blocks until a
/// permit is added.
pub struct FakeFetcher {
    repos: HashMap<String, RepoSnapshot>,
    gate: Option<Arc<Semaphore>>,
    transient_failures: AtomicUsize,
    pub resolves: AtomicUsize,
    pub snapshots: AtomicUsize,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self {
            repos: HashMap::new(),
            gate: None,
            transient_failures: AtomicUsize::new(0),
            resolves: AtomicUsize::new(0),
            snapshots: AtomicUsize::new(0),
        }
    }

    pub fn with_repo(mut self, slug: &str, snapshot: RepoSnapshot) -> Self {
        self.repos.insert(slug.to_string(), snapshot);
        self
    }

    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// The first `n` resolves fail with a rate limit.
    pub fn with_transient_failures(self, n: usize) -> Self {
        self.transient_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn resolve_count(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RepoFetcher for FakeFetcher {
    async fn resolve(&self, repo: &RepoLocator, git_ref: &str) -> Result<String, FetchError> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate closed").forget();
        }
        self.resolves.fetch_add(1, Ordering::SeqCst);

        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(FetchError::RateLimited("slow down".to_string()));
        }

        if git_ref == "missing" || !self.repos.contains_key(&repo.slug()) {
            return Err(FetchError::InvalidRef {
                repo: repo.slug(),
                git_ref: git_ref.to_string(),
            });
        }
        Ok(format!("{:0>40}", repo.name.len()))
    }

    async fn snapshot(&self, repo: &RepoLocator, _commit: &str) -> Result<RepoSnapshot, FetchError> {
        self.snapshots.fetch_add(1, Ordering::SeqCst);
        self.repos
            .get(&repo.slug())
            .cloned()
            .ok_or_else(|| FetchError::Unavailable(repo.slug()))
    }
}

/// Provider answering every request with the same text.
pub struct FakeLlm {
    reply: String,
    pub calls: AtomicUsize,
}

impl FakeLlm {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for FakeLlm {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(GenerationResponse {
            id: "gen-1".to_string(),
            model: request.model,
            choices: vec![Choice {
                index: 0,
                message: Message::assistant(self.reply.clone()),
                finish_reason: "stop".to_string(),
            }],
            usage: Usage {
                prompt_tokens: 100,
                completion_tokens: 20,
                total_tokens: 120,
            },
        })
    }

    fn default_model(&self) -> &str {
        "fake-model"
    }
}

pub fn widget_snapshot() -> RepoSnapshot {
    RepoSnapshot::new()
        .with_file("README.md", "# widgets\n")
        .with_file("src/lib.rs", "pub fn render() -> u32 { 42 }\n")
}

/// A coordinator over an in-process broker plus both worker pools.
pub struct Harness {
    pub coordinator: Coordinator,
    pub fetcher: Arc<FakeFetcher>,
    pub llm: Arc<FakeLlm>,
    pools: Vec<WorkerPool>,
}

impl Harness {
    pub fn new(fetcher: FakeFetcher) -> Self {
        Self {
            coordinator: Coordinator::new(
                Arc::new(MemoryBroker::new()),
                CoordinatorConfig::default(),
            ),
            fetcher: Arc::new(fetcher),
            llm: Arc::new(FakeLlm::new(REPORT)),
            pools: Vec::new(),
        }
    }

    /// Starts one fetch and one analysis pool.
    pub async fn start(&mut self) {
        let handlers: [Arc<dyn JobHandler>; 2] = [
            Arc::new(FetchHandler::new(self.fetcher.clone())),
            Arc::new(AnalysisHandler::new(self.llm.clone(), AnalysisConfig::default())),
        ];
        for handler in handlers {
            let config = WorkerPoolConfig::new(handler.kind(), 2)
                .with_poll_interval(Duration::from_millis(10))
                .with_retry(RetryPolicy::immediate(3));
            let mut pool = WorkerPool::new(config, self.coordinator.clone(), handler)
                .expect("pool");
            pool.start().await.expect("start");
            self.pools.push(pool);
        }
    }

    pub async fn shutdown(mut self) {
        for pool in &mut self.pools {
            pool.shutdown().await.expect("shutdown");
        }
    }

    pub async fn status(&self, id: JobId) -> JobStatus {
        self.coordinator.status(id).await.expect("status")
    }

    /// Polls until the job is terminal.
    pub async fn wait_terminal(&self, id: JobId) -> JobStatus {
        self.wait_for(id, |s| s.state.is_terminal()).await
    }

    pub async fn wait_for_state(&self, id: JobId, state: JobState) -> JobStatus {
        self.wait_for(id, |s| s.state == state).await
    }

    async fn wait_for(&self, id: JobId, done: impl Fn(&JobStatus) -> bool) -> JobStatus {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let status = self.status(id).await;
            if done(&status) {
                return status;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {} stuck in {}",
                id,
                status.state
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn ready(&self, kind: JobKind) -> usize {
        self.coordinator
            .broker()
            .queue_depth(kind)
            .await
            .expect("depth")
            .ready
    }
}
