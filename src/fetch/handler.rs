//! Worker-side execution of fetch jobs.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::RepoFetcher;
use crate::error::{ErrorKind, TaskError};
use crate::metrics::{cache, MetricsCollector};
use crate::scheduler::job::{Job, JobInput, JobKind, ResultRef};
use crate::scheduler::worker_pool::{JobContext, JobHandler};
use crate::storage::Artifact;

/// Turns a fetch job into a registered artifact.
///
/// A commit seen before (by any URL spelling or ref) maps straight to its
/// artifact without downloading again.
pub struct FetchHandler {
    fetcher: Arc<dyn RepoFetcher>,
    metrics: MetricsCollector,
}

impl FetchHandler {
    pub fn new(fetcher: Arc<dyn RepoFetcher>) -> Self {
        Self {
            fetcher,
            metrics: MetricsCollector::new(),
        }
    }
}

/// Alias key of a repository at a commit.
pub fn commit_alias(slug: &str, commit: &str) -> String {
    format!("{}@{}", slug, commit)
}

#[async_trait]
impl JobHandler for FetchHandler {
    fn kind(&self) -> JobKind {
        JobKind::Fetch
    }

    async fn handle(&self, job: &Job, ctx: &JobContext) -> Result<ResultRef, TaskError> {
        let JobInput::Fetch(spec) = &job.input else {
            return Err(TaskError::permanent(
                ErrorKind::Internal,
                format!("job {} is not a fetch job", job.id),
            ));
        };
        let repo = spec
            .locator()
            .map_err(|e| TaskError::permanent(ErrorKind::InvalidRef, e.to_string()))?;
        let broker = ctx.broker();

        ctx.checkpoint().await?;
        let commit = self.fetcher.resolve(&repo, &spec.git_ref).await?;
        let alias = commit_alias(&repo.slug(), &commit);

        if let Some(fingerprint) = broker.resolve_alias(&alias).await? {
            if broker.get_artifact(&fingerprint).await?.is_some() {
                self.metrics.record_cache_hit(cache::ARTIFACT);
                info!(
                    job_id = %job.id,
                    repo = %repo.slug(),
                    commit = %commit,
                    fingerprint = %fingerprint,
                    "Commit already snapshotted, reusing artifact"
                );
                return Ok(ResultRef::Artifact { fingerprint });
            }
        }

        ctx.checkpoint().await?;
        let snapshot = self.fetcher.snapshot(&repo, &commit).await?;
        let content = snapshot
            .to_bytes()
            .map_err(|e| TaskError::permanent(ErrorKind::Internal, e.to_string()))?;

        let artifact = Artifact::describe(&snapshot, job.id, repo.canonical_url(), &commit);
        let stored = broker.register_artifact(&artifact, &content).await?;
        if stored.produced_by != job.id {
            self.metrics.record_cache_hit(cache::ARTIFACT);
            debug!(
                job_id = %job.id,
                fingerprint = %stored.fingerprint,
                produced_by = %stored.produced_by,
                "Identical content already registered"
            );
        }
        broker.alias_artifact(&alias, &stored.fingerprint).await?;

        info!(
            job_id = %job.id,
            repo = %repo.slug(),
            commit = %commit,
            fingerprint = %stored.fingerprint,
            files = stored.file_count,
            "Artifact registered"
        );
        Ok(ResultRef::Artifact {
            fingerprint: stored.fingerprint,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::broker::{Broker, MemoryBroker};
    use crate::error::FetchError;
    use crate::scheduler::coordinator::{Coordinator, CoordinatorConfig};
    use crate::scheduler::job::RepoLocator;
    use crate::storage::RepoSnapshot;

    struct StaticFetcher {
        commit: String,
        snapshot: RepoSnapshot,
        snapshots_taken: AtomicUsize,
        resolved: Mutex<Vec<String>>,
    }

    impl StaticFetcher {
        fn new(commit: &str, snapshot: RepoSnapshot) -> Self {
            Self {
                commit: commit.to_string(),
                snapshot,
                snapshots_taken: AtomicUsize::new(0),
                resolved: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RepoFetcher for StaticFetcher {
        async fn resolve(&self, repo: &RepoLocator, git_ref: &str) -> Result<String, FetchError> {
            if git_ref == "missing" {
                return Err(FetchError::InvalidRef {
                    repo: repo.slug(),
                    git_ref: git_ref.to_string(),
                });
            }
            self.resolved.lock().expect("lock").push(git_ref.to_string());
            Ok(self.commit.clone())
        }

        async fn snapshot(&self, _repo: &RepoLocator, _commit: &str) -> Result<RepoSnapshot, FetchError> {
            self.snapshots_taken.fetch_add(1, Ordering::SeqCst);
            Ok(self.snapshot.clone())
        }
    }

    async fn running_job(coordinator: &Coordinator, git_ref: &str) -> Job {
        let handle = coordinator
            .submit(JobInput::fetch("https://github.com/acme/widgets", git_ref))
            .await
            .expect("submit");
        let envelope = coordinator
            .broker()
            .claim(
                JobKind::Fetch,
                "w",
                std::time::Duration::from_millis(50),
                std::time::Duration::from_secs(60),
            )
            .await
            .expect("claim")
            .expect("envelope");
        assert_eq!(envelope.id, handle.job_id);
        coordinator
            .begin(&envelope, "w")
            .await
            .expect("begin")
            .expect("runnable")
    }

    fn context(coordinator: &Coordinator, job: &Job) -> JobContext {
        JobContext::new(coordinator.clone(), job.id, "w", 1)
    }

    #[tokio::test]
    async fn test_fetch_registers_artifact_and_alias() {
        let coordinator = Coordinator::new(Arc::new(MemoryBroker::new()), CoordinatorConfig::default());
        let snapshot = RepoSnapshot::new().with_file("src/lib.rs", "pub fn widget() {}");
        let expected = snapshot.fingerprint();
        let handler = FetchHandler::new(Arc::new(StaticFetcher::new(&"c".repeat(40), snapshot)));

        let job = running_job(&coordinator, "main").await;
        let result = handler.handle(&job, &context(&coordinator, &job)).await.expect("fetch");

        assert_eq!(result, ResultRef::Artifact { fingerprint: expected.clone() });
        let broker = coordinator.broker();
        let artifact = broker.get_artifact(&expected).await.expect("get").expect("artifact");
        assert_eq!(artifact.produced_by, job.id);
        assert_eq!(artifact.repo, "https://github.com/acme/widgets");
        let alias = commit_alias("github.com/acme/widgets", &"c".repeat(40));
        assert_eq!(broker.resolve_alias(&alias).await.expect("alias"), Some(expected));
    }

    #[tokio::test]
    async fn test_known_commit_skips_download() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let coordinator = Coordinator::new(broker.clone(), CoordinatorConfig::default());
        let fetcher = Arc::new(StaticFetcher::new(
            &"d".repeat(40),
            RepoSnapshot::new().with_file("a.txt", "a"),
        ));
        let handler = FetchHandler::new(fetcher.clone());

        let first = running_job(&coordinator, "main").await;
        handler.handle(&first, &context(&coordinator, &first)).await.expect("first");

        // A different ref resolving to the same commit
        let second = running_job(&coordinator, "v1.0").await;
        let result = handler.handle(&second, &context(&coordinator, &second)).await.expect("second");

        assert!(matches!(result, ResultRef::Artifact { .. }));
        assert_eq!(fetcher.snapshots_taken.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_ref_is_permanent() {
        let coordinator = Coordinator::new(Arc::new(MemoryBroker::new()), CoordinatorConfig::default());
        let handler = FetchHandler::new(Arc::new(StaticFetcher::new(&"e".repeat(40), RepoSnapshot::new())));

        let job = running_job(&coordinator, "missing").await;
        let err = handler
            .handle(&job, &context(&coordinator, &job))
            .await
            .expect_err("should fail");
        assert!(matches!(err, TaskError::Permanent(ref e) if e.kind == ErrorKind::InvalidRef));
    }

    #[tokio::test]
    async fn test_cancelled_job_stops_before_network() {
        let coordinator = Coordinator::new(Arc::new(MemoryBroker::new()), CoordinatorConfig::default());
        let fetcher = Arc::new(StaticFetcher::new(&"f".repeat(40), RepoSnapshot::new()));
        let handler = FetchHandler::new(fetcher.clone());

        let job = running_job(&coordinator, "main").await;
        coordinator.cancel(job.id).await.expect("cancel");

        let err = handler
            .handle(&job, &context(&coordinator, &job))
            .await
            .expect_err("cancelled");
        assert!(matches!(err, TaskError::Cancelled));
        assert!(fetcher.resolved.lock().expect("lock").is_empty());
    }
}
