//! Job lifecycle: submission, dependency resolution, completion, cancellation.
//!
//! The coordinator is a thin library over a [`Broker`]. The API embeds one to
//! submit and inspect jobs; every worker embeds one to move the jobs it holds
//! through their run-time states. All state lives in the broker, and every
//! write is a compare-and-swap on the job's `revision`, so any number of
//! coordinators may run at once.
//!
//! # Ordering
//!
//! Dependency edges are written before the dependency's state is read, and a
//! finishing job writes its terminal state before reading its edges. Whichever
//! side runs second sees the other's write, so no dependent is left Pending.
//! The `Pending → Enqueued` swap carries the `enqueued` flag and is the only
//! place an envelope is produced, so each job is enqueued at most once.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::job::{
    AnalysisSource, Disposition, Job, JobEnvelope, JobHandle, JobId, JobInput, JobKind, JobState,
    InputError, RepoSpec, ResultRef,
};
use crate::broker::{Broker, BrokerError};
use crate::error::{ErrorKind, JobError, TaskError};
use crate::metrics::{cache, MetricsCollector};
use crate::storage::{AnalysisResult, Artifact};

/// Default lifetime of a cache-key reservation (24 hours).
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default age after which a non-terminal job is force-failed.
pub const DEFAULT_JOB_MAX_LIFETIME: Duration = Duration::from_secs(60 * 60);

/// Host repositories are fetched from unless configured otherwise.
pub const DEFAULT_REPO_HOST: &str = "github.com";

/// Compare-and-swap attempts before an update gives up.
const MAX_UPDATE_RETRIES: u32 = 32;

/// Errors returned by coordinator operations.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Job {0} not found")]
    NotFound(JobId),

    #[error("Job {id} is {state}")]
    Conflict { id: JobId, state: JobState },

    #[error("Job {0} is being modified concurrently, retry later")]
    Contention(JobId),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl From<InputError> for CoordinatorError {
    fn from(err: InputError) -> Self {
        CoordinatorError::InvalidInput(err.to_string())
    }
}

impl From<CoordinatorError> for TaskError {
    fn from(err: CoordinatorError) -> Self {
        match err {
            CoordinatorError::NotFound(_) => TaskError::Cancelled,
            other => TaskError::Transient(JobError::internal(other.to_string())),
        }
    }
}

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How long a submission cache key stays reserved.
    pub cache_ttl: Duration,
    /// Age after which a non-terminal job is failed with `TimedOut`.
    pub job_max_lifetime: Duration,
    /// The only host accepted in repository URLs.
    pub repo_host: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_CACHE_TTL,
            job_max_lifetime: DEFAULT_JOB_MAX_LIFETIME,
            repo_host: DEFAULT_REPO_HOST.to_string(),
        }
    }
}

impl CoordinatorConfig {
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_job_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.job_max_lifetime = lifetime;
        self
    }

    pub fn with_repo_host(mut self, host: impl Into<String>) -> Self {
        self.repo_host = host.into().to_ascii_lowercase();
        self
    }
}

/// How a worker's execution ended.
#[derive(Debug, Clone)]
pub enum Outcome {
    Succeeded(ResultRef),
    Failed(JobError),
    Cancelled,
}

/// The payload a succeeded job points at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ResultPayload {
    Artifact(Artifact),
    Analysis(AnalysisResult),
}

/// Externally visible view of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub kind: JobKind,
    pub state: JobState,
    pub created_at: chrono::DateTime<Utc>,
    pub updated_at: chrono::DateTime<Utc>,
    pub attempts: u32,
    pub dependencies: Vec<JobId>,
    pub cancel_requested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

/// Owns job lifecycle on top of a shared broker.
#[derive(Clone)]
pub struct Coordinator {
    broker: Arc<dyn Broker>,
    config: CoordinatorConfig,
    metrics: MetricsCollector,
}

impl Coordinator {
    pub fn new(broker: Arc<dyn Broker>, config: CoordinatorConfig) -> Self {
        Self {
            broker,
            config,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    // Submission

    /// Submits a job and returns its handle.
    ///
    /// Identical submissions collapse onto one job: while a job owns the
    /// cache key of the normalized input, resubmitting returns that job's
    /// handle instead of creating another.
    pub async fn submit(&self, input: JobInput) -> Result<JobHandle, CoordinatorError> {
        let input = input.normalized()?;

        let source = match &input {
            JobInput::Fetch(spec) => {
                self.check_host(spec)?;
                None
            }
            JobInput::Analyze(analyze) => Some(analyze.source.clone()),
        };
        let Some(source) = source else {
            return self.submit_keyed(input, Vec::new()).await;
        };

        match source {
            AnalysisSource::Artifact { fingerprint } => {
                if self.broker.get_artifact(&fingerprint).await?.is_none() {
                    return Err(CoordinatorError::InvalidInput(format!(
                        "Unknown artifact '{}'",
                        fingerprint
                    )));
                }
                if let Some(result) = self.broker.get_result(&input.cache_key()).await? {
                    return self.cached_handle(input, result).await;
                }
                self.submit_keyed(input, Vec::new()).await
            }
            AnalysisSource::Repo(spec) => {
                self.check_host(&spec)?;
                if let Some(handle) = self.live_owner(&input.cache_key()).await? {
                    return Ok(handle);
                }
                let fetch = self
                    .submit_keyed(JobInput::Fetch(spec), Vec::new())
                    .await?;
                self.submit_keyed(input, vec![fetch.job_id]).await
            }
        }
    }

    fn check_host(&self, spec: &RepoSpec) -> Result<(), InputError> {
        let locator = spec.locator()?;
        if locator.host != self.config.repo_host {
            return Err(InputError::UnsupportedHost(locator.host));
        }
        Ok(())
    }

    /// Handle of the job owning `key`, if it is in flight or succeeded.
    async fn live_owner(&self, key: &str) -> Result<Option<JobHandle>, CoordinatorError> {
        let Some(owner_id) = self.broker.cache_owner(key).await? else {
            return Ok(None);
        };
        Ok(self
            .broker
            .get_job(owner_id)
            .await?
            .and_then(|owner| self.reuse_handle(&owner)))
    }

    fn reuse_handle(&self, owner: &Job) -> Option<JobHandle> {
        match owner.state {
            JobState::Failed | JobState::Cancelled => None,
            JobState::Succeeded => {
                self.metrics.record_cache_hit(cache::RESULT);
                Some(JobHandle::from_job(owner, Disposition::Cached))
            }
            _ => {
                self.metrics.record_cache_hit(cache::SUBMISSION);
                Some(JobHandle::from_job(owner, Disposition::Existing))
            }
        }
    }

    /// Creates a job for `input` unless a live job already owns its key.
    async fn submit_keyed(
        &self,
        input: JobInput,
        dependencies: Vec<JobId>,
    ) -> Result<JobHandle, CoordinatorError> {
        let job = Job::new(input, dependencies);
        let key = job.cache_key.clone();
        let ttl = self.config.cache_ttl;

        self.broker.insert_job(&job).await?;

        let mut owner = self.broker.reserve_cache_key(&key, job.id, ttl).await?;
        let mut rounds = 0;
        while let Some(owner_id) = owner {
            if let Some(existing) = self.broker.get_job(owner_id).await? {
                if let Some(handle) = self.reuse_handle(&existing) {
                    self.broker.remove_job(job.id).await?;
                    debug!(job_id = %existing.id, kind = %existing.kind, "Submission matched existing job");
                    return Ok(handle);
                }
            }

            // Owner failed, was cancelled, or evicted: take the key over.
            if self
                .broker
                .replace_cache_key(&key, owner_id, job.id, ttl)
                .await?
            {
                break;
            }

            rounds += 1;
            if rounds >= MAX_UPDATE_RETRIES {
                self.broker.remove_job(job.id).await?;
                return Err(CoordinatorError::Contention(job.id));
            }
            owner = self.broker.reserve_cache_key(&key, job.id, ttl).await?;
        }

        for dependency in &job.dependencies {
            self.broker.add_dependent(*dependency, job.id).await?;
        }

        let job = self.evaluate(job.id).await?;
        info!(
            job_id = %job.id,
            kind = %job.kind,
            state = %job.state,
            dependencies = job.dependencies.len(),
            "Job submitted"
        );
        Ok(JobHandle::from_job(&job, Disposition::Created))
    }

    /// Returns a Cached handle for an existing result.
    async fn cached_handle(
        &self,
        input: JobInput,
        result: AnalysisResult,
    ) -> Result<JobHandle, CoordinatorError> {
        if let Some(producer) = self.broker.get_job(result.job_id).await? {
            if producer.state == JobState::Succeeded {
                self.metrics.record_cache_hit(cache::RESULT);
                return Ok(JobHandle::from_job(&producer, Disposition::Cached));
            }
        }

        // The producing job was evicted; a record standing in for it may
        // already own the key.
        let key = input.cache_key();
        if let Some(handle) = self.live_owner(&key).await? {
            return Ok(handle);
        }
        self.metrics.record_cache_hit(cache::RESULT);

        let mut job = Job::new(input, Vec::new());
        job.state = JobState::Succeeded;
        job.result = Some(ResultRef::Analysis {
            cache_key: result.cache_key,
        });
        job.finished_at = Some(Utc::now());
        self.broker.insert_job(&job).await?;

        let ttl = self.config.cache_ttl;
        if let Some(owner_id) = self.broker.reserve_cache_key(&key, job.id, ttl).await? {
            if let Some(existing) = self.broker.get_job(owner_id).await? {
                if let Some(handle) = self.reuse_handle(&existing) {
                    self.broker.remove_job(job.id).await?;
                    return Ok(handle);
                }
            }
            // A lost race leaves this record unowned, which is harmless.
            self.broker
                .replace_cache_key(&key, owner_id, job.id, ttl)
                .await?;
        }
        Ok(JobHandle::from_job(&job, Disposition::Cached))
    }

    // Dependency resolution

    /// Enqueues a Pending job whose dependencies all succeeded, or fails it if
    /// one of them failed. Returns the job as it stands afterwards.
    pub async fn evaluate(&self, id: JobId) -> Result<Job, CoordinatorError> {
        let job = self
            .broker
            .get_job(id)
            .await?
            .ok_or(CoordinatorError::NotFound(id))?;
        if job.state != JobState::Pending {
            return Ok(job);
        }

        let mut ready = true;
        for dependency in &job.dependencies {
            let state = self.broker.get_job(*dependency).await?.map(|d| d.state);
            match state {
                Some(JobState::Succeeded) => {}
                Some(JobState::Failed) | Some(JobState::Cancelled) | None => {
                    let reason = state.map(|s| s.as_str()).unwrap_or("missing");
                    let error = JobError::new(
                        ErrorKind::DependencyFailed,
                        format!("Dependency {} is {}", dependency, reason),
                    );
                    return self.fail_pending(id, error).await;
                }
                Some(_) => ready = false,
            }
        }
        if !ready {
            return Ok(job);
        }

        let (job, enqueued) = self
            .update(id, |j| {
                if j.state != JobState::Pending || j.enqueued {
                    return false;
                }
                j.enqueued = true;
                j.transition(JobState::Enqueued)
            })
            .await?;
        if enqueued {
            self.broker.enqueue(&job.envelope()).await?;
            debug!(job_id = %job.id, kind = %job.kind, "Job enqueued");
        }
        Ok(job)
    }

    async fn fail_pending(&self, id: JobId, error: JobError) -> Result<Job, CoordinatorError> {
        let (job, failed) = self
            .update(id, |j| j.state == JobState::Pending && j.fail(error.clone()))
            .await?;
        if failed {
            info!(job_id = %job.id, kind = %job.kind, error = %error, "Job failed before dispatch");
            self.metrics.record_job_finished(&job);
            self.fail_dependents(id).await?;
        }
        Ok(job)
    }

    /// Fails every direct and transitive dependent of `root` that has not
    /// been dispatched yet.
    pub async fn fail_dependents(&self, root: JobId) -> Result<usize, CoordinatorError> {
        let mut queue: VecDeque<JobId> = VecDeque::from([root]);
        let mut visited: HashSet<JobId> = HashSet::from([root]);
        let mut failed = 0;

        while let Some(parent) = queue.pop_front() {
            for dependent in self.broker.dependents(parent).await? {
                if !visited.insert(dependent) {
                    continue;
                }
                let error = JobError::new(
                    ErrorKind::DependencyFailed,
                    format!("Dependency {} did not succeed", parent),
                );
                let result = self
                    .update(dependent, |j| {
                        matches!(j.state, JobState::Pending | JobState::Enqueued)
                            && j.fail(error.clone())
                    })
                    .await;
                match result {
                    Ok((job, true)) => {
                        failed += 1;
                        info!(job_id = %job.id, dependency = %parent, "Dependent job failed");
                        self.metrics.record_job_finished(&job);
                        queue.push_back(dependent);
                    }
                    Ok((_, false)) | Err(CoordinatorError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(failed)
    }

    // Worker-side transitions

    /// Marks a delivered job Running for `worker_id`.
    ///
    /// A job that is already Running was redelivered after its lease expired;
    /// the new worker takes it over. Returns `None` when the job should not run
    /// (cancelled, already finished, or evicted); the envelope is then dropped.
    pub async fn begin(
        &self,
        envelope: &JobEnvelope,
        worker_id: &str,
    ) -> Result<Option<Job>, CoordinatorError> {
        let result = self
            .update(envelope.id, |j| match j.state {
                JobState::Enqueued => {
                    j.worker_id = Some(worker_id.to_string());
                    j.transition(JobState::Running)
                }
                JobState::Running => {
                    j.worker_id = Some(worker_id.to_string());
                    true
                }
                _ => false,
            })
            .await;

        match result {
            Ok((job, true)) => Ok(Some(job)),
            Ok((job, false)) => {
                debug!(job_id = %job.id, state = %job.state, "Dropping delivery of non-runnable job");
                Ok(None)
            }
            Err(CoordinatorError::NotFound(id)) => {
                debug!(job_id = %id, "Dropping delivery of evicted job");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Cancellation checkpoint. Fails with `TaskError::Cancelled` when the job
    /// was cancelled or is no longer Running.
    pub async fn checkpoint(&self, id: JobId) -> Result<(), TaskError> {
        match self.broker.get_job(id).await? {
            Some(job) if job.state == JobState::Running && !job.cancel_requested => Ok(()),
            _ => Err(TaskError::Cancelled),
        }
    }

    /// Counts an execution attempt. Returns the new total.
    pub async fn record_attempt(&self, id: JobId) -> Result<u32, CoordinatorError> {
        let (job, _) = self
            .update(id, |j| {
                if j.state != JobState::Running {
                    return false;
                }
                j.attempts += 1;
                true
            })
            .await?;
        Ok(job.attempts)
    }

    /// Moves a Running job to its terminal state and resolves its dependents.
    ///
    /// A no-op when the job is no longer Running (e.g. force-failed by the
    /// sweeper, or finished by another worker after a takeover).
    pub async fn finish(&self, id: JobId, outcome: Outcome) -> Result<Job, CoordinatorError> {
        let (job, finished) = self
            .update(id, |j| {
                if j.state != JobState::Running {
                    return false;
                }
                match &outcome {
                    Outcome::Succeeded(result) => {
                        j.result = Some(result.clone());
                        j.transition(JobState::Succeeded)
                    }
                    Outcome::Failed(error) => j.fail(error.clone()),
                    Outcome::Cancelled => j.transition(JobState::Cancelled),
                }
            })
            .await?;

        if !finished {
            debug!(job_id = %id, state = %job.state, "Finish ignored, job is not running");
            return Ok(job);
        }

        self.metrics.record_job_finished(&job);
        match job.state {
            JobState::Succeeded => {
                for dependent in self.broker.dependents(id).await? {
                    if let Err(e) = self.evaluate(dependent).await {
                        warn!(job_id = %dependent, dependency = %id, error = %e, "Failed to evaluate dependent");
                    }
                }
            }
            _ => {
                self.fail_dependents(id).await?;
            }
        }
        Ok(job)
    }

    // Client-side operations

    /// Cancels a job.
    ///
    /// Pending and Enqueued jobs are cancelled at once. A Running job gets its
    /// `cancel_requested` flag set and is cancelled by its worker at the next
    /// checkpoint. Terminal jobs are left unchanged.
    pub async fn cancel(&self, id: JobId) -> Result<Job, CoordinatorError> {
        let (job, changed) = self
            .update(id, |j| match j.state {
                JobState::Pending | JobState::Enqueued => j.transition(JobState::Cancelled),
                JobState::Running if !j.cancel_requested => {
                    j.cancel_requested = true;
                    true
                }
                _ => false,
            })
            .await?;

        if changed {
            info!(job_id = %job.id, kind = %job.kind, state = %job.state, "Job cancellation requested");
            if job.state == JobState::Cancelled {
                self.metrics.record_job_finished(&job);
                self.fail_dependents(id).await?;
            }
        }
        Ok(job)
    }

    /// Removes a terminal job and releases its cache key.
    pub async fn evict(&self, id: JobId) -> Result<(), CoordinatorError> {
        let job = self
            .broker
            .get_job(id)
            .await?
            .ok_or(CoordinatorError::NotFound(id))?;
        if !job.is_terminal() {
            return Err(CoordinatorError::Conflict {
                id,
                state: job.state,
            });
        }
        self.broker.release_cache_key(&job.cache_key, id).await?;
        self.broker.remove_job(id).await?;
        info!(job_id = %id, kind = %job.kind, "Job evicted");
        Ok(())
    }

    pub async fn get_job(&self, id: JobId) -> Result<Job, CoordinatorError> {
        self.broker
            .get_job(id)
            .await?
            .ok_or(CoordinatorError::NotFound(id))
    }

    /// Current state of a job, with its result resolved to the payload.
    pub async fn status(&self, id: JobId) -> Result<JobStatus, CoordinatorError> {
        let job = self.get_job(id).await?;

        let result = match &job.result {
            Some(ResultRef::Artifact { fingerprint }) => self
                .broker
                .get_artifact(fingerprint)
                .await?
                .map(ResultPayload::Artifact),
            Some(ResultRef::Analysis { cache_key }) => self
                .broker
                .get_result(cache_key)
                .await?
                .map(ResultPayload::Analysis),
            None => None,
        };

        Ok(JobStatus {
            job_id: job.id,
            kind: job.kind,
            state: job.state,
            created_at: job.created_at,
            updated_at: job.updated_at,
            attempts: job.attempts,
            dependencies: job.dependencies,
            cancel_requested: job.cancel_requested,
            result,
            error: job.error,
        })
    }

    /// Fails every non-terminal job older than the configured maximum
    /// lifetime with `TimedOut`. Returns how many were failed.
    pub async fn sweep_expired(&self) -> Result<usize, CoordinatorError> {
        let lifetime = self.config.job_max_lifetime;
        let mut expired = 0;

        for id in self.broker.active_jobs().await? {
            let Some(job) = self.broker.get_job(id).await? else {
                continue;
            };
            let too_old = job.age().to_std().map(|age| age > lifetime).unwrap_or(false);
            if job.is_terminal() || !too_old {
                continue;
            }

            let error = JobError::new(
                ErrorKind::TimedOut,
                format!("Job exceeded its maximum lifetime of {}s", lifetime.as_secs()),
            );
            let result = self.update(id, |j| !j.is_terminal() && j.fail(error.clone())).await;
            match result {
                Ok((job, true)) => {
                    expired += 1;
                    warn!(job_id = %job.id, kind = %job.kind, "Job timed out");
                    self.metrics.record_job_finished(&job);
                    self.fail_dependents(id).await?;
                }
                Ok((_, false)) | Err(CoordinatorError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(expired)
    }

    /// Read-modify-write of a job record under compare-and-swap.
    ///
    /// `apply` returns whether it changed the job; when it returns `false` the
    /// current record is returned untouched. Retries on lost races.
    async fn update<F>(&self, id: JobId, mut apply: F) -> Result<(Job, bool), CoordinatorError>
    where
        F: FnMut(&mut Job) -> bool + Send,
    {
        for _ in 0..MAX_UPDATE_RETRIES {
            let mut job = self
                .broker
                .get_job(id)
                .await?
                .ok_or(CoordinatorError::NotFound(id))?;
            let expected = job.revision;

            if !apply(&mut job) {
                return Ok((job, false));
            }

            job.revision = expected + 1;
            job.updated_at = Utc::now();
            if self.broker.compare_and_set_job(&job, expected).await? {
                return Ok((job, true));
            }
            tokio::task::yield_now().await;
        }

        Err(CoordinatorError::Contention(id))
    }
}
