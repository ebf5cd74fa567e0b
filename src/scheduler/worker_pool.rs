//! Worker pool for processing jobs from the broker.
//!
//! A pool serves one job kind. Each worker runs as an independent async task
//! that claims envelopes, moves the job to Running through the coordinator,
//! runs the pool's [`JobHandler`] with retries, and records the outcome.
//!
//! # Features
//!
//! - Configurable number of workers
//! - Graceful shutdown with broadcast channel
//! - Bounded retries with exponential backoff for transient errors
//! - Cooperative cancellation through checkpoints
//! - Pool statistics tracking

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::coordinator::{Coordinator, Outcome};
use super::job::{Job, JobEnvelope, JobId, JobKind, JobState, ResultRef};
use super::retry::RetryPolicy;
use crate::broker::{Broker, BrokerError};
use crate::error::{ErrorKind, JobError, TaskError};
use crate::metrics::MetricsCollector;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Handler serves {actual} jobs but the pool is configured for {expected}")]
    KindMismatch { expected: JobKind, actual: JobKind },

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Executes jobs of one kind.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn kind(&self) -> JobKind;

    /// Runs one attempt of `job`. Long-running handlers should call
    /// [`JobContext::checkpoint`] before each network call.
    async fn handle(&self, job: &Job, ctx: &JobContext) -> Result<ResultRef, TaskError>;
}

/// What a handler can see about the attempt it is running.
pub struct JobContext {
    coordinator: Coordinator,
    job_id: JobId,
    worker_id: String,
    attempt: u32,
}

impl JobContext {
    pub fn new(coordinator: Coordinator, job_id: JobId, worker_id: impl Into<String>, attempt: u32) -> Self {
        Self {
            coordinator,
            job_id,
            worker_id: worker_id.into(),
            attempt,
        }
    }

    /// Fails with `TaskError::Cancelled` once the job has been cancelled.
    pub async fn checkpoint(&self) -> Result<(), TaskError> {
        self.coordinator.checkpoint(self.job_id).await
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        self.coordinator.broker()
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// 1-based attempt number across all deliveries of the job.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Kind of job this pool serves.
    pub kind: JobKind,
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// How long a claim waits for work before checking for shutdown.
    pub poll_interval: Duration,
    /// Lease length of a claimed envelope.
    pub visibility_timeout: Duration,
    /// Maximum time allowed for a single attempt.
    pub job_timeout: Duration,
    /// Retry bounds for transient errors.
    pub retry: RetryPolicy,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            kind: JobKind::Fetch,
            num_workers: 4,
            poll_interval: Duration::from_secs(1),
            visibility_timeout: Duration::from_secs(600),
            job_timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a configuration for `kind` with the specified number of workers.
    pub fn new(kind: JobKind, num_workers: usize) -> Self {
        Self {
            kind,
            num_workers,
            ..Default::default()
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently processing jobs.
    pub active_workers: usize,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    /// Average job processing duration.
    pub average_job_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of jobs processed.
    pub fn total_processed(&self) -> u64 {
        self.jobs_succeeded + self.jobs_failed + self.jobs_cancelled
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_succeeded as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    jobs_succeeded: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_cancelled: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            jobs_succeeded: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_cancelled: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record(&self, state: JobState, duration: Duration) {
        let counter = match state {
            JobState::Succeeded => &self.jobs_succeeded,
            JobState::Cancelled => &self.jobs_cancelled,
            _ => &self.jobs_failed,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let succeeded = self.jobs_succeeded.load(Ordering::SeqCst);
        let failed = self.jobs_failed.load(Ordering::SeqCst);
        let cancelled = self.jobs_cancelled.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total_jobs = succeeded + failed + cancelled;
        let average_duration = if total_jobs > 0 {
            Duration::from_millis(total_duration_ms / total_jobs)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            jobs_succeeded: succeeded,
            jobs_failed: failed,
            jobs_cancelled: cancelled,
            average_job_duration: average_duration,
        }
    }
}

/// Worker pool that manages multiple workers serving one job kind.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    coordinator: Coordinator,
    handler: Arc<dyn JobHandler>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Creates a new worker pool.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::KindMismatch` if the handler serves a different
    /// job kind than the pool.
    pub fn new(
        config: WorkerPoolConfig,
        coordinator: Coordinator,
        handler: Arc<dyn JobHandler>,
    ) -> Result<Self, PoolError> {
        if handler.kind() != config.kind {
            return Err(PoolError::KindMismatch {
                expected: config.kind,
                actual: handler.kind(),
            });
        }

        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            coordinator,
            handler,
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
        })
    }

    /// Starts all workers in the pool.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        // Leases left behind by a previous run of this pool
        match self
            .coordinator
            .broker()
            .reclaim_expired(self.config.kind)
            .await
        {
            Ok(recovered) if recovered > 0 => {
                info!(kind = %self.config.kind, recovered, "Recovered expired leases");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(kind = %self.config.kind, error = %e, "Failed to recover expired leases");
            }
        }

        let pool_tag = Uuid::new_v4().simple().to_string();
        for i in 0..self.config.num_workers {
            let worker = Worker {
                id: format!("{}-{}-{}", self.config.kind, &pool_tag[..8], i),
                coordinator: self.coordinator.clone(),
                handler: Arc::clone(&self.handler),
                shutdown_rx: self.shutdown_tx.subscribe(),
                config: self.config.clone(),
                stats: Arc::clone(&self.stats),
                metrics: MetricsCollector::new(),
            };

            let handle = tokio::spawn(async move {
                worker.run().await;
            });

            self.worker_handles.push(handle);
        }

        self.is_running.store(true, Ordering::SeqCst);
        info!(
            kind = %self.config.kind,
            num_workers = self.config.num_workers,
            "Worker pool started"
        );

        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Workers finish the job they hold before stopping.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!(kind = %self.config.kind, "Initiating worker pool shutdown");

        // Ignore send error - workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let shutdown_future = async {
            for handle in self.worker_handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);
        match result {
            Ok(()) => {
                info!(kind = %self.config.kind, "Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    pub fn kind(&self) -> JobKind {
        self.config.kind
    }
}

/// A single worker that processes jobs of one kind.
struct Worker {
    id: String,
    coordinator: Coordinator,
    handler: Arc<dyn JobHandler>,
    shutdown_rx: broadcast::Receiver<()>,
    config: WorkerPoolConfig,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl Worker {
    /// Main worker loop.
    ///
    /// Continuously claims jobs and processes them until a shutdown signal is
    /// received.
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");
        self.metrics.inc_workers();

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => {
                    continue;
                }
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            let claimed = self
                .coordinator
                .broker()
                .claim(
                    self.config.kind,
                    &self.id,
                    self.config.poll_interval,
                    self.config.visibility_timeout,
                )
                .await;

            match claimed {
                Ok(Some(envelope)) => {
                    self.process_envelope(envelope).await;
                }
                Ok(None) => {
                    debug!(worker_id = %self.id, "No jobs available");
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to claim job");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }

        self.metrics.dec_workers();
        info!(worker_id = %self.id, "Worker stopped");
    }

    async fn process_envelope(&self, envelope: JobEnvelope) {
        let job_id = envelope.id;
        let kind = envelope.kind;

        let job = match self.coordinator.begin(&envelope, &self.id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                self.ack(kind, job_id).await;
                return;
            }
            Err(e) => {
                // Left leased; it comes back once the lease expires.
                error!(worker_id = %self.id, job_id = %job_id, error = %e, "Failed to start job");
                return;
            }
        };

        info!(
            worker_id = %self.id,
            job_id = %job_id,
            kind = %kind,
            previous_attempts = job.attempts,
            "Processing job"
        );

        let start_time = Instant::now();
        self.stats.increment_active();
        self.metrics.inc_jobs_in_progress();

        let outcome = self.execute(&job).await;

        self.stats.decrement_active();
        self.metrics.dec_jobs_in_progress();

        match self.coordinator.finish(job_id, outcome).await {
            Ok(finished) => {
                let duration = start_time.elapsed();
                self.stats.record(finished.state, duration);
                match finished.state {
                    JobState::Succeeded => info!(
                        worker_id = %self.id,
                        job_id = %job_id,
                        duration_ms = duration.as_millis() as u64,
                        "Job completed successfully"
                    ),
                    JobState::Cancelled => info!(
                        worker_id = %self.id,
                        job_id = %job_id,
                        "Job cancelled"
                    ),
                    _ => warn!(
                        worker_id = %self.id,
                        job_id = %job_id,
                        state = %finished.state,
                        error = ?finished.error,
                        "Job did not succeed"
                    ),
                }
                self.ack(kind, job_id).await;
            }
            Err(e) => {
                error!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    error = %e,
                    "Failed to record job outcome"
                );
            }
        }
    }

    /// Runs attempts until success, a permanent error, cancellation, or the
    /// retry budget is spent.
    async fn execute(&self, job: &Job) -> Outcome {
        let retry = self.config.retry;

        // Redelivered after a lapsed lease; earlier attempts count.
        if !retry.should_retry(job.attempts) {
            warn!(
                worker_id = %self.id,
                job_id = %job.id,
                attempts = job.attempts,
                "Retry budget already spent"
            );
            return Outcome::Failed(JobError::new(
                job.kind.exhausted_error_kind(),
                format!("Gave up after {} attempts", job.attempts),
            ));
        }

        loop {
            if let Err(e) = self.coordinator.checkpoint(job.id).await {
                return match e {
                    TaskError::Cancelled => Outcome::Cancelled,
                    TaskError::Transient(err) | TaskError::Permanent(err) => Outcome::Failed(err),
                };
            }

            let attempt = match self.coordinator.record_attempt(job.id).await {
                Ok(attempt) => attempt,
                Err(e) => return Outcome::Failed(JobError::internal(e.to_string())),
            };

            let ctx = JobContext::new(self.coordinator.clone(), job.id, self.id.clone(), attempt);
            let result = match tokio::time::timeout(
                self.config.job_timeout,
                self.handler.handle(job, &ctx),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(TaskError::transient(
                    ErrorKind::TimedOut,
                    format!("Attempt timed out after {:?}", self.config.job_timeout),
                )),
            };

            if let Err(e) = self
                .coordinator
                .broker()
                .extend_lease(job.kind, job.id, self.config.visibility_timeout)
                .await
            {
                debug!(worker_id = %self.id, job_id = %job.id, error = %e, "Failed to extend lease");
            }

            match result {
                Ok(result) => return Outcome::Succeeded(result),
                Err(TaskError::Cancelled) => return Outcome::Cancelled,
                Err(TaskError::Permanent(err)) => return Outcome::Failed(err),
                Err(TaskError::Transient(err)) => {
                    if !retry.should_retry(attempt) {
                        warn!(
                            worker_id = %self.id,
                            job_id = %job.id,
                            attempt,
                            error = %err,
                            "Retries exhausted"
                        );
                        return Outcome::Failed(err);
                    }
                    let delay = retry.delay_for(attempt);
                    warn!(
                        worker_id = %self.id,
                        job_id = %job.id,
                        attempt,
                        max_attempts = retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient error, will retry"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn ack(&self, kind: JobKind, job_id: JobId) {
        if let Err(e) = self.coordinator.broker().ack(kind, job_id).await {
            warn!(worker_id = %self.id, job_id = %job_id, error = %e, "Failed to acknowledge job");
        }
    }
}
