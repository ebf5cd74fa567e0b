//! Job orchestration: coordinator, worker pools and the sweeper.
//!
//! - **Coordinator**: submission, idempotency, dependency linking, failure
//!   propagation and cancellation on top of a shared [`Broker`](crate::broker::Broker)
//! - **WorkerPool**: pool of workers serving one job kind
//! - **Sweeper**: lease recovery and lifetime enforcement
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │  API / CLI   │
//!                      └──────┬───────┘
//!                             │ submit
//!                      ┌──────▼───────┐
//!                      │ Coordinator  │
//!                      └──────┬───────┘
//!                             │
//!                      ┌──────▼───────┐
//!                      │    Broker    │◄──── Sweeper
//!                      └──────┬───────┘
//!                ┌────────────┴────────────┐
//!                ▼                         ▼
//!         ┌─────────────┐           ┌─────────────┐
//!         │ fetch pool  │           │analyze pool │
//!         └─────────────┘           └─────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use repolens::broker::MemoryBroker;
//! use repolens::scheduler::{Coordinator, CoordinatorConfig, JobInput, JobKind, WorkerPool, WorkerPoolConfig};
//! use std::sync::Arc;
//!
//! let coordinator = Coordinator::new(Arc::new(MemoryBroker::new()), CoordinatorConfig::default());
//! let mut pool = WorkerPool::new(WorkerPoolConfig::new(JobKind::Fetch, 4), coordinator.clone(), handler)?;
//! pool.start().await?;
//!
//! let handle = coordinator.submit(JobInput::fetch("https://github.com/rust-lang/log", "HEAD")).await?;
//! let status = coordinator.status(handle.job_id).await?;
//!
//! pool.shutdown().await?;
//! ```

pub mod coordinator;
pub mod job;
pub mod retry;
pub mod sweeper;
pub mod worker_pool;

pub use coordinator::{
    Coordinator, CoordinatorConfig, CoordinatorError, JobStatus, Outcome, ResultPayload,
    DEFAULT_CACHE_TTL, DEFAULT_JOB_MAX_LIFETIME,
};
pub use job::{
    AnalysisFocus, AnalysisParams, AnalysisSource, AnalyzeInput, Disposition, InputError, Job,
    JobEnvelope, JobHandle, JobId, JobInput, JobKind, JobState, RepoLocator, RepoSpec, ResultRef,
};
pub use retry::RetryPolicy;
pub use sweeper::{sweep_once, SweepReport, Sweeper, DEFAULT_SWEEP_INTERVAL};
pub use worker_pool::{JobContext, JobHandler, PoolError, PoolStats, WorkerPool, WorkerPoolConfig};
