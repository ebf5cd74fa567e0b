//! Durable queue and job store.
//!
//! Everything workers and the coordinator share goes through a [`Broker`]:
//!
//! - **Job records**: versioned with a `revision` counter; every update is a
//!   compare-and-swap on it
//! - **Queues**: one FIFO per job kind, with leases that expire back into the
//!   queue when a worker disappears (at-least-once delivery)
//! - **Cache-key index**: maps a submission fingerprint to the job that owns it
//! - **Dependency edges**: `dependency → dependents`
//! - **Artifacts and results**: put-if-absent, the first writer wins
//!
//! Two implementations are provided: [`RedisBroker`] for deployments where
//! pools run in separate processes, and [`MemoryBroker`] for single-process
//! mode and tests.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scheduler::job::{Job, JobEnvelope, JobId, JobKind};
use crate::storage::{AnalysisResult, Artifact};

pub use self::memory::MemoryBroker;
pub use self::redis::RedisBroker;

/// Errors that can occur during broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Failed to connect to the backing store.
    #[error("Broker connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] ::redis::RedisError),

    /// Failed to (de)serialize a stored record.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored record is not in the expected shape.
    #[error("Corrupt record at '{key}': {message}")]
    Corrupt { key: String, message: String },
}

/// Queue sizes for one job kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub kind: JobKind,
    /// Envelopes waiting to be claimed.
    pub ready: usize,
    /// Envelopes claimed and not yet acknowledged.
    pub in_flight: usize,
}

impl QueueDepth {
    pub fn total(&self) -> usize {
        self.ready + self.in_flight
    }
}

/// Queue and store operations shared by the coordinator, workers and the API.
#[async_trait]
pub trait Broker: Send + Sync {
    // Job records

    /// Stores a new job record. Fails only on transport errors.
    async fn insert_job(&self, job: &Job) -> Result<(), BrokerError>;

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, BrokerError>;

    /// Replaces the stored job if its revision still equals
    /// `expected_revision`. Returns `false` when another writer got there
    /// first or the job no longer exists. Terminal jobs leave the active set.
    async fn compare_and_set_job(
        &self,
        job: &Job,
        expected_revision: u64,
    ) -> Result<bool, BrokerError>;

    async fn remove_job(&self, id: JobId) -> Result<(), BrokerError>;

    /// Ids of all non-terminal jobs.
    async fn active_jobs(&self) -> Result<Vec<JobId>, BrokerError>;

    // Queue

    async fn enqueue(&self, envelope: &JobEnvelope) -> Result<(), BrokerError>;

    /// Waits up to `timeout` for an envelope of `kind`. A returned envelope is
    /// leased to `worker_id` for `visibility`; it goes back to the queue if not
    /// acknowledged before the lease expires.
    async fn claim(
        &self,
        kind: JobKind,
        worker_id: &str,
        timeout: Duration,
        visibility: Duration,
    ) -> Result<Option<JobEnvelope>, BrokerError>;

    /// Drops the lease of a delivered envelope.
    async fn ack(&self, kind: JobKind, id: JobId) -> Result<(), BrokerError>;

    /// Extends the lease of a delivered envelope. Returns `false` if the lease
    /// was already lost.
    async fn extend_lease(
        &self,
        kind: JobKind,
        id: JobId,
        visibility: Duration,
    ) -> Result<bool, BrokerError>;

    /// Re-queues envelopes whose lease has expired. Returns how many.
    async fn reclaim_expired(&self, kind: JobKind) -> Result<usize, BrokerError>;

    async fn queue_depth(&self, kind: JobKind) -> Result<QueueDepth, BrokerError>;

    // Cache-key index

    /// Claims `key` for `job_id` unless already owned. Returns the existing
    /// owner when there is one.
    async fn reserve_cache_key(
        &self,
        key: &str,
        job_id: JobId,
        ttl: Duration,
    ) -> Result<Option<JobId>, BrokerError>;

    /// Hands `key` from `old` to `new` if `old` still owns it (or nobody does).
    async fn replace_cache_key(
        &self,
        key: &str,
        old: JobId,
        new: JobId,
        ttl: Duration,
    ) -> Result<bool, BrokerError>;

    /// Current owner of `key`, if any.
    async fn cache_owner(&self, key: &str) -> Result<Option<JobId>, BrokerError>;

    /// Releases `key` if `job_id` owns it.
    async fn release_cache_key(&self, key: &str, job_id: JobId) -> Result<(), BrokerError>;

    // Dependency edges

    async fn add_dependent(&self, dependency: JobId, dependent: JobId) -> Result<(), BrokerError>;

    async fn dependents(&self, dependency: JobId) -> Result<Vec<JobId>, BrokerError>;

    // Artifacts

    /// Stores `artifact` and its content unless one with the same fingerprint
    /// exists. Returns whichever record is stored afterwards.
    async fn register_artifact(
        &self,
        artifact: &Artifact,
        content: &[u8],
    ) -> Result<Artifact, BrokerError>;

    async fn get_artifact(&self, fingerprint: &str) -> Result<Option<Artifact>, BrokerError>;

    async fn artifact_content(&self, fingerprint: &str) -> Result<Option<Vec<u8>>, BrokerError>;

    /// Points `alias` (e.g. `host/owner/name@commit`) at an artifact.
    async fn alias_artifact(&self, alias: &str, fingerprint: &str) -> Result<(), BrokerError>;

    async fn resolve_alias(&self, alias: &str) -> Result<Option<String>, BrokerError>;

    // Results

    /// Stores `result` unless one with the same cache key exists. Returns
    /// whichever record is stored afterwards.
    async fn put_result(&self, result: &AnalysisResult) -> Result<AnalysisResult, BrokerError>;

    async fn get_result(&self, cache_key: &str) -> Result<Option<AnalysisResult>, BrokerError>;

    /// Cheap liveness probe.
    async fn ping(&self) -> Result<(), BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_error_display() {
        let err = BrokerError::ConnectionFailed("refused".to_string());
        assert!(err.to_string().contains("refused"));

        let err = BrokerError::Corrupt {
            key: "rl:job:1".to_string(),
            message: "bad json".to_string(),
        };
        assert!(err.to_string().contains("rl:job:1"));
    }

    #[test]
    fn test_queue_depth_total() {
        let depth = QueueDepth {
            kind: JobKind::Fetch,
            ready: 3,
            in_flight: 2,
        };
        assert_eq!(depth.total(), 5);
    }
}
