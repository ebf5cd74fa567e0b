//! In-process broker.
//!
//! Same contract as the Redis broker, held behind a single async mutex. Used by
//! `repolens run --memory` and by tests; nothing survives a restart.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::{Broker, BrokerError, QueueDepth};
use crate::scheduler::job::{Job, JobEnvelope, JobId, JobKind};
use crate::storage::{AnalysisResult, Artifact};

struct Lease {
    envelope: JobEnvelope,
    worker_id: String,
    deadline: Instant,
}

#[derive(Default)]
struct KindQueue {
    ready: VecDeque<JobEnvelope>,
    in_flight: HashMap<JobId, Lease>,
}

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<JobId, Job>,
    active: HashSet<JobId>,
    fetch: KindQueue,
    analyze: KindQueue,
    cache_keys: HashMap<String, (JobId, Instant)>,
    dependents: HashMap<JobId, Vec<JobId>>,
    artifacts: HashMap<String, (Artifact, Vec<u8>)>,
    aliases: HashMap<String, String>,
    results: HashMap<String, AnalysisResult>,
}

impl MemoryState {
    fn queue(&mut self, kind: JobKind) -> &mut KindQueue {
        match kind {
            JobKind::Fetch => &mut self.fetch,
            JobKind::Analyze => &mut self.analyze,
        }
    }

    fn cache_owner(&self, key: &str) -> Option<JobId> {
        self.cache_keys
            .get(key)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(owner, _)| *owner)
    }
}

/// Broker keeping all state in memory.
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<MemoryState>,
    fetch_ready: Notify,
    analyze_ready: Notify,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn notifier(&self, kind: JobKind) -> &Notify {
        match kind {
            JobKind::Fetch => &self.fetch_ready,
            JobKind::Analyze => &self.analyze_ready,
        }
    }

    /// Worker currently holding the lease on `id`, if any.
    pub async fn lease_holder(&self, kind: JobKind, id: JobId) -> Option<String> {
        let mut state = self.state.lock().await;
        state
            .queue(kind)
            .in_flight
            .get(&id)
            .map(|lease| lease.worker_id.clone())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn insert_job(&self, job: &Job) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        if !job.is_terminal() {
            state.active.insert(job.id);
        }
        state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, BrokerError> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(&id).cloned())
    }

    async fn compare_and_set_job(
        &self,
        job: &Job,
        expected_revision: u64,
    ) -> Result<bool, BrokerError> {
        let mut state = self.state.lock().await;
        let current = match state.jobs.get(&job.id) {
            Some(current) => current.revision,
            None => return Ok(false),
        };
        if current != expected_revision {
            return Ok(false);
        }
        if job.is_terminal() {
            state.active.remove(&job.id);
        } else {
            state.active.insert(job.id);
        }
        state.jobs.insert(job.id, job.clone());
        Ok(true)
    }

    async fn remove_job(&self, id: JobId) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.jobs.remove(&id);
        state.active.remove(&id);
        state.dependents.remove(&id);
        Ok(())
    }

    async fn active_jobs(&self) -> Result<Vec<JobId>, BrokerError> {
        let state = self.state.lock().await;
        Ok(state.active.iter().copied().collect())
    }

    async fn enqueue(&self, envelope: &JobEnvelope) -> Result<(), BrokerError> {
        {
            let mut state = self.state.lock().await;
            state.queue(envelope.kind).ready.push_back(envelope.clone());
        }
        self.notifier(envelope.kind).notify_waiters();
        Ok(())
    }

    async fn claim(
        &self,
        kind: JobKind,
        worker_id: &str,
        timeout: Duration,
        visibility: Duration,
    ) -> Result<Option<JobEnvelope>, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notifier(kind).notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                let queue = state.queue(kind);
                if let Some(envelope) = queue.ready.pop_front() {
                    queue.in_flight.insert(
                        envelope.id,
                        Lease {
                            envelope: envelope.clone(),
                            worker_id: worker_id.to_string(),
                            deadline: Instant::now() + visibility,
                        },
                    );
                    return Ok(Some(envelope));
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, kind: JobKind, id: JobId) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.queue(kind).in_flight.remove(&id);
        Ok(())
    }

    async fn extend_lease(
        &self,
        kind: JobKind,
        id: JobId,
        visibility: Duration,
    ) -> Result<bool, BrokerError> {
        let mut state = self.state.lock().await;
        match state.queue(kind).in_flight.get_mut(&id) {
            Some(lease) => {
                lease.deadline = Instant::now() + visibility;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn reclaim_expired(&self, kind: JobKind) -> Result<usize, BrokerError> {
        let reclaimed = {
            let mut state = self.state.lock().await;
            let queue = state.queue(kind);
            let now = Instant::now();
            let expired: Vec<JobId> = queue
                .in_flight
                .iter()
                .filter(|(_, lease)| lease.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            for id in &expired {
                if let Some(lease) = queue.in_flight.remove(id) {
                    queue.ready.push_front(lease.envelope);
                }
            }
            expired.len()
        };
        if reclaimed > 0 {
            self.notifier(kind).notify_waiters();
        }
        Ok(reclaimed)
    }

    async fn queue_depth(&self, kind: JobKind) -> Result<QueueDepth, BrokerError> {
        let mut state = self.state.lock().await;
        let queue = state.queue(kind);
        Ok(QueueDepth {
            kind,
            ready: queue.ready.len(),
            in_flight: queue.in_flight.len(),
        })
    }

    async fn reserve_cache_key(
        &self,
        key: &str,
        job_id: JobId,
        ttl: Duration,
    ) -> Result<Option<JobId>, BrokerError> {
        let mut state = self.state.lock().await;
        if let Some(owner) = state.cache_owner(key) {
            return Ok(Some(owner));
        }
        state
            .cache_keys
            .insert(key.to_string(), (job_id, Instant::now() + ttl));
        Ok(None)
    }

    async fn replace_cache_key(
        &self,
        key: &str,
        old: JobId,
        new: JobId,
        ttl: Duration,
    ) -> Result<bool, BrokerError> {
        let mut state = self.state.lock().await;
        match state.cache_owner(key) {
            Some(owner) if owner != old => Ok(false),
            _ => {
                state
                    .cache_keys
                    .insert(key.to_string(), (new, Instant::now() + ttl));
                Ok(true)
            }
        }
    }

    async fn cache_owner(&self, key: &str) -> Result<Option<JobId>, BrokerError> {
        let state = self.state.lock().await;
        Ok(state.cache_owner(key))
    }

    async fn release_cache_key(&self, key: &str, job_id: JobId) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        if state.cache_keys.get(key).map(|(owner, _)| *owner) == Some(job_id) {
            state.cache_keys.remove(key);
        }
        Ok(())
    }

    async fn add_dependent(&self, dependency: JobId, dependent: JobId) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let edges = state.dependents.entry(dependency).or_default();
        if !edges.contains(&dependent) {
            edges.push(dependent);
        }
        Ok(())
    }

    async fn dependents(&self, dependency: JobId) -> Result<Vec<JobId>, BrokerError> {
        let state = self.state.lock().await;
        Ok(state.dependents.get(&dependency).cloned().unwrap_or_default())
    }

    async fn register_artifact(
        &self,
        artifact: &Artifact,
        content: &[u8],
    ) -> Result<Artifact, BrokerError> {
        let mut state = self.state.lock().await;
        let (stored, _) = state
            .artifacts
            .entry(artifact.fingerprint.clone())
            .or_insert_with(|| (artifact.clone(), content.to_vec()));
        Ok(stored.clone())
    }

    async fn get_artifact(&self, fingerprint: &str) -> Result<Option<Artifact>, BrokerError> {
        let state = self.state.lock().await;
        Ok(state.artifacts.get(fingerprint).map(|(a, _)| a.clone()))
    }

    async fn artifact_content(&self, fingerprint: &str) -> Result<Option<Vec<u8>>, BrokerError> {
        let state = self.state.lock().await;
        Ok(state.artifacts.get(fingerprint).map(|(_, c)| c.clone()))
    }

    async fn alias_artifact(&self, alias: &str, fingerprint: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state
            .aliases
            .insert(alias.to_string(), fingerprint.to_string());
        Ok(())
    }

    async fn resolve_alias(&self, alias: &str) -> Result<Option<String>, BrokerError> {
        let state = self.state.lock().await;
        Ok(state.aliases.get(alias).cloned())
    }

    async fn put_result(&self, result: &AnalysisResult) -> Result<AnalysisResult, BrokerError> {
        let mut state = self.state.lock().await;
        let stored = state
            .results
            .entry(result.cache_key.clone())
            .or_insert_with(|| result.clone());
        Ok(stored.clone())
    }

    async fn get_result(&self, cache_key: &str) -> Result<Option<AnalysisResult>, BrokerError> {
        let state = self.state.lock().await;
        Ok(state.results.get(cache_key).cloned())
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::scheduler::job::{JobInput, JobState};
    use crate::storage::RepoSnapshot;

    fn fetch_job() -> Job {
        let input = JobInput::fetch("https://github.com/o/r", "main")
            .normalized()
            .expect("valid input");
        Job::new(input, vec![])
    }

    #[tokio::test]
    async fn test_compare_and_set_rejects_stale_revision() {
        let broker = MemoryBroker::new();
        let mut job = fetch_job();
        broker.insert_job(&job).await.expect("insert");

        job.revision = 1;
        job.state = JobState::Enqueued;
        assert!(broker.compare_and_set_job(&job, 0).await.expect("cas"));

        let mut stale = job.clone();
        stale.state = JobState::Cancelled;
        stale.revision = 1;
        assert!(!broker.compare_and_set_job(&stale, 0).await.expect("cas"));

        let stored = broker.get_job(job.id).await.expect("get").expect("exists");
        assert_eq!(stored.state, JobState::Enqueued);
    }

    #[tokio::test]
    async fn test_terminal_jobs_leave_active_set() {
        let broker = MemoryBroker::new();
        let mut job = fetch_job();
        broker.insert_job(&job).await.expect("insert");
        assert_eq!(broker.active_jobs().await.expect("active"), vec![job.id]);

        job.state = JobState::Cancelled;
        job.revision = 1;
        assert!(broker.compare_and_set_job(&job, 0).await.expect("cas"));
        assert!(broker.active_jobs().await.expect("active").is_empty());
    }

    #[tokio::test]
    async fn test_claim_times_out_on_empty_queue() {
        let broker = MemoryBroker::new();
        let claimed = broker
            .claim(JobKind::Fetch, "w-0", Duration::from_millis(20), Duration::from_secs(1))
            .await
            .expect("claim");
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn test_claim_wakes_on_enqueue() {
        let broker = Arc::new(MemoryBroker::new());
        let job = fetch_job();

        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .claim(JobKind::Fetch, "w-0", Duration::from_secs(5), Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.enqueue(&job.envelope()).await.expect("enqueue");

        let claimed = waiter.await.expect("join").expect("claim");
        assert_eq!(claimed.map(|e| e.id), Some(job.id));
        assert_eq!(
            broker.lease_holder(JobKind::Fetch, job.id).await.as_deref(),
            Some("w-0")
        );
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed_once() {
        let broker = MemoryBroker::new();
        let job = fetch_job();
        broker.enqueue(&job.envelope()).await.expect("enqueue");

        let first = broker
            .claim(JobKind::Fetch, "w-0", Duration::ZERO, Duration::from_millis(10))
            .await
            .expect("claim");
        assert!(first.is_some());
        assert_eq!(broker.reclaim_expired(JobKind::Fetch).await.expect("reclaim"), 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(broker.reclaim_expired(JobKind::Fetch).await.expect("reclaim"), 1);
        assert_eq!(broker.reclaim_expired(JobKind::Fetch).await.expect("reclaim"), 0);

        let depth = broker.queue_depth(JobKind::Fetch).await.expect("depth");
        assert_eq!((depth.ready, depth.in_flight), (1, 0));
    }

    #[tokio::test]
    async fn test_acked_envelope_is_not_reclaimed() {
        let broker = MemoryBroker::new();
        let job = fetch_job();
        broker.enqueue(&job.envelope()).await.expect("enqueue");
        broker
            .claim(JobKind::Fetch, "w-0", Duration::ZERO, Duration::from_millis(1))
            .await
            .expect("claim");
        broker.ack(JobKind::Fetch, job.id).await.expect("ack");

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(broker.reclaim_expired(JobKind::Fetch).await.expect("reclaim"), 0);
    }

    #[tokio::test]
    async fn test_cache_key_ownership() {
        let broker = MemoryBroker::new();
        let (a, b, c) = (JobId::new_v4(), JobId::new_v4(), JobId::new_v4());
        let ttl = Duration::from_secs(60);

        assert_eq!(broker.reserve_cache_key("k", a, ttl).await.expect("reserve"), None);
        assert_eq!(broker.reserve_cache_key("k", b, ttl).await.expect("reserve"), Some(a));

        assert!(!broker.replace_cache_key("k", b, c, ttl).await.expect("replace"));
        assert!(broker.replace_cache_key("k", a, c, ttl).await.expect("replace"));

        broker.release_cache_key("k", a).await.expect("release");
        assert_eq!(broker.reserve_cache_key("k", b, ttl).await.expect("reserve"), Some(c));

        broker.release_cache_key("k", c).await.expect("release");
        assert_eq!(broker.reserve_cache_key("k", b, ttl).await.expect("reserve"), None);
    }

    #[tokio::test]
    async fn test_cache_key_expires() {
        let broker = MemoryBroker::new();
        let (a, b) = (JobId::new_v4(), JobId::new_v4());
        broker
            .reserve_cache_key("k", a, Duration::from_millis(5))
            .await
            .expect("reserve");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            broker
                .reserve_cache_key("k", b, Duration::from_secs(1))
                .await
                .expect("reserve"),
            None
        );
    }

    #[tokio::test]
    async fn test_first_artifact_registration_wins() {
        let broker = MemoryBroker::new();
        let snapshot = RepoSnapshot::new().with_file("a.txt", "x");
        let content = snapshot.to_bytes().expect("encode");

        let first = Artifact::describe(&snapshot, JobId::new_v4(), "https://github.com/a/a", "c1");
        let second = Artifact::describe(&snapshot, JobId::new_v4(), "https://github.com/b/b", "c2");

        let stored_first = broker.register_artifact(&first, &content).await.expect("register");
        let stored_second = broker.register_artifact(&second, &content).await.expect("register");
        assert_eq!(stored_first, first);
        assert_eq!(stored_second, first);
    }

    #[tokio::test]
    async fn test_dependents_are_deduplicated() {
        let broker = MemoryBroker::new();
        let (a, b) = (JobId::new_v4(), JobId::new_v4());
        broker.add_dependent(a, b).await.expect("edge");
        broker.add_dependent(a, b).await.expect("edge");
        assert_eq!(broker.dependents(a).await.expect("dependents"), vec![b]);
    }
}
