//! Redis-backed broker.
//!
//! # Key layout
//!
//! All keys share a configurable prefix (`repolens` by default):
//!
//! - `{prefix}:job:{id}`: job record (JSON)
//! - `{prefix}:jobs:active`: set of non-terminal job ids
//! - `{prefix}:queue:{kind}`: ready list (LPUSH to enqueue, RPOP to claim)
//! - `{prefix}:queue:{kind}:inflight`: hash `id → envelope` of leased jobs
//! - `{prefix}:queue:{kind}:leases`: sorted set `id → lease deadline (ms)`
//! - `{prefix}:queue:{kind}:workers`: hash `id → worker holding the lease`
//! - `{prefix}:cache:{key}`: owning job id, with TTL
//! - `{prefix}:dependents:{id}`: set of dependent job ids
//! - `{prefix}:artifact:{fp}` / `{prefix}:artifact:{fp}:content`
//! - `{prefix}:alias:{alias}`: artifact fingerprint
//! - `{prefix}:result:{key}`: analysis result (JSON)
//!
//! # Atomicity
//!
//! Every multi-key step runs as a Lua script so that concurrent coordinators
//! and workers never observe half-applied state. Scripts only decode JSON, they
//! never re-encode it.
//!
//! Claims poll with a non-blocking pop instead of a blocking command so the
//! shared multiplexed connection is never parked.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::debug;

use super::{Broker, BrokerError, QueueDepth};
use crate::scheduler::job::{Job, JobEnvelope, JobId, JobKind};
use crate::storage::{AnalysisResult, Artifact};

/// Default key prefix.
pub const DEFAULT_PREFIX: &str = "repolens";

/// Longest sleep between two pops while waiting for work.
const CLAIM_POLL_STEP: Duration = Duration::from_millis(200);

const CAS_JOB: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
  return 0
end
local record = cjson.decode(current)
if tonumber(record['revision']) ~= tonumber(ARGV[1]) then
  return 0
end
redis.call('SET', KEYS[1], ARGV[2])
if ARGV[3] == '1' then
  redis.call('SREM', KEYS[2], ARGV[4])
else
  redis.call('SADD', KEYS[2], ARGV[4])
end
return 1
"#;

const CLAIM: &str = r#"
local data = redis.call('RPOP', KEYS[1])
if not data then
  return false
end
local envelope = cjson.decode(data)
redis.call('HSET', KEYS[2], envelope['id'], data)
redis.call('ZADD', KEYS[3], ARGV[1], envelope['id'])
redis.call('HSET', KEYS[4], envelope['id'], ARGV[2])
return data
"#;

const EXTEND_LEASE: &str = r#"
if redis.call('ZSCORE', KEYS[1], ARGV[1]) then
  redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
  return 1
end
return 0
"#;

const RECLAIM: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
local count = 0
for _, id in ipairs(expired) do
  local data = redis.call('HGET', KEYS[2], id)
  redis.call('ZREM', KEYS[1], id)
  redis.call('HDEL', KEYS[2], id)
  redis.call('HDEL', KEYS[4], id)
  if data then
    redis.call('RPUSH', KEYS[3], data)
    count = count + 1
  end
end
return count
"#;

const RESERVE_CACHE_KEY: &str = r#"
local owner = redis.call('GET', KEYS[1])
if owner then
  return owner
end
redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[2])
return false
"#;

const REPLACE_CACHE_KEY: &str = r#"
local owner = redis.call('GET', KEYS[1])
if owner and owner ~= ARGV[1] then
  return 0
end
redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
return 1
"#;

const RELEASE_CACHE_KEY: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

const PUT_IF_ABSENT: &str = r#"
local existing = redis.call('GET', KEYS[1])
if existing then
  return existing
end
redis.call('SET', KEYS[1], ARGV[1])
if KEYS[2] then
  redis.call('SET', KEYS[2], ARGV[2])
end
return ARGV[1]
"#;

struct Scripts {
    cas_job: Script,
    claim: Script,
    extend_lease: Script,
    reclaim: Script,
    reserve_cache_key: Script,
    replace_cache_key: Script,
    release_cache_key: Script,
    put_if_absent: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            cas_job: Script::new(CAS_JOB),
            claim: Script::new(CLAIM),
            extend_lease: Script::new(EXTEND_LEASE),
            reclaim: Script::new(RECLAIM),
            reserve_cache_key: Script::new(RESERVE_CACHE_KEY),
            replace_cache_key: Script::new(REPLACE_CACHE_KEY),
            release_cache_key: Script::new(RELEASE_CACHE_KEY),
            put_if_absent: Script::new(PUT_IF_ABSENT),
        }
    }
}

/// Broker storing everything in Redis.
///
/// Lease deadlines use the local wall clock, so processes sharing a Redis
/// instance are expected to have roughly synchronized clocks.
pub struct RedisBroker {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    prefix: String,
    scripts: Scripts,
}

impl RedisBroker {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, prefix: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, prefix))
    }

    /// Creates a broker from an existing ConnectionManager.
    pub fn from_connection(redis: ConnectionManager, prefix: &str) -> Self {
        Self {
            redis,
            prefix: prefix.trim_end_matches(':').to_string(),
            scripts: Scripts::load(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn job_key(&self, id: JobId) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    fn active_key(&self) -> String {
        format!("{}:jobs:active", self.prefix)
    }

    fn queue_key(&self, kind: JobKind) -> String {
        format!("{}:queue:{}", self.prefix, kind)
    }

    fn inflight_key(&self, kind: JobKind) -> String {
        format!("{}:queue:{}:inflight", self.prefix, kind)
    }

    fn leases_key(&self, kind: JobKind) -> String {
        format!("{}:queue:{}:leases", self.prefix, kind)
    }

    fn workers_key(&self, kind: JobKind) -> String {
        format!("{}:queue:{}:workers", self.prefix, kind)
    }

    fn cache_key(&self, key: &str) -> String {
        format!("{}:cache:{}", self.prefix, key)
    }

    fn dependents_key(&self, id: JobId) -> String {
        format!("{}:dependents:{}", self.prefix, id)
    }

    fn artifact_key(&self, fingerprint: &str) -> String {
        format!("{}:artifact:{}", self.prefix, fingerprint)
    }

    fn artifact_content_key(&self, fingerprint: &str) -> String {
        format!("{}:artifact:{}:content", self.prefix, fingerprint)
    }

    fn alias_key(&self, alias: &str) -> String {
        format!("{}:alias:{}", self.prefix, alias)
    }

    fn result_key(&self, cache_key: &str) -> String {
        format!("{}:result:{}", self.prefix, cache_key)
    }

    /// Deletes every key under the prefix. Used by tests.
    pub async fn clear(&self) -> Result<usize, BrokerError> {
        let mut conn = self.redis.clone();
        let pattern = format!("{}:*", self.prefix);
        let keys: Vec<String> = conn.keys(&pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        conn.del::<_, ()>(&keys).await?;
        Ok(keys.len())
    }

    async fn try_claim(
        &self,
        kind: JobKind,
        worker_id: &str,
        visibility: Duration,
    ) -> Result<Option<JobEnvelope>, BrokerError> {
        let mut conn = self.redis.clone();
        let data: Option<String> = self
            .scripts
            .claim
            .key(self.queue_key(kind))
            .key(self.inflight_key(kind))
            .key(self.leases_key(kind))
            .key(self.workers_key(kind))
            .arg(deadline_ms(visibility))
            .arg(worker_id)
            .invoke_async(&mut conn)
            .await?;

        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn deadline_ms(visibility: Duration) -> i64 {
    now_ms() + visibility.as_millis() as i64
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

fn parse_job_id(key: &str, raw: &str) -> Result<JobId, BrokerError> {
    JobId::parse_str(raw).map_err(|e| BrokerError::Corrupt {
        key: key.to_string(),
        message: e.to_string(),
    })
}

#[async_trait]
impl Broker for RedisBroker {
    async fn insert_job(&self, job: &Job) -> Result<(), BrokerError> {
        let serialized = serde_json::to_string(job)?;
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.atomic().set(self.job_key(job.id), serialized);
        if !job.is_terminal() {
            pipe.sadd(self.active_key(), job.id.to_string());
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, BrokerError> {
        let mut conn = self.redis.clone();
        let data: Option<String> = conn.get(self.job_key(id)).await?;
        match data {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn compare_and_set_job(
        &self,
        job: &Job,
        expected_revision: u64,
    ) -> Result<bool, BrokerError> {
        let serialized = serde_json::to_string(job)?;
        let mut conn = self.redis.clone();
        let swapped: i32 = self
            .scripts
            .cas_job
            .key(self.job_key(job.id))
            .key(self.active_key())
            .arg(expected_revision)
            .arg(serialized)
            .arg(if job.is_terminal() { "1" } else { "0" })
            .arg(job.id.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    async fn remove_job(&self, id: JobId) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(self.job_key(id))
            .srem(self.active_key(), id.to_string())
            .del(self.dependents_key(id));
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn active_jobs(&self) -> Result<Vec<JobId>, BrokerError> {
        let mut conn = self.redis.clone();
        let key = self.active_key();
        let members: Vec<String> = conn.smembers(&key).await?;
        members.iter().map(|m| parse_job_id(&key, m)).collect()
    }

    async fn enqueue(&self, envelope: &JobEnvelope) -> Result<(), BrokerError> {
        let serialized = serde_json::to_string(envelope)?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(self.queue_key(envelope.kind), serialized)
            .await?;
        Ok(())
    }

    async fn claim(
        &self,
        kind: JobKind,
        worker_id: &str,
        timeout: Duration,
        visibility: Duration,
    ) -> Result<Option<JobEnvelope>, BrokerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(envelope) = self.try_claim(kind, worker_id, visibility).await? {
                return Ok(Some(envelope));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(CLAIM_POLL_STEP.min(deadline - now)).await;
        }
    }

    async fn ack(&self, kind: JobKind, id: JobId) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        let id = id.to_string();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hdel(self.inflight_key(kind), &id)
            .zrem(self.leases_key(kind), &id)
            .hdel(self.workers_key(kind), &id);
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn extend_lease(
        &self,
        kind: JobKind,
        id: JobId,
        visibility: Duration,
    ) -> Result<bool, BrokerError> {
        let mut conn = self.redis.clone();
        let extended: i32 = self
            .scripts
            .extend_lease
            .key(self.leases_key(kind))
            .arg(id.to_string())
            .arg(deadline_ms(visibility))
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn reclaim_expired(&self, kind: JobKind) -> Result<usize, BrokerError> {
        let mut conn = self.redis.clone();
        let reclaimed: usize = self
            .scripts
            .reclaim
            .key(self.leases_key(kind))
            .key(self.inflight_key(kind))
            .key(self.queue_key(kind))
            .key(self.workers_key(kind))
            .arg(now_ms())
            .invoke_async(&mut conn)
            .await?;
        if reclaimed > 0 {
            debug!(kind = %kind, reclaimed, "Re-queued expired leases");
        }
        Ok(reclaimed)
    }

    async fn queue_depth(&self, kind: JobKind) -> Result<QueueDepth, BrokerError> {
        let mut conn = self.redis.clone();
        let (ready, in_flight): (usize, usize) = redis::pipe()
            .llen(self.queue_key(kind))
            .hlen(self.inflight_key(kind))
            .query_async(&mut conn)
            .await?;
        Ok(QueueDepth {
            kind,
            ready,
            in_flight,
        })
    }

    async fn reserve_cache_key(
        &self,
        key: &str,
        job_id: JobId,
        ttl: Duration,
    ) -> Result<Option<JobId>, BrokerError> {
        let mut conn = self.redis.clone();
        let redis_key = self.cache_key(key);
        let owner: Option<String> = self
            .scripts
            .reserve_cache_key
            .key(&redis_key)
            .arg(job_id.to_string())
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await?;
        owner.map(|o| parse_job_id(&redis_key, &o)).transpose()
    }

    async fn replace_cache_key(
        &self,
        key: &str,
        old: JobId,
        new: JobId,
        ttl: Duration,
    ) -> Result<bool, BrokerError> {
        let mut conn = self.redis.clone();
        let replaced: i32 = self
            .scripts
            .replace_cache_key
            .key(self.cache_key(key))
            .arg(old.to_string())
            .arg(new.to_string())
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(replaced == 1)
    }

    async fn cache_owner(&self, key: &str) -> Result<Option<JobId>, BrokerError> {
        let mut conn = self.redis.clone();
        let redis_key = self.cache_key(key);
        let owner: Option<String> = conn.get(&redis_key).await?;
        owner.map(|o| parse_job_id(&redis_key, &o)).transpose()
    }

    async fn release_cache_key(&self, key: &str, job_id: JobId) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        self.scripts
            .release_cache_key
            .key(self.cache_key(key))
            .arg(job_id.to_string())
            .invoke_async::<_, i32>(&mut conn)
            .await?;
        Ok(())
    }

    async fn add_dependent(&self, dependency: JobId, dependent: JobId) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        conn.sadd::<_, _, ()>(self.dependents_key(dependency), dependent.to_string())
            .await?;
        Ok(())
    }

    async fn dependents(&self, dependency: JobId) -> Result<Vec<JobId>, BrokerError> {
        let mut conn = self.redis.clone();
        let key = self.dependents_key(dependency);
        let members: Vec<String> = conn.smembers(&key).await?;
        members.iter().map(|m| parse_job_id(&key, m)).collect()
    }

    async fn register_artifact(
        &self,
        artifact: &Artifact,
        content: &[u8],
    ) -> Result<Artifact, BrokerError> {
        let serialized = serde_json::to_string(artifact)?;
        let mut conn = self.redis.clone();
        let stored: String = self
            .scripts
            .put_if_absent
            .key(self.artifact_key(&artifact.fingerprint))
            .key(self.artifact_content_key(&artifact.fingerprint))
            .arg(serialized)
            .arg(content)
            .invoke_async(&mut conn)
            .await?;
        Ok(serde_json::from_str(&stored)?)
    }

    async fn get_artifact(&self, fingerprint: &str) -> Result<Option<Artifact>, BrokerError> {
        let mut conn = self.redis.clone();
        let data: Option<String> = conn.get(self.artifact_key(fingerprint)).await?;
        match data {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn artifact_content(&self, fingerprint: &str) -> Result<Option<Vec<u8>>, BrokerError> {
        let mut conn = self.redis.clone();
        let data: Option<Vec<u8>> = conn.get(self.artifact_content_key(fingerprint)).await?;
        Ok(data)
    }

    async fn alias_artifact(&self, alias: &str, fingerprint: &str) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        conn.set::<_, _, ()>(self.alias_key(alias), fingerprint)
            .await?;
        Ok(())
    }

    async fn resolve_alias(&self, alias: &str) -> Result<Option<String>, BrokerError> {
        let mut conn = self.redis.clone();
        let fingerprint: Option<String> = conn.get(self.alias_key(alias)).await?;
        Ok(fingerprint)
    }

    async fn put_result(&self, result: &AnalysisResult) -> Result<AnalysisResult, BrokerError> {
        let serialized = serde_json::to_string(result)?;
        let mut conn = self.redis.clone();
        let stored: String = self
            .scripts
            .put_if_absent
            .key(self.result_key(&result.cache_key))
            .arg(serialized)
            .invoke_async(&mut conn)
            .await?;
        Ok(serde_json::from_str(&stored)?)
    }

    async fn get_result(&self, cache_key: &str) -> Result<Option<AnalysisResult>, BrokerError> {
        let mut conn = self.redis.clone();
        let data: Option<String> = conn.get(self.result_key(cache_key)).await?;
        match data {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }
}
