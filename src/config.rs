//! Runtime configuration.
//!
//! Every setting is a command-line flag with an environment fallback, so the
//! same binary runs from a shell, a `.env` file or a container manifest.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use thiserror::Error;

use crate::analysis::AnalysisConfig;
use crate::broker::{Broker, BrokerError, MemoryBroker, RedisBroker};
use crate::error::LlmError;
use crate::fetch::{FetchConfig, GITHUB_API_BASE, GITHUB_RAW_BASE};
use crate::llm::litellm::{LiteLlmClient, DEFAULT_MODEL, OPENROUTER_API_BASE};
use crate::scheduler::coordinator::CoordinatorConfig;
use crate::scheduler::job::JobKind;
use crate::scheduler::retry::RetryPolicy;
use crate::scheduler::worker_pool::WorkerPoolConfig;

/// Invalid combination of settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },

    #[error("base delay ({base:?}) exceeds max delay ({max:?})")]
    DelayOrder { base: Duration, max: Duration },

    #[error("{inner} ({inner_secs}s) must be shorter than {outer} ({outer_secs}s)")]
    TimeoutOrder {
        inner: &'static str,
        inner_secs: u64,
        outer: &'static str,
        outer_secs: u64,
    },
}

/// Settings shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct AppConfig {
    /// Redis connection URL.
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Prefix of every broker key.
    #[arg(long, env = "REPOLENS_QUEUE_PREFIX", default_value = "repolens")]
    pub queue_prefix: String,

    /// Workers in the fetch pool.
    #[arg(long, env = "REPOLENS_FETCH_WORKERS", default_value_t = 4)]
    pub fetch_workers: usize,

    /// Workers in the analysis pool.
    #[arg(long, env = "REPOLENS_ANALYSIS_WORKERS", default_value_t = 2)]
    pub analysis_workers: usize,

    /// Delay between claims on an empty queue, in milliseconds.
    #[arg(long, env = "REPOLENS_POLL_INTERVAL_MS", default_value_t = 500)]
    pub poll_interval_ms: u64,

    /// Lease held by a worker on a claimed job, in seconds.
    #[arg(long, env = "REPOLENS_VISIBILITY_TIMEOUT_SECS", default_value_t = 600)]
    pub visibility_timeout_secs: u64,

    /// Bound on a single attempt of a job, in seconds.
    #[arg(long, env = "REPOLENS_JOB_TIMEOUT_SECS", default_value_t = 300)]
    pub job_timeout_secs: u64,

    /// Age after which a non-terminal job is failed as timed out, in seconds.
    #[arg(long, env = "REPOLENS_JOB_MAX_LIFETIME_SECS", default_value_t = 3600)]
    pub job_max_lifetime_secs: u64,

    /// How long results and artifacts stay cached, in seconds.
    #[arg(long, env = "REPOLENS_CACHE_TTL_SECS", default_value_t = 86_400)]
    pub cache_ttl_secs: u64,

    /// Attempts per job, counting the first.
    #[arg(long, env = "REPOLENS_MAX_ATTEMPTS", default_value_t = 3)]
    pub max_attempts: u32,

    /// First retry delay, in milliseconds.
    #[arg(long, env = "REPOLENS_BASE_DELAY_MS", default_value_t = 1000)]
    pub base_delay_ms: u64,

    /// Cap on retry delays, in milliseconds.
    #[arg(long, env = "REPOLENS_MAX_DELAY_MS", default_value_t = 30_000)]
    pub max_delay_ms: u64,

    /// Interval of the lease and lifetime sweeper, in seconds.
    #[arg(long, env = "REPOLENS_SWEEP_INTERVAL_SECS", default_value_t = 15)]
    pub sweep_interval_secs: u64,

    /// Address the API listens on.
    #[arg(long, env = "REPOLENS_BIND", default_value = "0.0.0.0:8080")]
    pub bind: SocketAddr,

    /// GitHub REST API base URL.
    #[arg(long, env = "GITHUB_API_BASE", default_value = GITHUB_API_BASE)]
    pub github_api_base: String,

    /// GitHub raw-content base URL.
    #[arg(long, env = "GITHUB_RAW_BASE", default_value = GITHUB_RAW_BASE)]
    pub github_raw_base: String,

    /// GitHub token, raising the API rate limit.
    #[arg(long, env = "GITHUB_API_TOKEN", hide_env_values = true)]
    pub github_token: Option<String>,

    /// Bound on one GitHub request, in seconds.
    #[arg(long, env = "REPOLENS_FETCH_TIMEOUT_SECS", default_value_t = 30)]
    pub fetch_timeout_secs: u64,

    /// Files kept per snapshot.
    #[arg(long, env = "REPOLENS_MAX_FILES", default_value_t = 500)]
    pub max_files: usize,

    /// Largest file kept in a snapshot, in bytes.
    #[arg(long, env = "REPOLENS_MAX_FILE_BYTES", default_value_t = 256 * 1024)]
    pub max_file_bytes: u64,

    /// OpenAI-compatible endpoint of the reasoning service.
    #[arg(long, env = "LITELLM_API_BASE")]
    pub llm_api_base: Option<String>,

    /// Key for `--llm-api-base`.
    #[arg(long, env = "LITELLM_API_KEY", hide_env_values = true)]
    pub llm_api_key: Option<String>,

    /// OpenRouter key, used when no endpoint is set.
    #[arg(long, env = "OPENROUTER_API_KEY", hide_env_values = true)]
    pub openrouter_api_key: Option<String>,

    /// Model used for analysis.
    #[arg(long, env = "LITELLM_DEFAULT_MODEL", default_value = DEFAULT_MODEL)]
    pub model: String,

    /// Bound on one reasoning request, in seconds.
    #[arg(long, env = "REPOLENS_REASONING_TIMEOUT_SECS", default_value_t = 180)]
    pub reasoning_timeout_secs: u64,

    /// Snapshot bytes included in an analysis prompt.
    #[arg(long, env = "REPOLENS_MAX_PROMPT_BYTES", default_value_t = 200_000)]
    pub max_prompt_bytes: usize,
}

impl AppConfig {
    /// Rejects settings no component can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive: [(&'static str, u64); 7] = [
            ("max_attempts", u64::from(self.max_attempts)),
            ("visibility_timeout_secs", self.visibility_timeout_secs),
            ("job_timeout_secs", self.job_timeout_secs),
            ("job_max_lifetime_secs", self.job_max_lifetime_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("fetch_timeout_secs", self.fetch_timeout_secs),
            ("reasoning_timeout_secs", self.reasoning_timeout_secs),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero { name: *name });
        }
        if self.max_files == 0 {
            return Err(ConfigError::Zero { name: "max_files" });
        }

        let base = Duration::from_millis(self.base_delay_ms);
        let max = Duration::from_millis(self.max_delay_ms);
        if base > max {
            return Err(ConfigError::DelayOrder { base, max });
        }

        // A request must end inside its attempt, and an attempt inside its
        // lease, or a second worker picks up a job still being run.
        let nested: [(&'static str, u64, &'static str, u64); 3] = [
            ("fetch_timeout_secs", self.fetch_timeout_secs, "job_timeout_secs", self.job_timeout_secs),
            (
                "reasoning_timeout_secs",
                self.reasoning_timeout_secs,
                "job_timeout_secs",
                self.job_timeout_secs,
            ),
            (
                "job_timeout_secs",
                self.job_timeout_secs,
                "visibility_timeout_secs",
                self.visibility_timeout_secs,
            ),
        ];
        for (inner, inner_secs, outer, outer_secs) in nested {
            if inner_secs >= outer_secs {
                return Err(ConfigError::TimeoutOrder {
                    inner,
                    inner_secs,
                    outer,
                    outer_secs,
                });
            }
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig::default()
            .with_cache_ttl(Duration::from_secs(self.cache_ttl_secs))
            .with_job_max_lifetime(Duration::from_secs(self.job_max_lifetime_secs))
            .with_repo_host(self.fetch_config().host)
    }

    /// Pool settings for `kind`, sized by the matching worker count.
    pub fn pool_config(&self, kind: JobKind) -> WorkerPoolConfig {
        let workers = match kind {
            JobKind::Fetch => self.fetch_workers,
            JobKind::Analyze => self.analysis_workers,
        };
        WorkerPoolConfig::new(kind, workers)
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
            .with_visibility_timeout(Duration::from_secs(self.visibility_timeout_secs))
            .with_job_timeout(Duration::from_secs(self.job_timeout_secs))
            .with_retry(self.retry_policy())
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig::default()
            .with_base_urls(&self.github_api_base, &self.github_raw_base)
            .with_token(self.github_token.clone())
            .with_request_timeout(Duration::from_secs(self.fetch_timeout_secs))
            .with_limits(self.max_files, self.max_file_bytes)
    }

    pub fn analysis_config(&self) -> AnalysisConfig {
        AnalysisConfig::default()
            .with_max_prompt_bytes(self.max_prompt_bytes)
            .with_reasoning_timeout(Duration::from_secs(self.reasoning_timeout_secs))
    }

    /// Builds the reasoning client.
    ///
    /// An explicit endpoint wins; otherwise an OpenRouter key selects
    /// OpenRouter.
    pub fn llm_client(&self) -> Result<LiteLlmClient, LlmError> {
        let timeout = Duration::from_secs(self.reasoning_timeout_secs);
        match (&self.llm_api_base, &self.openrouter_api_key) {
            (Some(base), _) => {
                let key = self
                    .llm_api_key
                    .clone()
                    .or_else(|| self.openrouter_api_key.clone());
                LiteLlmClient::with_timeout(base, key, &self.model, timeout)
            }
            (None, Some(key)) => LiteLlmClient::with_timeout(
                OPENROUTER_API_BASE,
                Some(key.clone()),
                &self.model,
                timeout,
            ),
            (None, None) => Err(LlmError::MissingApiBase),
        }
    }

    /// Connects to Redis, or builds an in-process broker when `memory` is set.
    pub async fn connect_broker(&self, memory: bool) -> Result<Arc<dyn Broker>, BrokerError> {
        if memory {
            return Ok(Arc::new(MemoryBroker::new()));
        }
        let broker = RedisBroker::connect(&self.redis_url, &self.queue_prefix).await?;
        Ok(Arc::new(broker))
    }
}
