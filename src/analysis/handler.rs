//! Worker-side execution of analysis jobs.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use super::prompt::{build_prompt, focus_areas, SYSTEM_PROMPT};
use super::report::parse_report;
use super::AnalysisConfig;
use crate::broker::Broker;
use crate::error::{ErrorKind, LlmError, TaskError};
use crate::llm::{GenerationRequest, LlmProvider, Message};
use crate::metrics::{cache, MetricsCollector, TokenUsage};
use crate::scheduler::job::{AnalysisSource, Job, JobInput, JobKind, JobState, ResultRef};
use crate::scheduler::worker_pool::{JobContext, JobHandler};
use crate::storage::{result_key, AnalysisResult, RepoSnapshot};

/// Runs the fixed analysis prompt over an artifact and stores the result.
pub struct AnalysisHandler {
    provider: Arc<dyn LlmProvider>,
    config: AnalysisConfig,
    metrics: MetricsCollector,
}

impl AnalysisHandler {
    pub fn new(provider: Arc<dyn LlmProvider>, config: AnalysisConfig) -> Self {
        Self {
            provider,
            config,
            metrics: MetricsCollector::new(),
        }
    }

    /// Fingerprint of the artifact the job analyzes.
    async fn artifact_fingerprint(
        &self,
        job: &Job,
        source: &AnalysisSource,
        broker: &Arc<dyn Broker>,
    ) -> Result<String, TaskError> {
        if let AnalysisSource::Artifact { fingerprint } = source {
            return Ok(fingerprint.clone());
        }

        for dependency in &job.dependencies {
            let Some(dep) = broker.get_job(*dependency).await? else {
                continue;
            };
            if dep.state != JobState::Succeeded {
                continue;
            }
            if let Some(ResultRef::Artifact { fingerprint }) = dep.result {
                return Ok(fingerprint);
            }
        }

        Err(TaskError::permanent(
            ErrorKind::InvalidArtifact,
            "no succeeded fetch dependency produced an artifact",
        ))
    }

    async fn load_snapshot(
        &self,
        fingerprint: &str,
        broker: &Arc<dyn Broker>,
    ) -> Result<RepoSnapshot, TaskError> {
        let content = broker.artifact_content(fingerprint).await?.ok_or_else(|| {
            TaskError::permanent(
                ErrorKind::InvalidArtifact,
                format!("artifact {} has no stored content", fingerprint),
            )
        })?;
        let snapshot = RepoSnapshot::from_bytes(&content).map_err(|e| {
            TaskError::permanent(
                ErrorKind::InvalidArtifact,
                format!("artifact {} is unreadable: {}", fingerprint, e),
            )
        })?;
        if snapshot.is_empty() {
            return Err(TaskError::permanent(
                ErrorKind::InvalidArtifact,
                format!("artifact {} contains no text files", fingerprint),
            ));
        }
        Ok(snapshot)
    }
}

#[async_trait]
impl JobHandler for AnalysisHandler {
    fn kind(&self) -> JobKind {
        JobKind::Analyze
    }

    async fn handle(&self, job: &Job, ctx: &JobContext) -> Result<ResultRef, TaskError> {
        let JobInput::Analyze(input) = &job.input else {
            return Err(TaskError::permanent(
                ErrorKind::Internal,
                format!("job {} is not an analysis job", job.id),
            ));
        };
        let broker = ctx.broker();
        let params = &input.params;
        let params_fingerprint = params.fingerprint();

        let fingerprint = self.artifact_fingerprint(job, &input.source, broker).await?;
        let cache_key = result_key(&fingerprint, &params_fingerprint);

        if let Some(existing) = broker.get_result(&cache_key).await? {
            self.metrics.record_cache_hit(cache::RESULT);
            debug!(job_id = %job.id, cache_key = %cache_key, produced_by = %existing.job_id, "Reusing stored result");
            return Ok(ResultRef::Analysis { cache_key });
        }

        let snapshot = self.load_snapshot(&fingerprint, broker).await?;

        ctx.checkpoint().await?;

        let model = params
            .model
            .clone()
            .unwrap_or_else(|| self.provider.default_model().to_string());
        let prompt = build_prompt(&snapshot, params, self.config.max_prompt_bytes);
        let mut request = GenerationRequest::new(
            model.clone(),
            vec![Message::system(SYSTEM_PROMPT), Message::user(prompt)],
        )
        .with_temperature(self.config.temperature);
        if let Some(max_tokens) = params.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }

        let start = Instant::now();
        let response = match tokio::time::timeout(
            self.config.reasoning_timeout,
            self.provider.generate(request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout(self.config.reasoning_timeout)),
        };
        let latency = start.elapsed().as_secs_f64();

        let response = match response {
            Ok(response) => {
                let usage = TokenUsage::new(
                    response.usage.prompt_tokens as u64,
                    response.usage.completion_tokens as u64,
                );
                self.metrics.record_ai_request(&model, true, latency, usage);
                response
            }
            Err(e) => {
                self.metrics
                    .record_ai_request(&model, false, latency, TokenUsage::default());
                warn!(
                    job_id = %job.id,
                    model = %model,
                    attempt = ctx.attempt(),
                    error = %e,
                    "Reasoning request failed"
                );
                return Err(e.into());
            }
        };

        let content = response
            .first_content()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                TaskError::transient(ErrorKind::ServiceUnavailable, "reasoning service returned no content")
            })?;

        let report = parse_report(content, &focus_areas(params));
        if report.raw.is_some() {
            debug!(job_id = %job.id, "Response was not structured, keeping raw text");
        }

        let result = AnalysisResult {
            job_id: job.id,
            cache_key: cache_key.clone(),
            artifact_fingerprint: fingerprint,
            params_fingerprint,
            model: if response.model.is_empty() {
                model
            } else {
                response.model.clone()
            },
            report,
            created_at: Utc::now(),
        };
        let stored = broker.put_result(&result).await?;

        info!(
            job_id = %job.id,
            cache_key = %stored.cache_key,
            findings = stored.report.finding_count(),
            latency_secs = latency,
            "Analysis stored"
        );
        Ok(ResultRef::Analysis {
            cache_key: stored.cache_key,
        })
    }
}
