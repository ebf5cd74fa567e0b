//! High-level recording helpers over the raw Prometheus metrics.
//!
//! Every method is a no-op until `init_metrics()` has run, so library code can
//! record unconditionally.

use super::prometheus::{
    ACTIVE_WORKERS, AI_REQUESTS_TOTAL, AI_REQUEST_DURATION, AI_REQUEST_FAILURES,
    AI_TOKENS_TOTAL, CACHE_HITS, JOBS_IN_PROGRESS, JOBS_TOTAL, JOB_DURATION, QUEUE_DEPTH,
};
use crate::scheduler::job::{Job, JobKind};

/// Token usage information for reasoning service requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    /// Number of input/prompt tokens.
    pub input_tokens: u64,
    /// Number of output/completion tokens.
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Cache names used as the `cache` label.
pub mod cache {
    /// An identical submission was already in flight.
    pub const SUBMISSION: &str = "submission";
    /// An analysis result was reused.
    pub const RESULT: &str = "result";
    /// A fetch mapped onto an existing artifact.
    pub const ARTIFACT: &str = "artifact";
}

/// Metrics collector for recording repolens operational metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a job reaching a terminal state.
    pub fn record_job_finished(&self, job: &Job) {
        let outcome = job.state.as_str();
        let duration_secs = (job.updated_at - job.created_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total
                .with_label_values(&[job.kind.as_str(), outcome])
                .inc();
        }

        if let Some(job_duration) = JOB_DURATION.get() {
            job_duration
                .with_label_values(&[job.kind.as_str()])
                .observe(duration_secs);
        }

        tracing::trace!(
            job_id = %job.id,
            kind = %job.kind,
            outcome = outcome,
            duration_secs = duration_secs,
            "Recorded job metric"
        );
    }

    /// Record a reasoning service request.
    pub fn record_ai_request(
        &self,
        model: &str,
        success: bool,
        latency_secs: f64,
        tokens: TokenUsage,
    ) {
        let status = if success { "success" } else { "failure" };

        if let Some(requests) = AI_REQUESTS_TOTAL.get() {
            requests.with_label_values(&[model, status]).inc();
        }

        if let Some(latency) = AI_REQUEST_DURATION.get() {
            latency.with_label_values(&[model]).observe(latency_secs);
        }

        if !success {
            if let Some(failures) = AI_REQUEST_FAILURES.get() {
                failures.with_label_values(&[model]).inc();
            }
        }

        if let Some(ai_tokens) = AI_TOKENS_TOTAL.get() {
            ai_tokens
                .with_label_values(&[model, "input"])
                .inc_by(tokens.input_tokens as f64);
            ai_tokens
                .with_label_values(&[model, "output"])
                .inc_by(tokens.output_tokens as f64);
        }

        tracing::trace!(
            model = model,
            status = status,
            latency_secs = latency_secs,
            input_tokens = tokens.input_tokens,
            output_tokens = tokens.output_tokens,
            "Recorded reasoning request metric"
        );
    }

    /// Record work avoided through one of the caches in [`cache`].
    pub fn record_cache_hit(&self, cache: &str) {
        if let Some(hits) = CACHE_HITS.get() {
            hits.with_label_values(&[cache]).inc();
        }
    }

    pub fn update_queue_depth(&self, kind: JobKind, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth
                .with_label_values(&[kind.as_str()])
                .set(depth as f64);
        }

        tracing::trace!(kind = %kind, depth = depth, "Updated queue depth metric");
    }

    pub fn inc_workers(&self) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.inc();
        }
    }

    pub fn dec_workers(&self) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.dec();
        }
    }

    pub fn inc_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.inc();
        }
    }

    pub fn dec_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.dec();
        }
    }
}
