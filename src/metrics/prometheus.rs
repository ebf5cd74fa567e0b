//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by repolens and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all repolens metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Jobs that reached a terminal state, labeled by kind and outcome.
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Time from creation to terminal state in seconds, labeled by kind.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Envelopes waiting in each queue, labeled by kind.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of jobs currently being executed by workers in this process.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Number of running workers in this process.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Reasoning service requests, labeled by model and status.
pub static AI_REQUESTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Reasoning service latency in seconds, labeled by model.
pub static AI_REQUEST_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Failed reasoning service requests, labeled by model.
pub static AI_REQUEST_FAILURES: OnceLock<CounterVec> = OnceLock::new();

/// Tokens used, labeled by model and type (input/output).
pub static AI_TOKENS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Work avoided through caching, labeled by cache (submission, result, artifact).
pub static CACHE_HITS: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls register into a throwaway registry and
/// leave the first set of metrics in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Job metrics
    let jobs_total = CounterVec::new(
        Opts::new("repolens_jobs_total", "Jobs that reached a terminal state"),
        &["kind", "outcome"],
    )?;

    let job_duration = HistogramVec::new(
        HistogramOpts::new(
            "repolens_job_duration_seconds",
            "Time from job creation to terminal state in seconds",
        )
        .buckets(vec![0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0]),
        &["kind"],
    )?;

    // Queue metrics
    let queue_depth = GaugeVec::new(
        Opts::new("repolens_queue_depth", "Envelopes waiting to be claimed"),
        &["kind"],
    )?;

    let jobs_in_progress = Gauge::new(
        "repolens_jobs_in_progress",
        "Number of jobs currently being executed",
    )?;

    let active_workers = Gauge::new("repolens_active_workers", "Number of running workers")?;

    // Reasoning service metrics
    let ai_requests_total = CounterVec::new(
        Opts::new("repolens_ai_requests_total", "Total reasoning service requests"),
        &["model", "status"],
    )?;

    let ai_request_duration = HistogramVec::new(
        HistogramOpts::new(
            "repolens_ai_request_duration_seconds",
            "Reasoning service request latency in seconds",
        )
        .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]),
        &["model"],
    )?;

    let ai_request_failures = CounterVec::new(
        Opts::new(
            "repolens_ai_request_failures_total",
            "Failed reasoning service requests",
        ),
        &["model"],
    )?;

    let ai_tokens_total = CounterVec::new(
        Opts::new("repolens_ai_tokens_total", "Total tokens used"),
        &["model", "type"],
    )?;

    let cache_hits = CounterVec::new(
        Opts::new("repolens_cache_hits_total", "Work avoided through caching"),
        &["cache"],
    )?;

    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(ai_requests_total.clone()))?;
    registry.register(Box::new(ai_request_duration.clone()))?;
    registry.register(Box::new(ai_request_failures.clone()))?;
    registry.register(Box::new(ai_tokens_total.clone()))?;
    registry.register(Box::new(cache_hits.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = AI_REQUESTS_TOTAL.set(ai_requests_total);
    let _ = AI_REQUEST_DURATION.set(ai_request_duration);
    let _ = AI_REQUEST_FAILURES.set(ai_request_failures);
    let _ = AI_TOKENS_TOTAL.set(ai_tokens_total);
    let _ = CACHE_HITS.set(cache_hits);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// HTTP handler for the /metrics endpoint.
pub async fn metrics_handler() -> String {
    export_metrics()
}
