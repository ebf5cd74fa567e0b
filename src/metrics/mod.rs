//! Metrics module for Prometheus-based monitoring.
//!
//! Job outcomes and durations, queue depth, worker counts, reasoning service
//! usage and cache hits.
//!
//! # Example
//!
//! ```ignore
//! use repolens::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_cache_hit(repolens::metrics::cache::RESULT);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use self::collectors::{cache, MetricsCollector, TokenUsage};
pub use self::prometheus::{export_metrics, init_metrics, metrics_handler};

pub use self::prometheus::{
    ACTIVE_WORKERS, AI_REQUESTS_TOTAL, AI_REQUEST_DURATION, AI_REQUEST_FAILURES, AI_TOKENS_TOTAL,
    CACHE_HITS, JOBS_IN_PROGRESS, JOBS_TOTAL, JOB_DURATION, QUEUE_DEPTH, REGISTRY,
};
