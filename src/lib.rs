//! repolens: queued repository fetching and AI-assisted code review.
//!
//! Clients submit fetch and analyze jobs. Fetch jobs snapshot a GitHub
//! repository at a commit; analyze jobs send a snapshot to a reasoning
//! service and store a structured report. Artifacts and results are cached
//! by content fingerprint, so equivalent work runs once.

pub mod analysis;
pub mod api;
pub mod broker;
pub mod cli;
pub mod config;
pub mod error;
pub mod fetch;
pub mod llm;
pub mod metrics;
pub mod scheduler;
pub mod storage;

// Re-export commonly used error types
pub use error::{ErrorKind, FetchError, JobError, LlmError, TaskError};
