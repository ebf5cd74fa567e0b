//! AI-assisted analysis of fetched artifacts.
//!
//! An analysis job loads a snapshot, asks the reasoning service for a
//! structured review ([`prompt`]), parses the answer ([`report`]) and stores
//! it under the result key `(artifact fingerprint, parameter fingerprint)`.

pub mod handler;
pub mod prompt;
pub mod report;

use std::time::Duration;

pub use handler::AnalysisHandler;
pub use prompt::{build_prompt, SYSTEM_PROMPT};
pub use report::{extract_json_object, parse_report};

/// Settings for [`AnalysisHandler`].
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    /// Snapshot bytes included in the prompt.
    pub max_prompt_bytes: usize,
    /// Bound on one reasoning request.
    pub reasoning_timeout: Duration,
    pub temperature: f64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_prompt_bytes: 200_000,
            reasoning_timeout: Duration::from_secs(180),
            temperature: 0.2,
        }
    }
}

impl AnalysisConfig {
    pub fn with_max_prompt_bytes(mut self, bytes: usize) -> Self {
        self.max_prompt_bytes = bytes;
        self
    }

    pub fn with_reasoning_timeout(mut self, timeout: Duration) -> Self {
        self.reasoning_timeout = timeout;
        self
    }
}
