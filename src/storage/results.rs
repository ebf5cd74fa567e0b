//! Analysis results, cached by (artifact fingerprint, parameter fingerprint).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::scheduler::job::AnalysisFocus;

/// Immutable output of an analysis job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Job that produced this result.
    pub job_id: Uuid,
    /// `result_key(artifact_fingerprint, params_fingerprint)`.
    pub cache_key: String,
    pub artifact_fingerprint: String,
    pub params_fingerprint: String,
    /// Model that answered.
    pub model: String,
    pub report: AnalysisReport,
    pub created_at: DateTime<Utc>,
}

/// Structured analysis of a repository.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub summary: String,
    #[serde(default)]
    pub sections: Vec<ReportSection>,
    /// Unparsed model output, kept when it did not match the expected shape.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

impl AnalysisReport {
    pub fn section(&self, focus: AnalysisFocus) -> Option<&ReportSection> {
        self.sections.iter().find(|s| s.focus == focus)
    }

    /// Number of findings across all sections.
    pub fn finding_count(&self) -> usize {
        self.sections.iter().map(|s| s.findings.len()).sum()
    }
}

/// Findings for one analysis focus area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSection {
    pub focus: AnalysisFocus,
    pub findings: Vec<String>,
}
