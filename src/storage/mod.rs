//! Immutable records kept in the job store.
//!
//! - **Artifacts**: content-addressed repository snapshots produced by fetch jobs
//! - **Results**: analysis outputs keyed by (artifact, parameters)
//! - **Fingerprints**: the SHA-256 helpers both are keyed by
//!
//! Persistence itself is the broker's job (`crate::broker`); this module only
//! defines the records and how they are identified.

pub mod artifacts;
pub mod fingerprint;
pub mod results;

pub use artifacts::{artifact_location, Artifact, RepoSnapshot};
pub use fingerprint::{fingerprint_parts, is_fingerprint, result_key, sha256_hex};
pub use results::{AnalysisReport, AnalysisResult, ReportSection};
