//! Content-addressed repository snapshots.
//!
//! A fetch job turns a repository at a resolved commit into a `RepoSnapshot`,
//! fingerprints it, and registers an `Artifact`. Artifacts are keyed by the
//! fingerprint alone, so two URLs (or refs) that resolve to identical content
//! share one artifact.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Immutable record of a stored snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// SHA-256 over the snapshot content.
    pub fingerprint: String,
    /// Storage key of the snapshot content.
    pub location: String,
    /// Fetch job that registered this artifact first.
    pub produced_by: Uuid,
    /// Canonical repository URL the snapshot was taken from.
    pub repo: String,
    /// Commit the reference resolved to.
    pub commit: String,
    pub file_count: usize,
    pub total_bytes: u64,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    /// Describes a snapshot about to be registered by `produced_by`.
    pub fn describe(
        snapshot: &RepoSnapshot,
        produced_by: Uuid,
        repo: impl Into<String>,
        commit: impl Into<String>,
    ) -> Self {
        let fingerprint = snapshot.fingerprint();
        Self {
            location: artifact_location(&fingerprint),
            fingerprint,
            produced_by,
            repo: repo.into(),
            commit: commit.into(),
            file_count: snapshot.file_count(),
            total_bytes: snapshot.total_bytes(),
            created_at: Utc::now(),
        }
    }
}

/// Storage key for the content of an artifact.
///
/// The first two characters of the fingerprint form a shard prefix.
pub fn artifact_location(fingerprint: &str) -> String {
    let shard = &fingerprint[0..2.min(fingerprint.len())];
    format!("artifacts/{}/{}", shard, fingerprint)
}

/// Text files of a repository at one commit, keyed by path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoSnapshot {
    pub files: BTreeMap<String, String>,
    /// Files left out because they were binary, too large, or over the file cap.
    #[serde(default)]
    pub skipped: usize,
}

impl RepoSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.insert(path.into(), content.into());
        self
    }

    pub fn insert(&mut self, path: impl Into<String>, content: impl Into<String>) {
        self.files.insert(path.into(), content.into());
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.values().map(|c| c.len() as u64).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Content fingerprint over paths and contents in path order.
    ///
    /// The `skipped` counter is not part of the fingerprint: it describes the
    /// fetch, not the content.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for (path, content) in &self.files {
            hasher.update(path.as_bytes());
            hasher.update([0u8]);
            hasher.update((content.len() as u64).to_be_bytes());
            hasher.update(content.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}
