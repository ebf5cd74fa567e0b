//! Repository fetching.
//!
//! A fetch job resolves a reference to a commit, snapshots the repository's
//! text files at that commit, and registers the snapshot as a
//! content-addressed [`Artifact`](crate::storage::Artifact).
//!
//! The transport sits behind [`RepoFetcher`]; [`GitHubFetcher`] implements it
//! on the GitHub REST API.

pub mod github;
pub mod handler;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::FetchError;
use crate::scheduler::job::RepoLocator;
use crate::storage::RepoSnapshot;

pub use github::{GitHubFetcher, GITHUB_API_BASE, GITHUB_RAW_BASE};
pub use handler::FetchHandler;

/// Source of repository snapshots.
#[async_trait]
pub trait RepoFetcher: Send + Sync {
    /// Resolves `git_ref` (branch, tag, `HEAD` or commit) to a full commit id.
    async fn resolve(&self, repo: &RepoLocator, git_ref: &str) -> Result<String, FetchError>;

    /// Downloads the text files of `repo` at `commit`.
    async fn snapshot(&self, repo: &RepoLocator, commit: &str) -> Result<RepoSnapshot, FetchError>;
}

/// Settings for [`GitHubFetcher`].
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Host name accepted in repository URLs.
    pub host: String,
    pub api_base: String,
    pub raw_base: String,
    /// Personal access token; raises the API rate limit.
    pub token: Option<String>,
    /// Bound on every HTTP request.
    pub request_timeout: Duration,
    /// Files beyond this count (in path order) are skipped.
    pub max_files: usize,
    /// Files larger than this are skipped.
    pub max_file_bytes: u64,
    /// Parallel file downloads.
    pub concurrency: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            host: "github.com".to_string(),
            api_base: GITHUB_API_BASE.to_string(),
            raw_base: GITHUB_RAW_BASE.to_string(),
            token: None,
            request_timeout: Duration::from_secs(30),
            max_files: 500,
            max_file_bytes: 256 * 1024,
            concurrency: 8,
        }
    }
}

impl FetchConfig {
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.trim().is_empty());
        self
    }

    /// Overrides the API and raw-content endpoints.
    pub fn with_base_urls(mut self, api_base: impl Into<String>, raw_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self.raw_base = raw_base.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_limits(mut self, max_files: usize, max_file_bytes: u64) -> Self {
        self.max_files = max_files;
        self.max_file_bytes = max_file_bytes;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_config_defaults() {
        let config = FetchConfig::default();
        assert_eq!(config.host, "github.com");
        assert_eq!(config.api_base, "https://api.github.com");
        assert!(config.token.is_none());
    }

    #[test]
    fn test_blank_token_is_ignored() {
        let config = FetchConfig::default().with_token(Some("  ".to_string()));
        assert!(config.token.is_none());

        let config = FetchConfig::default().with_token(Some("ghp_x".to_string()));
        assert_eq!(config.token.as_deref(), Some("ghp_x"));
    }
}
