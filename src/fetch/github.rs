//! GitHub REST API implementation of [`RepoFetcher`].
//!
//! Three endpoints are used:
//!
//! - `GET /repos/{owner}/{repo}/commits/{ref}` with the `sha` media type to
//!   resolve a reference
//! - `GET /repos/{owner}/{repo}/git/trees/{commit}?recursive=1` for the file list
//! - raw content at `{raw_base}/{owner}/{repo}/{commit}/{path}`

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{FetchConfig, RepoFetcher};
use crate::error::FetchError;
use crate::scheduler::job::RepoLocator;
use crate::storage::RepoSnapshot;

/// GitHub REST API base URL.
pub const GITHUB_API_BASE: &str = "https://api.github.com";

/// Raw file content base URL.
pub const GITHUB_RAW_BASE: &str = "https://raw.githubusercontent.com";

const USER_AGENT: &str = "repolens/0.1";

#[derive(Debug, Deserialize)]
struct TreeResponse {
    tree: Vec<TreeEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(rename = "type")]
    entry_type: String,
    #[serde(default)]
    size: Option<u64>,
}

/// Fetches snapshots over the GitHub REST API.
pub struct GitHubFetcher {
    http_client: Client,
    config: FetchConfig,
}

impl GitHubFetcher {
    pub fn new(config: FetchConfig) -> Result<Self, FetchError> {
        let http_client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| FetchError::Unavailable(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http_client,
            config,
        })
    }

    /// Check if an API token is configured.
    pub fn has_token(&self) -> bool {
        self.config.token.is_some()
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    fn check_host(&self, repo: &RepoLocator) -> Result<(), FetchError> {
        if repo.host != self.config.host {
            return Err(FetchError::UnsupportedHost(repo.host.clone()));
        }
        Ok(())
    }

    fn get(&self, url: &str, accept: &str) -> RequestBuilder {
        let mut request = self
            .http_client
            .get(url)
            .header("Accept", accept)
            .header("User-Agent", USER_AGENT)
            .header("X-GitHub-Api-Version", "2022-11-28");

        if let Some(ref token) = self.config.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }
        request
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, FetchError> {
        request.send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(self.config.request_timeout)
            } else {
                FetchError::Unavailable(e.to_string())
            }
        })
    }

    /// Downloads one file. `None` means the file was skipped.
    async fn download(
        &self,
        repo: &RepoLocator,
        commit: &str,
        path: &str,
    ) -> Result<Option<String>, FetchError> {
        let url = format!(
            "{}/{}/{}/{}/{}",
            self.config.raw_base,
            repo.owner,
            repo.name,
            commit,
            encode_path(path)
        );
        let response = self.send(self.get(&url, "application/octet-stream")).await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!(path = path, "File vanished from raw endpoint, skipping");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(classify(status, &response, &repo.slug(), commit));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| FetchError::Unavailable(e.to_string()))?;
        if bytes.len() as u64 > self.config.max_file_bytes {
            return Ok(None);
        }
        Ok(decode_text(&bytes))
    }
}

#[async_trait]
impl RepoFetcher for GitHubFetcher {
    async fn resolve(&self, repo: &RepoLocator, git_ref: &str) -> Result<String, FetchError> {
        self.check_host(repo)?;

        let url = format!(
            "{}/repos/{}/{}/commits/{}",
            self.config.api_base,
            repo.owner,
            repo.name,
            urlencoding::encode(git_ref)
        );
        let response = self.send(self.get(&url, "application/vnd.github.sha")).await?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify(status, &response, &repo.slug(), git_ref));
        }

        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Unavailable(e.to_string()))?;
        let commit = body.trim().to_ascii_lowercase();
        if commit.len() != 40 || !commit.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(FetchError::Malformed(format!(
                "expected a commit id for {}@{}, got {:?}",
                repo.slug(),
                git_ref,
                truncate(&body, 80)
            )));
        }

        debug!(repo = %repo.slug(), git_ref = git_ref, commit = %commit, "Resolved reference");
        Ok(commit)
    }

    async fn snapshot(&self, repo: &RepoLocator, commit: &str) -> Result<RepoSnapshot, FetchError> {
        self.check_host(repo)?;

        let url = format!(
            "{}/repos/{}/{}/git/trees/{}?recursive=1",
            self.config.api_base, repo.owner, repo.name, commit
        );
        let response = self.send(self.get(&url, "application/vnd.github+json")).await?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify(status, &response, &repo.slug(), commit));
        }

        let tree: TreeResponse = response
            .json()
            .await
            .map_err(|e| FetchError::Malformed(format!("Failed to parse tree: {}", e)))?;
        if tree.truncated {
            warn!(repo = %repo.slug(), commit = commit, "Tree listing was truncated by the API");
        }

        let (mut selected, mut skipped) = select_entries(
            tree.tree,
            self.config.max_files,
            self.config.max_file_bytes,
        );
        selected.sort();

        let downloads: Vec<(String, Option<String>)> = stream::iter(selected)
            .map(|path| async move {
                let content = self.download(repo, commit, &path).await?;
                Ok::<_, FetchError>((path, content))
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .try_collect()
            .await?;

        let mut snapshot = RepoSnapshot::new();
        for (path, content) in downloads {
            match content {
                Some(text) => snapshot.insert(path, text),
                None => skipped += 1,
            }
        }
        snapshot.skipped = skipped;

        info!(
            repo = %repo.slug(),
            commit = commit,
            files = snapshot.file_count(),
            skipped = snapshot.skipped,
            bytes = snapshot.total_bytes(),
            "Downloaded snapshot"
        );
        Ok(snapshot)
    }
}

/// Picks blob paths within the size cap, at most `max_files` in path order.
/// Returns the paths and how many entries were left out.
fn select_entries(entries: Vec<TreeEntry>, max_files: usize, max_file_bytes: u64) -> (Vec<String>, usize) {
    let mut blobs: Vec<TreeEntry> = entries
        .into_iter()
        .filter(|e| e.entry_type == "blob")
        .collect();
    blobs.sort_by(|a, b| a.path.cmp(&b.path));

    let mut skipped = 0;
    let mut selected = Vec::new();
    for entry in blobs {
        let too_big = entry.size.map(|s| s > max_file_bytes).unwrap_or(false);
        if too_big || selected.len() >= max_files {
            skipped += 1;
            continue;
        }
        selected.push(entry.path);
    }
    (selected, skipped)
}

/// UTF-8 text without NUL bytes; anything else counts as binary.
fn decode_text(bytes: &[u8]) -> Option<String> {
    if bytes.contains(&0) {
        return None;
    }
    String::from_utf8(bytes.to_vec()).ok()
}

fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Maps a non-success status to a fetch error.
fn classify(status: StatusCode, response: &Response, repo: &str, git_ref: &str) -> FetchError {
    let rate_limited = status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN
            && response
                .headers()
                .get("x-ratelimit-remaining")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim() == "0")
                .unwrap_or(false));

    if rate_limited {
        let reset = response
            .headers()
            .get("retry-after")
            .or_else(|| response.headers().get("x-ratelimit-reset"))
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown");
        return FetchError::RateLimited(format!("status {}, reset {}", status.as_u16(), reset));
    }

    match status {
        StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY | StatusCode::CONFLICT => {
            FetchError::InvalidRef {
                repo: repo.to_string(),
                git_ref: git_ref.to_string(),
            }
        }
        // Private repositories answer 401/403 without a usable token.
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FetchError::InvalidRef {
            repo: repo.to_string(),
            git_ref: git_ref.to_string(),
        },
        s if s.is_server_error() => FetchError::Unavailable(format!("status {}", s.as_u16())),
        s => FetchError::Malformed(format!("unexpected status {}", s.as_u16())),
    }
}
