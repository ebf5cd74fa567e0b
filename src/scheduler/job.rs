//! Job definitions for the scheduler.
//!
//! This module defines the core job types used in the scheduling system:
//!
//! - `Job`: the record kept in the job store for every submission
//! - `JobInput`: what to do (fetch a repository, or analyze one)
//! - `JobState`: the one-directional lifecycle of a job
//! - `JobEnvelope`: the wire form handed to workers through the queue
//! - `JobHandle`: what a submitter gets back

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::{ErrorKind, JobError};
use crate::storage::fingerprint::{fingerprint_parts, is_fingerprint, result_key};

/// Identifier of a job.
pub type JobId = Uuid;

/// Reference used when a fetch request does not name one.
pub const DEFAULT_REF: &str = "HEAD";

/// Upper bound accepted for `AnalysisParams::max_tokens`.
pub const MAX_COMPLETION_TOKENS: u32 = 32_768;

/// Errors raised while validating a submission.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    #[error("Invalid repository URL '{0}': expected https://<host>/<owner>/<repo>")]
    InvalidUrl(String),

    #[error("Invalid reference '{0}'")]
    InvalidRef(String),

    #[error("Unsupported repository host '{0}'")]
    UnsupportedHost(String),

    #[error("Invalid artifact fingerprint '{0}'")]
    InvalidFingerprint(String),

    #[error("Invalid analysis parameters: {0}")]
    InvalidParams(String),
}

/// The two worker pools a job can be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Fetch,
    Analyze,
}

impl JobKind {
    pub const ALL: [JobKind; 2] = [JobKind::Fetch, JobKind::Analyze];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Fetch => "fetch",
            JobKind::Analyze => "analyze",
        }
    }

    /// Error recorded when a job of this kind runs out of attempts.
    pub fn exhausted_error_kind(&self) -> ErrorKind {
        match self {
            JobKind::Fetch => ErrorKind::RepoUnavailable,
            JobKind::Analyze => ErrorKind::ServiceUnavailable,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fetch" => Ok(JobKind::Fetch),
            "analyze" | "analysis" => Ok(JobKind::Analyze),
            other => Err(format!("unknown job kind '{}'", other)),
        }
    }
}

/// Lifecycle state of a job.
///
/// `Pending → Enqueued → Running → {Succeeded, Failed, Cancelled}`. Any
/// non-terminal state may also move to `Cancelled` or `Failed` directly.
/// Terminal states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Enqueued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Enqueued)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Enqueued, Running)
                | (Enqueued, Cancelled)
                | (Enqueued, Failed)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    /// Position in the lifecycle, used to check monotonic progress.
    pub fn rank(&self) -> u8 {
        match self {
            JobState::Pending => 0,
            JobState::Enqueued => 1,
            JobState::Running => 2,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Enqueued => "enqueued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_ref() -> String {
    DEFAULT_REF.to_string()
}

/// A repository URL plus the reference to snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoSpec {
    pub url: String,
    #[serde(rename = "ref", default = "default_ref")]
    pub git_ref: String,
}

impl RepoSpec {
    pub fn new(url: impl Into<String>, git_ref: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            git_ref: git_ref.into(),
        }
    }

    /// Parses the URL into host, owner and repository name.
    pub fn locator(&self) -> Result<RepoLocator, InputError> {
        RepoLocator::parse(&self.url)
    }

    /// Canonical URL and validated reference.
    pub fn normalized(&self) -> Result<RepoSpec, InputError> {
        let locator = self.locator()?;
        let git_ref = normalize_ref(&self.git_ref)?;
        Ok(RepoSpec {
            url: locator.canonical_url(),
            git_ref,
        })
    }
}

fn normalize_ref(git_ref: &str) -> Result<String, InputError> {
    let trimmed = git_ref.trim();
    if trimmed.is_empty() {
        return Ok(default_ref());
    }
    let valid = trimmed.len() <= 255
        && !trimmed.starts_with('-')
        && !trimmed.starts_with('/')
        && !trimmed.ends_with('/')
        && !trimmed.contains("..")
        && !trimmed.contains("//")
        && trimmed
            .chars()
            .all(|c| !c.is_whitespace() && !c.is_control() && !"~^:?*[\\".contains(c));
    if valid {
        Ok(trimmed.to_string())
    } else {
        Err(InputError::InvalidRef(git_ref.to_string()))
    }
}

fn repo_url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?:https?://)?(?:www\.)?([A-Za-z0-9-]+(?:\.[A-Za-z0-9-]+)+)/([A-Za-z0-9_.-]+)/([A-Za-z0-9_.-]+?)(?:\.git)?/?$",
        )
        .expect("repository URL pattern is valid")
    })
}

/// Host, owner and name of a repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoLocator {
    pub host: String,
    pub owner: String,
    pub name: String,
}

impl RepoLocator {
    /// Parses `https://host/owner/repo`, with or without scheme, `www.`,
    /// `.git` suffix, or trailing slash. Host, owner and name are lowercased.
    pub fn parse(url: &str) -> Result<Self, InputError> {
        let caps = repo_url_regex()
            .captures(url.trim())
            .ok_or_else(|| InputError::InvalidUrl(url.to_string()))?;
        let name = caps[3].to_ascii_lowercase();
        if name == "." || name == ".." {
            return Err(InputError::InvalidUrl(url.to_string()));
        }
        Ok(Self {
            host: caps[1].to_ascii_lowercase(),
            owner: caps[2].to_ascii_lowercase(),
            name,
        })
    }

    pub fn canonical_url(&self) -> String {
        format!("https://{}/{}/{}", self.host, self.owner, self.name)
    }

    /// `host/owner/name`, used in alias keys and log fields.
    pub fn slug(&self) -> String {
        format!("{}/{}/{}", self.host, self.owner, self.name)
    }
}

/// Areas an analysis can cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisFocus {
    Complexity,
    Security,
    BestPractices,
    Documentation,
}

impl AnalysisFocus {
    pub const ALL: [AnalysisFocus; 4] = [
        AnalysisFocus::Complexity,
        AnalysisFocus::Security,
        AnalysisFocus::BestPractices,
        AnalysisFocus::Documentation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisFocus::Complexity => "complexity",
            AnalysisFocus::Security => "security",
            AnalysisFocus::BestPractices => "best_practices",
            AnalysisFocus::Documentation => "documentation",
        }
    }
}

/// Parameters of an analysis. Part of the result cache key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisParams {
    /// Areas to cover; empty means all of them.
    #[serde(default)]
    pub focus: Vec<AnalysisFocus>,
    /// Model override; `None` uses the service default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl AnalysisParams {
    pub fn with_focus(mut self, focus: impl IntoIterator<Item = AnalysisFocus>) -> Self {
        self.focus = focus.into_iter().collect();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sorted, de-duplicated focus (all areas when empty), trimmed model.
    pub fn normalized(&self) -> Result<AnalysisParams, InputError> {
        let mut focus = self.focus.clone();
        focus.sort();
        focus.dedup();
        if focus.is_empty() {
            focus = AnalysisFocus::ALL.to_vec();
        }

        let model = self
            .model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string);

        if let Some(max_tokens) = self.max_tokens {
            if max_tokens == 0 || max_tokens > MAX_COMPLETION_TOKENS {
                return Err(InputError::InvalidParams(format!(
                    "max_tokens must be between 1 and {}",
                    MAX_COMPLETION_TOKENS
                )));
            }
        }

        Ok(AnalysisParams {
            focus,
            model,
            max_tokens: self.max_tokens,
        })
    }

    /// Fingerprint of the parameters. Call on normalized parameters.
    pub fn fingerprint(&self) -> String {
        let focus = self
            .focus
            .iter()
            .map(AnalysisFocus::as_str)
            .collect::<Vec<_>>()
            .join(",");
        let max_tokens = self.max_tokens.map(|t| t.to_string()).unwrap_or_default();
        fingerprint_parts(&[
            "params",
            &focus,
            self.model.as_deref().unwrap_or(""),
            &max_tokens,
        ])
    }
}

/// Where an analysis gets its artifact from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisSource {
    /// Fetch (or reuse a fetch of) this repository first.
    Repo(RepoSpec),
    /// Analyze an artifact that already exists.
    Artifact { fingerprint: String },
}

/// Input of an analysis job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzeInput {
    pub source: AnalysisSource,
    #[serde(default)]
    pub params: AnalysisParams,
}

/// What a job does. Serialized as `{"kind": ..., "input": ...}`, which is
/// also the body of `POST /jobs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "input", rename_all = "snake_case")]
pub enum JobInput {
    Fetch(RepoSpec),
    Analyze(AnalyzeInput),
}

impl JobInput {
    pub fn fetch(url: impl Into<String>, git_ref: impl Into<String>) -> Self {
        JobInput::Fetch(RepoSpec::new(url, git_ref))
    }

    pub fn analyze_repo(
        url: impl Into<String>,
        git_ref: impl Into<String>,
        params: AnalysisParams,
    ) -> Self {
        JobInput::Analyze(AnalyzeInput {
            source: AnalysisSource::Repo(RepoSpec::new(url, git_ref)),
            params,
        })
    }

    pub fn analyze_artifact(fingerprint: impl Into<String>, params: AnalysisParams) -> Self {
        JobInput::Analyze(AnalyzeInput {
            source: AnalysisSource::Artifact {
                fingerprint: fingerprint.into(),
            },
            params,
        })
    }

    pub fn kind(&self) -> JobKind {
        match self {
            JobInput::Fetch(_) => JobKind::Fetch,
            JobInput::Analyze(_) => JobKind::Analyze,
        }
    }

    /// Validates the input and puts it in canonical form.
    pub fn normalized(&self) -> Result<JobInput, InputError> {
        match self {
            JobInput::Fetch(spec) => Ok(JobInput::Fetch(spec.normalized()?)),
            JobInput::Analyze(input) => {
                let source = match &input.source {
                    AnalysisSource::Repo(spec) => AnalysisSource::Repo(spec.normalized()?),
                    AnalysisSource::Artifact { fingerprint } => {
                        let fingerprint = fingerprint.trim().to_ascii_lowercase();
                        if !is_fingerprint(&fingerprint) {
                            return Err(InputError::InvalidFingerprint(fingerprint));
                        }
                        AnalysisSource::Artifact { fingerprint }
                    }
                };
                Ok(JobInput::Analyze(AnalyzeInput {
                    source,
                    params: input.params.normalized()?,
                }))
            }
        }
    }

    /// Submission cache key. Call on normalized input.
    ///
    /// For an analysis of a known artifact this is the result key itself, so a
    /// stored result answers the submission directly.
    pub fn cache_key(&self) -> String {
        match self {
            JobInput::Fetch(spec) => fingerprint_parts(&["fetch", &spec.url, &spec.git_ref]),
            JobInput::Analyze(input) => {
                let params = input.params.fingerprint();
                match &input.source {
                    AnalysisSource::Repo(spec) => {
                        fingerprint_parts(&["analyze", &spec.url, &spec.git_ref, &params])
                    }
                    AnalysisSource::Artifact { fingerprint } => result_key(fingerprint, &params),
                }
            }
        }
    }
}

/// Pointer from a succeeded job to what it produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResultRef {
    Artifact { fingerprint: String },
    Analysis { cache_key: String },
}

/// A job record as kept in the job store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub input: JobInput,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Jobs that must reach `Succeeded` before this one is dispatched.
    #[serde(default)]
    pub dependencies: Vec<JobId>,
    #[serde(default)]
    pub result: Option<ResultRef>,
    #[serde(default)]
    pub error: Option<JobError>,
    /// Execution attempts across all deliveries.
    #[serde(default)]
    pub attempts: u32,
    pub cache_key: String,
    /// Set while Running; observed by the worker at its next checkpoint.
    #[serde(default)]
    pub cancel_requested: bool,
    /// Set exactly once, when the job is handed to the queue.
    #[serde(default)]
    pub enqueued: bool,
    /// Optimistic-concurrency counter, bumped on every write.
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Creates a Pending job. `input` should already be normalized.
    pub fn new(input: JobInput, dependencies: Vec<JobId>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind: input.kind(),
            cache_key: input.cache_key(),
            input,
            state: JobState::Pending,
            created_at: now,
            updated_at: now,
            dependencies,
            result: None,
            error: None,
            attempts: 0,
            cancel_requested: false,
            enqueued: false,
            revision: 0,
            worker_id: None,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Moves to `next` if the lifecycle allows it.
    pub fn transition(&mut self, next: JobState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        true
    }

    /// Moves to `Failed` with `error` if the lifecycle allows it.
    pub fn fail(&mut self, error: JobError) -> bool {
        if !self.transition(JobState::Failed) {
            return false;
        }
        self.error = Some(error);
        true
    }

    /// How long ago the job was created.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }

    pub fn envelope(&self) -> JobEnvelope {
        JobEnvelope {
            id: self.id,
            kind: self.kind,
            input: self.input.clone(),
            dependencies: self.dependencies.clone(),
            attempt: self.attempts,
        }
    }
}

/// Wire form of a job as it travels through the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub id: JobId,
    pub kind: JobKind,
    pub input: JobInput,
    #[serde(default)]
    pub dependencies: Vec<JobId>,
    #[serde(default)]
    pub attempt: u32,
}

/// How a submission was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// A new job was created.
    Created,
    /// An identical submission is already in flight; its handle is returned.
    Existing,
    /// An identical submission already succeeded; nothing new will run.
    Cached,
}

/// Handle returned by `Coordinator::submit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: JobId,
    pub kind: JobKind,
    pub state: JobState,
    pub disposition: Disposition,
}

impl JobHandle {
    pub fn from_job(job: &Job, disposition: Disposition) -> Self {
        Self {
            job_id: job.id,
            kind: job.kind,
            state: job.state,
            disposition,
        }
    }
}
