//! Git hosting adapters.
//!
//! One implementation per provider; `HostingRegistry` picks the right one
//! from a repository URL's domain.

mod gitee;
mod github;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use thiserror::Error;

pub use gitee::V5Client;
pub use github::GitHubHostingClient;

/// Any failure talking to a hosting provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct GitOpError {
    pub message: String,
}

impl GitOpError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<reqwest_middleware::Error> for GitOpError {
    fn from(e: reqwest_middleware::Error) -> Self {
        GitOpError::new(format!("request failed: {}", e))
    }
}

impl From<reqwest::Error> for GitOpError {
    fn from(e: reqwest::Error) -> Self {
        GitOpError::new(format!("request failed: {}", e))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostingProvider {
    Gitee,
    GitHub,
    GitCode,
}

impl HostingProvider {
    pub fn from_host(host: &str) -> Option<Self> {
        let host = host.to_lowercase();
        if host == "gitee.com" || host.ends_with(".gitee.com") {
            Some(HostingProvider::Gitee)
        } else if host == "github.com" || host.ends_with(".github.com") {
            Some(HostingProvider::GitHub)
        } else if host == "gitcode.com" || host.ends_with(".gitcode.com") {
            Some(HostingProvider::GitCode)
        } else {
            None
        }
    }
}

impl fmt::Display for HostingProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HostingProvider::Gitee => "gitee",
            HostingProvider::GitHub => "github",
            HostingProvider::GitCode => "gitcode",
        };
        f.write_str(name)
    }
}

/// `https://<host>/<owner>/<repo>[.git][/...]` split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub provider: HostingProvider,
    pub owner: String,
    pub repo: String,
}

impl RepoRef {
    pub fn parse(repo_url: &str) -> Result<Self, GitOpError> {
        let parsed = url::Url::parse(repo_url.trim())
            .map_err(|e| GitOpError::new(format!("invalid repository URL '{}': {}", repo_url, e)))?;

        let host = parsed
            .host_str()
            .ok_or_else(|| GitOpError::new(format!("repository URL '{}' has no host", repo_url)))?;
        let provider = HostingProvider::from_host(host).ok_or_else(|| {
            GitOpError::new(format!("unsupported hosting provider '{}'", host))
        })?;

        let mut segments = parsed
            .path_segments()
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty());
        let owner = segments.next();
        let repo = segments.next();
        match (owner, repo) {
            (Some(owner), Some(repo)) => Ok(Self {
                provider,
                owner: owner.to_string(),
                repo: repo.strip_suffix(".git").unwrap_or(repo).to_string(),
            }),
            _ => Err(GitOpError::new(format!(
                "repository URL '{}' must name an owner and a repository",
                repo_url
            ))),
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

/// Operations the repair engine needs from a hosting provider.
#[async_trait]
pub trait GitHosting: Send + Sync {
    /// Make sure the bot's fork of `source_repo_url` exists and has `branch`.
    /// Returns the fork's web URL.
    async fn ensure_branch(&self, source_repo_url: &str, branch: &str)
        -> Result<String, GitOpError>;

    /// Create or update `path` on `branch` of the fork. Returns the commit SHA.
    async fn push_file(
        &self,
        fork_url: &str,
        path: &str,
        content: &str,
        branch: &str,
    ) -> Result<String, GitOpError>;

    async fn comment(
        &self,
        origin_repo_url: &str,
        pr_number: u64,
        text: &str,
    ) -> Result<(), GitOpError>;

    /// Read `path` as it is at the head of the pull request.
    async fn read_file(
        &self,
        origin_repo_url: &str,
        pr_number: u64,
        path: &str,
    ) -> Result<String, GitOpError>;

    /// File an issue. Returns the issue's web URL.
    async fn create_issue(
        &self,
        origin_repo_url: &str,
        title: &str,
        body: &str,
    ) -> Result<String, GitOpError>;

    /// Paths touched by the pull request.
    async fn list_pr_files(
        &self,
        origin_repo_url: &str,
        pr_number: u64,
    ) -> Result<Vec<String>, GitOpError>;
}

/// The configured adapters, keyed by provider.
#[derive(Default, Clone)]
pub struct HostingRegistry {
    adapters: HashMap<HostingProvider, Arc<dyn GitHosting>>,
}

impl HostingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: HostingProvider, adapter: Arc<dyn GitHosting>) {
        self.adapters.insert(provider, adapter);
    }

    pub fn with(mut self, provider: HostingProvider, adapter: Arc<dyn GitHosting>) -> Self {
        self.register(provider, adapter);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    pub fn providers(&self) -> Vec<HostingProvider> {
        self.adapters.keys().copied().collect()
    }

    pub fn for_url(&self, repo_url: &str) -> Result<Arc<dyn GitHosting>, GitOpError> {
        let repo = RepoRef::parse(repo_url)?;
        self.adapters.get(&repo.provider).cloned().ok_or_else(|| {
            GitOpError::new(format!("no credentials configured for {}", repo.provider))
        })
    }
}

/// Decode a contents-API payload. Providers wrap base64 at 60 or 76 columns.
pub(crate) fn decode_content(encoded: &str) -> Result<String, GitOpError> {
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = general_purpose::STANDARD
        .decode(compact)
        .map_err(|e| GitOpError::new(format!("failed to decode file content: {}", e)))?;
    String::from_utf8(bytes).map_err(|_| GitOpError::new("file content is not valid UTF-8"))
}

pub(crate) fn encode_content(content: &str) -> String {
    general_purpose::STANDARD.encode(content.as_bytes())
}

/// Turn a non-success response into a `GitOpError` carrying status and body.
pub(crate) async fn error_for_status(
    operation: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, GitOpError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    tracing::error!("{} failed: {} - {}", operation, status, body);
    Err(GitOpError::new(format!(
        "{} failed: {} - {}",
        operation, status, body
    )))
}
