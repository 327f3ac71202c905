//! Gitee-style `/api/v5` REST client. GitCode serves the same API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest_middleware::{ClientWithMiddleware, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Value};
use specfix_core::{RecordingLogger, ServiceType};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{
    decode_content, encode_content, error_for_status, GitHosting, GitOpError, HostingProvider,
    RepoRef,
};
use crate::http::create_http_client;

pub const GITEE_API_URL: &str = "https://gitee.com/api/v5";
pub const GITEE_WEB_URL: &str = "https://gitee.com";
pub const GITCODE_API_URL: &str = "https://api.gitcode.com/api/v5";
pub const GITCODE_WEB_URL: &str = "https://gitcode.com";

/// Stop paging through forks after this many pages.
const MAX_FORK_PAGES: u32 = 20;
const FORKS_PER_PAGE: u32 = 100;

#[derive(Debug, Deserialize)]
struct User {
    login: String,
}

#[derive(Debug, Deserialize)]
struct Owner {
    login: String,
}

#[derive(Debug, Deserialize)]
struct Repository {
    full_name: String,
    #[serde(default)]
    owner: Option<Owner>,
    #[serde(default)]
    default_branch: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PullRequest {
    head: PullRequestHead,
}

#[derive(Debug, Deserialize)]
struct PullRequestHead {
    sha: String,
    repo: Repository,
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    commit: CommitInfo,
}

#[derive(Debug, Deserialize)]
struct CommitInfo {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct IssueResponse {
    html_url: String,
}

#[derive(Debug, Deserialize)]
struct PullRequestFile {
    filename: String,
}

pub struct V5Client {
    client: ClientWithMiddleware,
    provider: HostingProvider,
    api_base: String,
    web_base: String,
    token: String,
    login: OnceCell<String>,
}

impl V5Client {
    pub fn gitee(token: String, recording_logger: Option<RecordingLogger>) -> Self {
        Self::new(
            HostingProvider::Gitee,
            GITEE_API_URL.to_string(),
            GITEE_WEB_URL.to_string(),
            token,
            recording_logger,
        )
    }

    pub fn gitcode(token: String, recording_logger: Option<RecordingLogger>) -> Self {
        Self::new(
            HostingProvider::GitCode,
            GITCODE_API_URL.to_string(),
            GITCODE_WEB_URL.to_string(),
            token,
            recording_logger,
        )
    }

    pub fn new(
        provider: HostingProvider,
        api_base: String,
        web_base: String,
        token: String,
        recording_logger: Option<RecordingLogger>,
    ) -> Self {
        Self {
            client: create_http_client(
                ServiceType::GitHosting,
                Duration::from_secs(60),
                recording_logger,
            ),
            provider,
            api_base: api_base.trim_end_matches('/').to_string(),
            web_base: web_base.trim_end_matches('/').to_string(),
            token,
            login: OnceCell::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    fn web_url(&self, repo: &RepoRef) -> String {
        format!("{}/{}", self.web_base, repo.full_name())
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.client
            .get(self.url(path))
            .query(&[("access_token", self.token.as_str())])
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.client
            .post(self.url(path))
            .query(&[("access_token", self.token.as_str())])
    }

    fn put(&self, path: &str) -> RequestBuilder {
        self.client
            .put(self.url(path))
            .query(&[("access_token", self.token.as_str())])
    }

    fn parse(&self, repo_url: &str) -> Result<RepoRef, GitOpError> {
        let repo = RepoRef::parse(repo_url)?;
        if repo.provider != self.provider {
            return Err(GitOpError::new(format!(
                "{} adapter cannot handle {} repository {}",
                self.provider,
                repo.provider,
                repo.full_name()
            )));
        }
        Ok(repo)
    }

    fn repo_from_full_name(&self, full_name: &str) -> Result<RepoRef, GitOpError> {
        match full_name.split_once('/') {
            Some((owner, repo)) if !owner.is_empty() && !repo.is_empty() => Ok(RepoRef {
                provider: self.provider,
                owner: owner.to_string(),
                repo: repo.to_string(),
            }),
            _ => Err(GitOpError::new(format!(
                "unexpected repository name '{}'",
                full_name
            ))),
        }
    }

    async fn current_user(&self) -> Result<&str, GitOpError> {
        let login = self
            .login
            .get_or_try_init(|| async {
                let response = self.get("/user").send().await?;
                let user: User = error_for_status("get current user", response)
                    .await?
                    .json()
                    .await?;
                Ok::<_, GitOpError>(user.login)
            })
            .await?;
        Ok(login.as_str())
    }

    async fn find_fork(&self, source: &RepoRef, login: &str) -> Result<Option<RepoRef>, GitOpError> {
        for page in 1..=MAX_FORK_PAGES {
            let response = self
                .get(&format!("/repos/{}/forks", source.full_name()))
                .query(&[("page", page), ("per_page", FORKS_PER_PAGE)])
                .send()
                .await?;
            let forks: Vec<Repository> = error_for_status("list forks", response)
                .await?
                .json()
                .await?;
            if forks.is_empty() {
                return Ok(None);
            }
            if let Some(fork) = forks
                .iter()
                .find(|f| f.owner.as_ref().is_some_and(|o| o.login == login))
            {
                return self.repo_from_full_name(&fork.full_name).map(Some);
            }
        }
        Ok(None)
    }

    async fn create_fork(&self, source: &RepoRef) -> Result<RepoRef, GitOpError> {
        let response = self
            .post(&format!("/repos/{}/forks", source.full_name()))
            .json(&json!({}))
            .send()
            .await?;
        let fork: Repository = error_for_status("create fork", response)
            .await?
            .json()
            .await?;
        info!("Created fork {} of {}", fork.full_name, source.full_name());
        self.repo_from_full_name(&fork.full_name)
    }

    async fn branch_exists(&self, repo: &RepoRef, branch: &str) -> Result<bool, GitOpError> {
        let response = self
            .get(&format!("/repos/{}/branches/{}", repo.full_name(), branch))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        error_for_status("get branch", response).await?;
        Ok(true)
    }

    async fn create_branch(&self, repo: &RepoRef, branch: &str) -> Result<(), GitOpError> {
        let response = self
            .get(&format!("/repos/{}", repo.full_name()))
            .send()
            .await?;
        let info: Repository = error_for_status("get repository", response)
            .await?
            .json()
            .await?;
        let base = info.default_branch.unwrap_or_else(|| "master".to_string());

        let response = self
            .post(&format!("/repos/{}/branches", repo.full_name()))
            .json(&json!({ "refs": base, "branch_name": branch }))
            .send()
            .await?;
        error_for_status("create branch", response).await?;
        info!("Created branch {} on {} from {}", branch, repo.full_name(), base);
        Ok(())
    }

    /// SHA of an existing file, or `None`. Gitee answers a missing path with `[]`.
    async fn file_sha(
        &self,
        repo: &RepoRef,
        path: &str,
        branch: &str,
    ) -> Result<Option<String>, GitOpError> {
        let response = self
            .get(&format!("/repos/{}/contents/{}", repo.full_name(), path))
            .query(&[("ref", branch)])
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let value: Value = error_for_status("get file", response)
            .await?
            .json()
            .await?;
        Ok(value
            .get("sha")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    async fn pull_request(&self, origin: &RepoRef, pr_number: u64) -> Result<PullRequest, GitOpError> {
        let response = self
            .get(&format!("/repos/{}/pulls/{}", origin.full_name(), pr_number))
            .send()
            .await?;
        Ok(error_for_status("get pull request", response)
            .await?
            .json()
            .await?)
    }
}

#[async_trait]
impl GitHosting for V5Client {
    async fn ensure_branch(
        &self,
        source_repo_url: &str,
        branch: &str,
    ) -> Result<String, GitOpError> {
        let source = self.parse(source_repo_url)?;
        let login = self.current_user().await?.to_string();

        let fork = if source.owner == login {
            source
        } else {
            match self.find_fork(&source, &login).await? {
                Some(existing) => existing,
                None => self.create_fork(&source).await?,
            }
        };

        if !self.branch_exists(&fork, branch).await? {
            self.create_branch(&fork, branch).await?;
        }

        Ok(self.web_url(&fork))
    }

    async fn push_file(
        &self,
        fork_url: &str,
        path: &str,
        content: &str,
        branch: &str,
    ) -> Result<String, GitOpError> {
        let fork = self.parse(fork_url)?;
        let endpoint = format!("/repos/{}/contents/{}", fork.full_name(), path);
        let message = format!("Update {}", path);

        let response = match self.file_sha(&fork, path, branch).await? {
            Some(sha) => {
                debug!("Updating {} on {} (sha {})", path, fork.full_name(), sha);
                self.put(&endpoint)
                    .json(&json!({
                        "content": encode_content(content),
                        "message": message,
                        "branch": branch,
                        "sha": sha,
                    }))
                    .send()
                    .await?
            }
            None => {
                debug!("Creating {} on {}", path, fork.full_name());
                self.post(&endpoint)
                    .json(&json!({
                        "content": encode_content(content),
                        "message": message,
                        "branch": branch,
                    }))
                    .send()
                    .await?
            }
        };

        let commit: CommitResponse = error_for_status("push file", response)
            .await?
            .json()
            .await?;
        Ok(commit.commit.sha)
    }

    async fn comment(
        &self,
        origin_repo_url: &str,
        pr_number: u64,
        text: &str,
    ) -> Result<(), GitOpError> {
        let origin = self.parse(origin_repo_url)?;
        let response = self
            .post(&format!(
                "/repos/{}/pulls/{}/comments",
                origin.full_name(),
                pr_number
            ))
            .json(&json!({ "body": text }))
            .send()
            .await?;
        error_for_status("comment on pull request", response).await?;
        Ok(())
    }

    async fn read_file(
        &self,
        origin_repo_url: &str,
        pr_number: u64,
        path: &str,
    ) -> Result<String, GitOpError> {
        let origin = self.parse(origin_repo_url)?;
        let pr = self.pull_request(&origin, pr_number).await?;

        let response = self
            .get(&format!(
                "/repos/{}/contents/{}",
                pr.head.repo.full_name, path
            ))
            .query(&[("ref", pr.head.sha.as_str())])
            .send()
            .await?;
        let value: Value = error_for_status("read file", response)
            .await?
            .json()
            .await?;

        let encoded = value.get("content").and_then(Value::as_str).ok_or_else(|| {
            GitOpError::new(format!(
                "{} not found in {} at {}",
                path, pr.head.repo.full_name, pr.head.sha
            ))
        })?;
        decode_content(encoded)
    }

    async fn create_issue(
        &self,
        origin_repo_url: &str,
        title: &str,
        body: &str,
    ) -> Result<String, GitOpError> {
        let origin = self.parse(origin_repo_url)?;
        let response = self
            .post(&format!("/repos/{}/issues", origin.owner))
            .json(&json!({ "repo": origin.repo, "title": title, "body": body }))
            .send()
            .await?;
        let issue: IssueResponse = error_for_status("create issue", response)
            .await?
            .json()
            .await?;
        Ok(issue.html_url)
    }

    async fn list_pr_files(
        &self,
        origin_repo_url: &str,
        pr_number: u64,
    ) -> Result<Vec<String>, GitOpError> {
        let origin = self.parse(origin_repo_url)?;
        let response = self
            .get(&format!(
                "/repos/{}/pulls/{}/files",
                origin.full_name(),
                pr_number
            ))
            .send()
            .await?;
        let files: Vec<PullRequestFile> = error_for_status("list pull request files", response)
            .await?
            .json()
            .await?;
        Ok(files.into_iter().map(|f| f.filename).collect())
    }
}
