use std::time::Duration;

use async_trait::async_trait;
use reqwest_middleware::{ClientWithMiddleware, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Value};
use specfix_core::{RecordingLogger, ServiceType};
use tokio::sync::OnceCell;
use tracing::info;

use super::{
    decode_content, encode_content, error_for_status, GitHosting, GitOpError, HostingProvider,
    RepoRef,
};
use crate::http::create_http_client;

pub const GITHUB_API_URL: &str = "https://api.github.com";
pub const GITHUB_WEB_URL: &str = "https://github.com";

#[derive(Debug, Deserialize)]
struct User {
    login: String,
}

#[derive(Debug, Deserialize)]
struct Repository {
    full_name: String,
    #[serde(default)]
    default_branch: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitRef {
    object: GitObject,
}

#[derive(Debug, Deserialize)]
struct GitObject {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct PullRequest {
    head: PullRequestHead,
}

#[derive(Debug, Deserialize)]
struct PullRequestHead {
    sha: String,
    // Null when the head fork was deleted.
    repo: Option<Repository>,
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    commit: GitObject,
}

#[derive(Debug, Deserialize)]
struct IssueResponse {
    html_url: String,
}

#[derive(Debug, Deserialize)]
struct PullRequestFile {
    filename: String,
}

pub struct GitHubHostingClient {
    client: ClientWithMiddleware,
    api_base: String,
    web_base: String,
    token: String,
    login: OnceCell<String>,
}

impl GitHubHostingClient {
    pub fn new(token: String, recording_logger: Option<RecordingLogger>) -> Self {
        Self::with_base_urls(
            GITHUB_API_URL.to_string(),
            GITHUB_WEB_URL.to_string(),
            token,
            recording_logger,
        )
    }

    pub fn with_base_urls(
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
            api_base: api_base.trim_end_matches('/').to_string(),
            web_base: web_base.trim_end_matches('/').to_string(),
            token,
            login: OnceCell::new(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.api_base, path))
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    fn parse(&self, repo_url: &str) -> Result<RepoRef, GitOpError> {
        let repo = RepoRef::parse(repo_url)?;
        if repo.provider != HostingProvider::GitHub {
            return Err(GitOpError::new(format!(
                "github adapter cannot handle {} repository {}",
                repo.provider,
                repo.full_name()
            )));
        }
        Ok(repo)
    }

    fn repo_from_full_name(full_name: &str) -> Result<RepoRef, GitOpError> {
        match full_name.split_once('/') {
            Some((owner, repo)) if !owner.is_empty() && !repo.is_empty() => Ok(RepoRef {
                provider: HostingProvider::GitHub,
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
                let response = self.request(reqwest::Method::GET, "/user").send().await?;
                let user: User = error_for_status("get current user", response)
                    .await?
                    .json()
                    .await?;
                Ok::<_, GitOpError>(user.login)
            })
            .await?;
        Ok(login.as_str())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
    ) -> Result<T, GitOpError> {
        let response = self.request(reqwest::Method::GET, path).send().await?;
        Ok(error_for_status(operation, response).await?.json().await?)
    }
}

#[async_trait]
impl GitHosting for GitHubHostingClient {
    async fn ensure_branch(
        &self,
        source_repo_url: &str,
        branch: &str,
    ) -> Result<String, GitOpError> {
        let source = self.parse(source_repo_url)?;
        let login = self.current_user().await?.to_string();

        // The forks endpoint returns the existing fork when there is one.
        let fork = if source.owner == login {
            source
        } else {
            let response = self
                .request(
                    reqwest::Method::POST,
                    &format!("/repos/{}/forks", source.full_name()),
                )
                .json(&json!({ "default_branch_only": false }))
                .send()
                .await?;
            let fork: Repository = error_for_status("create fork", response)
                .await?
                .json()
                .await?;
            Self::repo_from_full_name(&fork.full_name)?
        };

        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/repos/{}/branches/{}", fork.full_name(), branch),
            )
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            let info: Repository = self
                .get_json("get repository", &format!("/repos/{}", fork.full_name()))
                .await?;
            let base = info.default_branch.unwrap_or_else(|| "main".to_string());
            let base_ref: GitRef = self
                .get_json(
                    "get base ref",
                    &format!("/repos/{}/git/ref/heads/{}", fork.full_name(), base),
                )
                .await?;

            let response = self
                .request(
                    reqwest::Method::POST,
                    &format!("/repos/{}/git/refs", fork.full_name()),
                )
                .json(&json!({
                    "ref": format!("refs/heads/{}", branch),
                    "sha": base_ref.object.sha,
                }))
                .send()
                .await?;
            error_for_status("create branch", response).await?;
            info!("Created branch {} on {} from {}", branch, fork.full_name(), base);
        } else {
            error_for_status("get branch", response).await?;
        }

        Ok(format!("{}/{}", self.web_base, fork.full_name()))
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

        let response = self
            .request(reqwest::Method::GET, &endpoint)
            .query(&[("ref", branch)])
            .send()
            .await?;
        let existing_sha = if response.status() == reqwest::StatusCode::NOT_FOUND {
            None
        } else {
            let value: Value = error_for_status("get file", response)
                .await?
                .json()
                .await?;
            value.get("sha").and_then(Value::as_str).map(str::to_string)
        };

        let mut body = json!({
            "message": format!("Update {}", path),
            "content": encode_content(content),
            "branch": branch,
        });
        if let Some(sha) = existing_sha {
            body["sha"] = Value::String(sha);
        }

        let response = self
            .request(reqwest::Method::PUT, &endpoint)
            .json(&body)
            .send()
            .await?;
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
            .request(
                reqwest::Method::POST,
                &format!("/repos/{}/issues/{}/comments", origin.full_name(), pr_number),
            )
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
        let pr: PullRequest = self
            .get_json(
                "get pull request",
                &format!("/repos/{}/pulls/{}", origin.full_name(), pr_number),
            )
            .await?;
        let head_repo = pr.head.repo.ok_or_else(|| {
            GitOpError::new(format!(
                "head repository of pull request #{} no longer exists",
                pr_number
            ))
        })?;

        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/repos/{}/contents/{}", head_repo.full_name, path),
            )
            .query(&[("ref", pr.head.sha.as_str())])
            .send()
            .await?;
        let value: Value = error_for_status("read file", response)
            .await?
            .json()
            .await?;
        let encoded = value
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| GitOpError::new(format!("{} is not a file", path)))?;
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
            .request(
                reqwest::Method::POST,
                &format!("/repos/{}/issues", origin.full_name()),
            )
            .json(&json!({ "title": title, "body": body }))
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
        let files: Vec<PullRequestFile> = self
            .get_json(
                "list pull request files",
                &format!(
                    "/repos/{}/pulls/{}/files?per_page=100",
                    origin.full_name(),
                    pr_number
                ),
            )
            .await?;
        Ok(files.into_iter().map(|f| f.filename).collect())
    }
}
