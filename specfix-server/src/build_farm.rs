//! Build farm adapter.
//!
//! `EulerMakerClient` talks to an EulerMaker instance: package and target
//! registration through the OS project API, build status and job lookup
//! through the data search API, and logs from the job's result directory.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use reqwest_middleware::ClientWithMiddleware;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use specfix_core::{RecordingLogger, ServiceType};
use thiserror::Error;
use tracing::{debug, info};

use crate::http::create_http_client;
use crate::retry::{retry_with_backoff, RetryConfig, Retryable};

pub const DEFAULT_BUILD_FARM_URL: &str = "https://eulermaker.compass-ci.openeuler.openatom.cn";

/// EulerMaker's numeric build states.
const STATUS_PASSED: i64 = 201;
const STATUS_FAILED: i64 = 202;

/// Lines of build log handed to the log analyzer.
pub const DEFAULT_LOG_LINES: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildId(pub String);

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Passed,
    Failed,
    /// Not finished, not found yet, or a state we do not act on.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTarget {
    pub os_variant: String,
    pub architecture: String,
    pub ground_projects: Vec<String>,
    pub flag_build: bool,
    pub flag_publish: bool,
}

impl Default for BuildTarget {
    fn default() -> Self {
        Self {
            os_variant: "openEuler:24.03".to_string(),
            architecture: "x86_64".to_string(),
            ground_projects: Vec::new(),
            flag_build: true,
            flag_publish: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum BuildFarmError {
    #[error("build farm transport error during {operation}: {message}")]
    Transport {
        operation: &'static str,
        message: String,
    },
    #[error("build farm {operation} returned {status}: {body}")]
    Api {
        operation: &'static str,
        status: u16,
        body: String,
    },
    #[error("unexpected build farm response for {operation}: {message}")]
    Malformed {
        operation: &'static str,
        message: String,
    },
}

impl BuildFarmError {
    fn malformed(operation: &'static str, message: impl Into<String>) -> Self {
        BuildFarmError::Malformed {
            operation,
            message: message.into(),
        }
    }
}

impl Retryable for BuildFarmError {
    fn is_transient(&self) -> bool {
        match self {
            BuildFarmError::Transport { .. } => true,
            BuildFarmError::Api { status, .. } => *status >= 500 || *status == 429,
            BuildFarmError::Malformed { .. } => false,
        }
    }
}

#[async_trait]
pub trait BuildFarm: Send + Sync {
    /// Point `package` in `project` at `repo_url`/`branch` and add the build target.
    async fn register(
        &self,
        project: &str,
        package: &str,
        repo_url: &str,
        branch: &str,
    ) -> Result<(), BuildFarmError>;

    async fn start_build(&self, project: &str, package: &str) -> Result<BuildId, BuildFarmError>;

    async fn poll_status(&self, build_id: &BuildId) -> Result<BuildStatus, BuildFarmError>;

    /// Tail of the log of the job that ran `build_id`.
    async fn fetch_log(&self, build_id: &BuildId) -> Result<String, BuildFarmError>;

    /// Tail of the log of the most recent build of `package` in `project`.
    async fn fetch_latest_log(&self, project: &str, package: &str)
        -> Result<String, BuildFarmError>;

    /// Id of the job that ran `build_id`. Build-record pages are keyed by it.
    async fn job_id(
        &self,
        project: &str,
        package: &str,
        build_id: &BuildId,
    ) -> Result<String, BuildFarmError>;

    /// Human-facing build-record page; without a job id it lists the
    /// package's builds.
    fn report_url(&self, project: &str, package: &str, job_id: Option<&str>) -> String;
}

#[derive(Debug, Clone)]
pub struct EulerMakerConfig {
    pub base_url: String,
    pub token: String,
    pub target: BuildTarget,
    pub log_lines: usize,
    pub retry: RetryConfig,
}

impl EulerMakerConfig {
    pub fn new(token: String) -> Self {
        Self {
            base_url: DEFAULT_BUILD_FARM_URL.to_string(),
            token,
            target: BuildTarget::default(),
            log_lines: DEFAULT_LOG_LINES,
            retry: RetryConfig::DEFAULT,
        }
    }
}

pub struct EulerMakerClient {
    client: ClientWithMiddleware,
    config: EulerMakerConfig,
}

impl EulerMakerClient {
    pub fn new(config: EulerMakerConfig) -> Self {
        Self::new_with_recording(config, None)
    }

    pub fn new_with_recording(
        mut config: EulerMakerConfig,
        recording_logger: Option<RecordingLogger>,
    ) -> Self {
        config.base_url = config.base_url.trim_end_matches('/').to_string();
        Self {
            client: create_http_client(
                ServiceType::BuildFarm,
                Duration::from_secs(50),
                recording_logger,
            ),
            config,
        }
    }

    fn os_url(&self, project: &str) -> String {
        format!("{}/api/api/os/{}", self.config.base_url, project)
    }

    fn search_url(&self) -> String {
        format!("{}/api/data-api/search", self.config.base_url)
    }

    async fn send(
        &self,
        operation: &'static str,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, BuildFarmError> {
        let client = &self.client;
        let token = self.config.token.as_str();

        retry_with_backoff(self.config.retry, operation, move || {
            let mut request = client
                .request(method.clone(), url)
                .header("Authorization", token);
            if let Some(body) = body {
                request = request.json(body);
            }
            async move {
                let response = request.send().await.map_err(|e| BuildFarmError::Transport {
                    operation,
                    message: e.to_string(),
                })?;
                if response.status().is_success() {
                    return Ok(response);
                }
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                Err(BuildFarmError::Api {
                    operation,
                    status,
                    body,
                })
            }
        })
        .await
    }

    async fn search(&self, operation: &'static str, body: Value) -> Result<Value, BuildFarmError> {
        let response = self
            .send(operation, Method::POST, &self.search_url(), Some(&body))
            .await?;
        response
            .json::<Value>()
            .await
            .map_err(|e| BuildFarmError::malformed(operation, e.to_string()))
    }

    async fn latest_build_id(&self, project: &str, package: &str) -> Result<BuildId, BuildFarmError> {
        let result = self
            .search(
                "find latest build",
                json!({
                    "index": "builds",
                    "query": {
                        "size": 1,
                        "_source": ["build_id"],
                        "sort": [{"create_time": "desc"}],
                        "query": {"bool": {"must": [
                            {"term": {"packages": package}},
                            {"term": {"os_project": project}}
                        ]}}
                    }
                }),
            )
            .await?;

        first_hit_source(&result)
            .and_then(|source| source.get("build_id"))
            .and_then(Value::as_str)
            .map(|id| BuildId(id.to_string()))
            .ok_or_else(|| {
                BuildFarmError::malformed(
                    "find latest build",
                    format!("no build of {} in {}", package, project),
                )
            })
    }

    async fn result_root(&self, build_id: &BuildId) -> Result<String, BuildFarmError> {
        let result = self
            .search(
                "find build job",
                json!({
                    "index": "jobs",
                    "query": {
                        "size": 1,
                        "_source": ["result_root"],
                        "query": {"term": {"build_id": build_id.0}}
                    }
                }),
            )
            .await?;

        first_hit_source(&result)
            .and_then(|source| source.get("result_root"))
            .and_then(Value::as_str)
            .map(|root| root.trim_matches('/').to_string())
            .ok_or_else(|| {
                BuildFarmError::malformed("find build job", format!("no job for build {}", build_id))
            })
    }
}

fn first_hit_source(result: &Value) -> Option<&Value> {
    result
        .get("hits")?
        .get("hits")?
        .as_array()?
        .first()?
        .get("_source")
}

/// Keep the last `lines` lines of `text`.
pub fn tail_lines(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

#[async_trait]
impl BuildFarm for EulerMakerClient {
    async fn register(
        &self,
        project: &str,
        package: &str,
        repo_url: &str,
        branch: &str,
    ) -> Result<(), BuildFarmError> {
        let url = self.os_url(project);

        let package_body = json!({
            "package_repos+": [{
                "spec_name": package,
                "spec_url": repo_url,
                "spec_branch": branch,
                "spec_description": ""
            }]
        });
        self.send("add package", Method::PUT, &url, Some(&package_body))
            .await?;

        let target = &self.config.target;
        let target_body = json!({
            "package_overrides": {
                package: {
                    "build_targets+": [{
                        "os_variant": target.os_variant,
                        "architecture": target.architecture,
                        "ground_projects": target.ground_projects,
                        "flags": {
                            "build": target.flag_build,
                            "publish": target.flag_publish
                        }
                    }]
                }
            }
        });
        self.send("add build target", Method::PUT, &url, Some(&target_body))
            .await?;

        info!(
            project = %project,
            package = %package,
            branch = %branch,
            "Registered package with build farm"
        );
        Ok(())
    }

    async fn start_build(&self, project: &str, package: &str) -> Result<BuildId, BuildFarmError> {
        let url = format!("{}/build_single", self.os_url(project));
        let body = json!({ "packages": package });
        let response = self
            .send("start build", Method::POST, &url, Some(&body))
            .await?;
        let value: Value = response
            .json()
            .await
            .map_err(|e| BuildFarmError::malformed("start build", e.to_string()))?;

        let build_id = value
            .get("build_id")
            .and_then(|v| match v {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .ok_or_else(|| BuildFarmError::malformed("start build", "response has no build_id"))?;

        info!(project = %project, package = %package, build_id = %build_id, "Started build");
        Ok(BuildId(build_id))
    }

    async fn poll_status(&self, build_id: &BuildId) -> Result<BuildStatus, BuildFarmError> {
        let result = self
            .search(
                "poll build status",
                json!({
                    "index": "builds",
                    "query": {
                        "size": 1,
                        "_source": ["build_id", "status", "progress"],
                        "query": {"term": {"build_id": build_id.0}}
                    }
                }),
            )
            .await?;

        let status = first_hit_source(&result)
            .and_then(|source| source.get("status"))
            .and_then(Value::as_i64);
        debug!(build_id = %build_id, status = ?status, "Polled build status");

        Ok(match status {
            Some(STATUS_PASSED) => BuildStatus::Passed,
            Some(STATUS_FAILED) => BuildStatus::Failed,
            _ => BuildStatus::Unknown,
        })
    }

    async fn fetch_log(&self, build_id: &BuildId) -> Result<String, BuildFarmError> {
        let root = self.result_root(build_id).await?;
        let url = format!("{}/{}/dmesg", self.config.base_url, root);
        let response = self.send("fetch log", Method::GET, &url, None).await?;
        let text = response
            .text()
            .await
            .map_err(|e| BuildFarmError::malformed("fetch log", e.to_string()))?;
        Ok(tail_lines(&text, self.config.log_lines))
    }

    async fn fetch_latest_log(
        &self,
        project: &str,
        package: &str,
    ) -> Result<String, BuildFarmError> {
        let build_id = self.latest_build_id(project, package).await?;
        self.fetch_log(&build_id).await
    }

    async fn job_id(
        &self,
        project: &str,
        package: &str,
        build_id: &BuildId,
    ) -> Result<String, BuildFarmError> {
        let result = self
            .search(
                "find job id",
                json!({
                    "index": "jobs",
                    "query": {
                        "size": 1,
                        "_source": ["id"],
                        "query": {"bool": {"must": [
                            {"term": {"os_project": project}},
                            {"term": {"package": package}},
                            {"term": {"build_id": build_id.0}}
                        ]}}
                    }
                }),
            )
            .await?;

        let hit = result
            .get("hits")
            .and_then(|hits| hits.get("hits"))
            .and_then(Value::as_array)
            .and_then(|hits| hits.first());
        hit.and_then(|hit| hit.get("_id"))
            .or_else(|| hit.and_then(|hit| hit.get("_source")?.get("id")))
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                BuildFarmError::malformed("find job id", format!("no job for build {}", build_id))
            })
    }

    fn report_url(&self, project: &str, package: &str, job_id: Option<&str>) -> String {
        let mut url = format!(
            "{}/package/build-record?osProject={}&packageName={}",
            self.config.base_url, project, package
        );
        if let Some(job_id) = job_id {
            url.push_str("&jobId=");
            url.push_str(job_id);
        }
        url
    }
}
