//! In-process stand-ins for the remote collaborators.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use specfix_core::prompt::IssueDraft;

use crate::analysis::{AnalysisError, Fix, LogAnalyzer};
use crate::build_farm::{BuildFarm, BuildFarmError, BuildId, BuildStatus};
use crate::hosting::{GitHosting, GitOpError};
use crate::store::{NewRepairRequest, RepairRequest, RequestId, RequestStatus};

pub const FORK_URL: &str = "https://gitee.com/specfix-bot/zlib";

pub fn new_request(pr_number: u64) -> NewRepairRequest {
    NewRepairRequest {
        origin_repo_url: "https://gitee.com/src-openeuler/zlib".to_string(),
        source_repo_url: "https://gitee.com/alice/zlib".to_string(),
        pr_number,
        repo_name: "zlib".to_string(),
        pr_url: format!("https://gitee.com/src-openeuler/zlib/pulls/{}", pr_number),
        recipe_content: "Name: zlib\nVersion: 1.3".to_string(),
    }
}

pub fn claimed_request(id: i64) -> RepairRequest {
    let new = new_request(7);
    RepairRequest {
        id: RequestId(id),
        origin_repo_url: new.origin_repo_url,
        source_repo_url: new.source_repo_url,
        pr_number: new.pr_number,
        repo_name: new.repo_name,
        pr_url: new.pr_url,
        recipe_content: new.recipe_content,
        status: RequestStatus::Processing,
        claim_count: 1,
    }
}

#[derive(Default)]
pub struct FakeHosting {
    pub comments: Mutex<Vec<String>>,
    /// (path, content, branch)
    pub pushes: Mutex<Vec<(String, String, String)>>,
    pub issues: Mutex<Vec<(String, String)>>,
    pub branches: Mutex<Vec<String>>,
    pub pr_files: Vec<String>,
    pub recipe: Option<String>,
    pub fail_push: bool,
    pub fail_comments: bool,
    pub fail_issues: bool,
}

impl FakeHosting {
    pub fn comments(&self) -> Vec<String> {
        self.comments.lock().unwrap().clone()
    }

    pub fn pushes(&self) -> Vec<(String, String, String)> {
        self.pushes.lock().unwrap().clone()
    }

    pub fn issues(&self) -> Vec<(String, String)> {
        self.issues.lock().unwrap().clone()
    }
}

#[async_trait]
impl GitHosting for FakeHosting {
    async fn ensure_branch(
        &self,
        _source_repo_url: &str,
        branch: &str,
    ) -> Result<String, GitOpError> {
        self.branches.lock().unwrap().push(branch.to_string());
        Ok(FORK_URL.to_string())
    }

    async fn push_file(
        &self,
        _fork_url: &str,
        path: &str,
        content: &str,
        branch: &str,
    ) -> Result<String, GitOpError> {
        if self.fail_push {
            return Err(GitOpError::new("push rejected: 403"));
        }
        let mut pushes = self.pushes.lock().unwrap();
        pushes.push((path.to_string(), content.to_string(), branch.to_string()));
        Ok(format!("{:040}", pushes.len()))
    }

    async fn comment(
        &self,
        _origin_repo_url: &str,
        _pr_number: u64,
        text: &str,
    ) -> Result<(), GitOpError> {
        if self.fail_comments {
            return Err(GitOpError::new("comment rejected"));
        }
        self.comments.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn read_file(
        &self,
        _origin_repo_url: &str,
        _pr_number: u64,
        path: &str,
    ) -> Result<String, GitOpError> {
        self.recipe
            .clone()
            .ok_or_else(|| GitOpError::new(format!("{} not found", path)))
    }

    async fn create_issue(
        &self,
        origin_repo_url: &str,
        title: &str,
        body: &str,
    ) -> Result<String, GitOpError> {
        if self.fail_issues {
            return Err(GitOpError::new("issues disabled"));
        }
        let mut issues = self.issues.lock().unwrap();
        issues.push((title.to_string(), body.to_string()));
        Ok(format!("{}/issues/{}", origin_repo_url, issues.len()))
    }

    async fn list_pr_files(
        &self,
        _origin_repo_url: &str,
        _pr_number: u64,
    ) -> Result<Vec<String>, GitOpError> {
        Ok(self.pr_files.clone())
    }
}

/// Scripted build farm. Each poll consumes one status; once the script is
/// empty every poll reports `Unknown`.
#[derive(Default)]
pub struct FakeFarm {
    statuses: Mutex<VecDeque<BuildStatus>>,
    log: String,
    pub builds: AtomicU32,
    pub registrations: AtomicU32,
    pub polls: AtomicU32,
    pub latest_log_requests: Mutex<Vec<(String, String)>>,
    /// Job lookups fail, as when the farm has not indexed the job.
    pub no_jobs: bool,
}

impl FakeFarm {
    pub fn with_statuses(statuses: impl IntoIterator<Item = BuildStatus>) -> Self {
        Self {
            statuses: Mutex::new(statuses.into_iter().collect()),
            log: "error: Bad exit status from /var/tmp/rpm-tmp (%build)".to_string(),
            ..Self::default()
        }
    }

    pub fn with_log(mut self, log: &str) -> Self {
        self.log = log.to_string();
        self
    }

    pub fn without_jobs(mut self) -> Self {
        self.no_jobs = true;
        self
    }

    pub fn builds(&self) -> u32 {
        self.builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BuildFarm for FakeFarm {
    async fn register(
        &self,
        _project: &str,
        _package: &str,
        _repo_url: &str,
        _branch: &str,
    ) -> Result<(), BuildFarmError> {
        self.registrations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn start_build(&self, _project: &str, _package: &str) -> Result<BuildId, BuildFarmError> {
        let n = self.builds.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(BuildId(format!("b-{}", n)))
    }

    async fn poll_status(&self, _build_id: &BuildId) -> Result<BuildStatus, BuildFarmError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(BuildStatus::Unknown))
    }

    async fn fetch_log(&self, _build_id: &BuildId) -> Result<String, BuildFarmError> {
        Ok(self.log.clone())
    }

    async fn fetch_latest_log(
        &self,
        project: &str,
        package: &str,
    ) -> Result<String, BuildFarmError> {
        self.latest_log_requests
            .lock()
            .unwrap()
            .push((project.to_string(), package.to_string()));
        Ok(self.log.clone())
    }

    async fn job_id(
        &self,
        _project: &str,
        _package: &str,
        build_id: &BuildId,
    ) -> Result<String, BuildFarmError> {
        if self.no_jobs {
            return Err(BuildFarmError::Malformed {
                operation: "find job id",
                message: format!("no job for build {}", build_id),
            });
        }
        Ok(format!("job-{}", build_id))
    }

    fn report_url(&self, project: &str, package: &str, job_id: Option<&str>) -> String {
        match job_id {
            Some(job_id) => format!("https://farm.test/{}/{}?job={}", project, package, job_id),
            None => format!("https://farm.test/{}/{}", project, package),
        }
    }
}

/// Appends `# fix N` to the recipe it is given.
#[derive(Default)]
pub struct FakeAnalyzer {
    /// (recipe, context) per fix call.
    pub fixes: Mutex<Vec<(String, Option<String>)>>,
    pub diagnoses: Mutex<Vec<Vec<String>>>,
    pub fail_fix: bool,
}

impl FakeAnalyzer {
    pub fn fixes(&self) -> Vec<(String, Option<String>)> {
        self.fixes.lock().unwrap().clone()
    }

    pub fn diagnoses(&self) -> Vec<Vec<String>> {
        self.diagnoses.lock().unwrap().clone()
    }
}

#[async_trait]
impl LogAnalyzer for FakeAnalyzer {
    async fn fix(
        &self,
        _repo_name: &str,
        recipe: &str,
        _log: &str,
        context: Option<&str>,
    ) -> Result<Fix, AnalysisError> {
        if self.fail_fix {
            return Err(AnalysisError::MissingRecipe);
        }
        let mut fixes = self.fixes.lock().unwrap();
        fixes.push((recipe.to_string(), context.map(str::to_string)));
        let n = fixes.len();
        Ok(Fix {
            recipe: format!("{}\n# fix {}", recipe, n),
            explanation: format!("explanation {}", n),
        })
    }

    async fn diagnose(&self, warnings: &[String]) -> Result<Option<IssueDraft>, AnalysisError> {
        self.diagnoses.lock().unwrap().push(warnings.to_vec());
        Ok(Some(IssueDraft {
            title: "Missing build dependency".to_string(),
            body: warnings.join("\n"),
        }))
    }
}
