//! The build-repair state machine.
//!
//! One `RepairMachine::run` call drives a claimed request through
//! submit → wait → {succeed, retry, exhaust}. The transitions taken on a
//! verdict are pure (`state::after_verdict`); this module performs the I/O
//! each state asks for and posts the notices.

pub mod diagnose;
pub mod state;
pub mod wait;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::analysis::{AnalysisError, LogAnalyzer};
use crate::build_farm::{BuildFarm, BuildFarmError};
use crate::hosting::{GitHosting, GitOpError};
use crate::notify::{Notice, Notifier};
use crate::store::{RepairRequest, TerminalStatus};

use diagnose::scan_warnings;
use state::{after_verdict, BuildAttempt, CommitRef, RepairState, Verdict};
use wait::{wait_for_verdict, WaitOutcome};

/// Everything that drives a repair besides the request itself.
#[derive(Debug, Clone, PartialEq)]
pub struct RepairSettings {
    pub max_retries: u32,
    pub poll_interval: Duration,
    pub build_timeout: Duration,
    /// Build-farm project repair builds run in.
    pub repair_project: String,
    /// Build-farm project holding the pull request's own build, with
    /// `{repo}` and `{pr_number}` placeholders. Enables the initial analysis.
    pub pr_project_template: Option<String>,
}

impl Default for RepairSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            poll_interval: Duration::from_secs(30),
            build_timeout: Duration::from_secs(36_000),
            repair_project: String::new(),
            pr_project_template: None,
        }
    }
}

impl RepairSettings {
    pub fn branch_name(pr_number: u64) -> String {
        format!("specfix-pr-{}", pr_number)
    }

    pub fn recipe_path(repo_name: &str) -> String {
        format!("{}.spec", repo_name)
    }

    pub fn pr_project(&self, request: &RepairRequest) -> Option<String> {
        self.pr_project_template.as_ref().map(|template| {
            template
                .replace("{repo}", &request.repo_name)
                .replace("{pr_number}", &request.pr_number.to_string())
        })
    }
}

#[derive(Debug, Error)]
pub enum RepairError {
    #[error("git hosting: {0}")]
    Git(#[from] GitOpError),
    #[error("build farm: {0}")]
    BuildFarm(#[from] BuildFarmError),
    #[error("log analysis: {0}")]
    Analysis(#[from] AnalysisError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairOutcome {
    Succeeded { attempts: u32 },
    Exhausted { attempts: u32 },
    Erred { error: String },
    /// Stopped on shutdown before a verdict; nothing was reported.
    Interrupted,
}

impl RepairOutcome {
    /// Status to persist. `None` means the request should go back to the queue.
    pub fn terminal_status(&self) -> Option<TerminalStatus> {
        match self {
            RepairOutcome::Succeeded { .. } => Some(TerminalStatus::Completed),
            RepairOutcome::Exhausted { .. } | RepairOutcome::Erred { .. } => {
                Some(TerminalStatus::Failed)
            }
            RepairOutcome::Interrupted => None,
        }
    }
}

pub struct RepairMachine {
    farm: Arc<dyn BuildFarm>,
    analyzer: Arc<dyn LogAnalyzer>,
    settings: RepairSettings,
}

impl RepairMachine {
    pub fn new(
        farm: Arc<dyn BuildFarm>,
        analyzer: Arc<dyn LogAnalyzer>,
        settings: RepairSettings,
    ) -> Self {
        Self {
            farm,
            analyzer,
            settings,
        }
    }

    /// Run one request to an outcome. Adapter errors become `Erred` with an
    /// error notice; they are never returned.
    #[instrument(skip_all, fields(request_id = %request.id, pr_number = request.pr_number, repo = %request.repo_name))]
    pub async fn run(
        &self,
        hosting: &dyn GitHosting,
        request: &RepairRequest,
        interrupt: &CancellationToken,
    ) -> RepairOutcome {
        let notifier = Notifier::new(hosting, &request.origin_repo_url, request.pr_number);

        match self.drive(hosting, &notifier, request, interrupt).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Repair failed");
                let error = e.to_string();
                notifier
                    .post(&Notice::Erred {
                        error: error.clone(),
                    })
                    .await;
                RepairOutcome::Erred { error }
            }
        }
    }

    async fn drive(
        &self,
        hosting: &dyn GitHosting,
        notifier: &Notifier<'_>,
        request: &RepairRequest,
        interrupt: &CancellationToken,
    ) -> Result<RepairOutcome, RepairError> {
        let branch = RepairSettings::branch_name(request.pr_number);
        let path = RepairSettings::recipe_path(&request.repo_name);

        let mut recipe = request.recipe_content.clone();
        if let Some(project) = self.settings.pr_project(request) {
            recipe = self
                .initial_fix(hosting, notifier, request, &project, recipe)
                .await?;
        }

        let fork_url = hosting
            .ensure_branch(&request.source_repo_url, &branch)
            .await?;
        self.farm
            .register(
                &self.settings.repair_project,
                &request.repo_name,
                &fork_url,
                &branch,
            )
            .await?;

        let mut state = RepairState::Submitting { index: 0, recipe };
        loop {
            debug!(state = state.name(), "Repair step");
            state = match state {
                RepairState::Submitting { index, recipe } => {
                    if interrupt.is_cancelled() {
                        return Ok(RepairOutcome::Interrupted);
                    }
                    let attempt = self
                        .submit(hosting, request, &fork_url, &branch, &path, index, recipe)
                        .await?;
                    RepairState::Waiting { attempt }
                }

                RepairState::Waiting { attempt } => {
                    let outcome = wait_for_verdict(
                        self.farm.as_ref(),
                        &attempt.build_id,
                        self.settings.poll_interval,
                        self.settings.build_timeout,
                        interrupt,
                    )
                    .await?;
                    let verdict = match outcome {
                        WaitOutcome::Passed => Verdict::Passed,
                        WaitOutcome::Failed => Verdict::Failed,
                        WaitOutcome::TimedOut => Verdict::TimedOut,
                        WaitOutcome::Interrupted => return Ok(RepairOutcome::Interrupted),
                    };
                    info!(
                        attempt = attempt.index,
                        build_id = %attempt.build_id,
                        verdict = ?verdict,
                        "Build verdict"
                    );
                    after_verdict(attempt, verdict, self.settings.max_retries)
                }

                RepairState::Retrying { failed } => {
                    let log = self.farm.fetch_log(&failed.build_id).await?;
                    let fix = self
                        .analyzer
                        .fix(&request.repo_name, &failed.recipe, &log, None)
                        .await?;
                    let next = failed.index + 1;
                    if !fix.explanation.is_empty() {
                        notifier
                            .post(&Notice::Explanation {
                                attempt: next,
                                text: fix.explanation,
                            })
                            .await;
                    }
                    RepairState::Submitting {
                        index: next,
                        recipe: fix.recipe,
                    }
                }

                RepairState::Succeeded { attempt } => {
                    notifier
                        .post(&Notice::Succeeded {
                            commit_url: attempt.commit.url(),
                            report_url: self.report_url(request, &attempt).await,
                        })
                        .await;
                    return Ok(RepairOutcome::Succeeded {
                        attempts: attempt.index + 1,
                    });
                }

                RepairState::Exhausted { attempt } => {
                    notifier
                        .post(&Notice::Exhausted {
                            max_retries: self.settings.max_retries,
                            commit_url: attempt.commit.url(),
                            report_url: self.report_url(request, &attempt).await,
                        })
                        .await;
                    self.file_diagnostics(hosting, request, &attempt).await;
                    return Ok(RepairOutcome::Exhausted {
                        attempts: attempt.index + 1,
                    });
                }
            };
        }
    }

    /// First fix from the pull request's own failing build.
    async fn initial_fix(
        &self,
        hosting: &dyn GitHosting,
        notifier: &Notifier<'_>,
        request: &RepairRequest,
        project: &str,
        recipe: String,
    ) -> Result<String, RepairError> {
        let log = self
            .farm
            .fetch_latest_log(project, &request.repo_name)
            .await?;

        let files = match hosting
            .list_pr_files(&request.origin_repo_url, request.pr_number)
            .await
        {
            Ok(files) => files,
            Err(e) => {
                warn!(error = %e, "Could not list pull request files, analyzing without them");
                Vec::new()
            }
        };
        let context = (!files.is_empty()).then(|| files.join("\n"));

        let fix = self
            .analyzer
            .fix(&request.repo_name, &recipe, &log, context.as_deref())
            .await?;
        if !fix.explanation.is_empty() {
            notifier
                .post(&Notice::Explanation {
                    attempt: 0,
                    text: fix.explanation,
                })
                .await;
        }
        Ok(fix.recipe)
    }

    #[allow(clippy::too_many_arguments)]
    async fn submit(
        &self,
        hosting: &dyn GitHosting,
        request: &RepairRequest,
        fork_url: &str,
        branch: &str,
        path: &str,
        index: u32,
        recipe: String,
    ) -> Result<BuildAttempt, RepairError> {
        let sha = hosting.push_file(fork_url, path, &recipe, branch).await?;
        let build_id = self
            .farm
            .start_build(&self.settings.repair_project, &request.repo_name)
            .await?;
        let commit = CommitRef {
            fork_url: fork_url.to_string(),
            sha,
            branch: branch.to_string(),
        };
        info!(attempt = index, build_id = %build_id, commit = %commit, "Submitted build");

        Ok(BuildAttempt {
            index,
            recipe,
            build_id,
            commit,
        })
    }

    /// Build-record link for a finished attempt. The farm indexes the job
    /// only once the build is scheduled, so it is looked up after the verdict.
    async fn report_url(&self, request: &RepairRequest, attempt: &BuildAttempt) -> String {
        let project = &self.settings.repair_project;
        let job_id = match self
            .farm
            .job_id(project, &request.repo_name, &attempt.build_id)
            .await
        {
            Ok(job_id) => Some(job_id),
            Err(e) => {
                warn!(build_id = %attempt.build_id, error = %e, "No job id for report link");
                None
            }
        };
        self.farm
            .report_url(project, &request.repo_name, job_id.as_deref())
    }

    /// Best effort: file an issue for recognizable warnings in the final log.
    async fn file_diagnostics(
        &self,
        hosting: &dyn GitHosting,
        request: &RepairRequest,
        attempt: &BuildAttempt,
    ) -> Option<String> {
        let log = match self.farm.fetch_log(&attempt.build_id).await {
            Ok(log) => log,
            Err(e) => {
                warn!(error = %e, "Could not fetch final log for diagnostics");
                return None;
            }
        };

        let warnings = scan_warnings(&log);
        if warnings.is_empty() {
            return None;
        }
        info!(warnings = warnings.len(), "Drafting issue from build warnings");

        let draft = match self.analyzer.diagnose(&warnings).await {
            Ok(Some(draft)) => draft,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Diagnosis failed");
                return None;
            }
        };

        match hosting
            .create_issue(&request.origin_repo_url, &draft.title, &draft.body)
            .await
        {
            Ok(url) => {
                info!(issue_url = %url, "Filed diagnostic issue");
                Some(url)
            }
            Err(e) => {
                warn!(error = %e, "Could not file diagnostic issue");
                None
            }
        }
    }
}
