//! Pull request comments reporting repair progress and outcomes.

use tracing::{info, warn};

use crate::hosting::GitHosting;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// The model's account of a fix about to be built.
    Explanation { attempt: u32, text: String },
    Succeeded {
        commit_url: String,
        report_url: String,
    },
    Exhausted {
        max_retries: u32,
        commit_url: String,
        report_url: String,
    },
    Erred { error: String },
}

impl Notice {
    pub fn render(&self) -> String {
        match self {
            Notice::Explanation { attempt, text } => {
                format!("**specfix** fix for attempt {}:\n\n{}", attempt, text)
            }
            Notice::Succeeded {
                commit_url,
                report_url,
            } => format!(
                "**specfix**: the build passed.\n\nCommit: {}\nBuild report: {}",
                commit_url, report_url
            ),
            Notice::Exhausted {
                max_retries,
                commit_url,
                report_url,
            } => format!(
                "**specfix**: the build still fails after {} repair attempt{}.\n\nLast commit: {}\nBuild report: {}",
                max_retries,
                if *max_retries == 1 { "" } else { "s" },
                commit_url,
                report_url
            ),
            Notice::Erred { error } => {
                format!("**specfix** stopped with an error:\n\n```\n{}\n```", error)
            }
        }
    }
}

/// Posts notices on one pull request.
pub struct Notifier<'a> {
    hosting: &'a dyn GitHosting,
    origin_repo_url: &'a str,
    pr_number: u64,
}

impl<'a> Notifier<'a> {
    pub fn new(hosting: &'a dyn GitHosting, origin_repo_url: &'a str, pr_number: u64) -> Self {
        Self {
            hosting,
            origin_repo_url,
            pr_number,
        }
    }

    /// Post `notice`. A failed post is logged and reported as `false`; it
    /// never affects the repair.
    pub async fn post(&self, notice: &Notice) -> bool {
        match self
            .hosting
            .comment(self.origin_repo_url, self.pr_number, &notice.render())
            .await
        {
            Ok(()) => {
                info!(pr_number = self.pr_number, "Posted notice");
                true
            }
            Err(e) => {
                warn!(
                    pr_number = self.pr_number,
                    error = %e,
                    "Failed to post notice"
                );
                false
            }
        }
    }
}
