//! States of one repair and the pure step taken on a build verdict.

use std::fmt;

use crate::build_farm::BuildId;

/// Where a pushed fix lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRef {
    pub fork_url: String,
    pub sha: String,
    pub branch: String,
}

impl CommitRef {
    pub fn url(&self) -> String {
        format!("{}/commit/{}", self.fork_url.trim_end_matches('/'), self.sha)
    }

    pub fn short_sha(&self) -> &str {
        self.sha.get(..7).unwrap_or(&self.sha)
    }
}

impl fmt::Display for CommitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.branch, self.short_sha())
    }
}

/// One submit-and-wait cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildAttempt {
    /// 0 for the first build.
    pub index: u32,
    pub recipe: String,
    pub build_id: BuildId,
    pub commit: CommitRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Passed,
    Failed,
    /// No verdict before the build timeout. Retried like a failure.
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairState {
    Submitting { index: u32, recipe: String },
    Waiting { attempt: BuildAttempt },
    Retrying { failed: BuildAttempt },
    Succeeded { attempt: BuildAttempt },
    Exhausted { attempt: BuildAttempt },
}

impl RepairState {
    pub fn name(&self) -> &'static str {
        match self {
            RepairState::Submitting { .. } => "submitting",
            RepairState::Waiting { .. } => "waiting",
            RepairState::Retrying { .. } => "retrying",
            RepairState::Succeeded { .. } => "succeeded",
            RepairState::Exhausted { .. } => "exhausted",
        }
    }
}

/// Next state once a verdict for `attempt` is known.
///
/// A failure retries while `attempt.index < max_retries`, so at most
/// `max_retries + 1` builds run.
pub fn after_verdict(attempt: BuildAttempt, verdict: Verdict, max_retries: u32) -> RepairState {
    match verdict {
        Verdict::Passed => RepairState::Succeeded { attempt },
        Verdict::Failed | Verdict::TimedOut if attempt.index < max_retries => {
            RepairState::Retrying { failed: attempt }
        }
        Verdict::Failed | Verdict::TimedOut => RepairState::Exhausted { attempt },
    }
}
