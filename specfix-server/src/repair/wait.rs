//! Polling a build until it reaches a verdict.

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::build_farm::{BuildFarm, BuildFarmError, BuildId, BuildStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Passed,
    Failed,
    TimedOut,
    /// `interrupt` fired before a verdict.
    Interrupted,
}

/// Sleep `poll_interval`, poll, repeat. Any status other than passed or
/// failed keeps waiting until `timeout` has elapsed since the call.
pub async fn wait_for_verdict(
    farm: &dyn BuildFarm,
    build_id: &BuildId,
    poll_interval: Duration,
    timeout: Duration,
    interrupt: &CancellationToken,
) -> Result<WaitOutcome, BuildFarmError> {
    let deadline = Instant::now() + timeout;
    let mut polls = 0u32;

    loop {
        tokio::select! {
            _ = interrupt.cancelled() => {
                info!(build_id = %build_id, "Wait interrupted");
                return Ok(WaitOutcome::Interrupted);
            }
            _ = sleep(poll_interval) => {}
        }

        polls += 1;
        match farm.poll_status(build_id).await? {
            BuildStatus::Passed => return Ok(WaitOutcome::Passed),
            BuildStatus::Failed => return Ok(WaitOutcome::Failed),
            BuildStatus::Unknown => {
                debug!(build_id = %build_id, polls, "No verdict yet");
            }
        }

        if Instant::now() >= deadline {
            info!(build_id = %build_id, polls, "Build wait timed out");
            return Ok(WaitOutcome::TimedOut);
        }
    }
}
