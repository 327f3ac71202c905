//! Startup recovery for requests orphaned by a previous process.
//!
//! A request left at `processing` by a crash has no heartbeat renewing its
//! lease. Before serving traffic we return every such row whose lease has
//! expired to `pending` so the dispatcher picks it up again.

use std::time::Duration;

use tracing::{error, info};

use crate::store::RequestStore;

/// Returns how many rows were returned to `pending`.
pub async fn reclaim_orphaned_requests(store: &dyn RequestStore, lease_ttl: Duration) -> usize {
    info!("Starting crash recovery reconciliation...");

    match store.reclaim_stale(lease_ttl).await {
        Ok(0) => {
            info!("No orphaned requests found. Reconciliation complete.");
            0
        }
        Ok(n) => {
            info!(reclaimed = n, "Returned orphaned requests to pending");
            n
        }
        Err(e) => {
            // The dispatcher sweeps again on every tick.
            error!(error = %e, "Reconciliation failed");
            0
        }
    }
}
