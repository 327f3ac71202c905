//! The dispatch loop: claim eligible rows and hand them to the workers.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::lease::{heartbeat_interval, Lease};
use crate::store::{ClaimedRequest, RepairRequest, RequestStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    pub interval: Duration,
    pub batch_size: usize,
    /// `processing` rows whose lease is older than this go back to `pending`.
    pub lease_ttl: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            batch_size: 8,
            lease_ttl: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("work queue closed")]
    QueueClosed,
}

/// A claimed request on its way to a worker. Its lease is renewed for as
/// long as the item exists.
pub struct WorkItem {
    pub request: RepairRequest,
    pub lease: Lease,
}

impl WorkItem {
    pub fn hold(store: &Arc<dyn RequestStore>, claimed: ClaimedRequest, lease_ttl: Duration) -> Self {
        let lease = Lease::keep(
            store.clone(),
            claimed.request.id,
            claimed.lease,
            heartbeat_interval(lease_ttl),
        );
        Self {
            request: claimed.request,
            lease,
        }
    }
}

/// The in-process queue between the dispatcher and the workers. It holds at
/// most one batch.
pub fn work_queue(settings: &DispatchSettings) -> (mpsc::Sender<WorkItem>, mpsc::Receiver<WorkItem>) {
    mpsc::channel(settings.batch_size.max(1))
}

/// One tick: sweep expired leases, claim a batch, enqueue every claimed row.
///
/// Returns how many rows were enqueued. Rows that cannot be enqueued because
/// of shutdown or a closed queue are released back to `pending`.
#[instrument(skip_all)]
pub async fn dispatch_once(
    store: &Arc<dyn RequestStore>,
    queue: &mpsc::Sender<WorkItem>,
    settings: &DispatchSettings,
    shutdown: &CancellationToken,
) -> Result<usize, DispatchError> {
    match store.reclaim_stale(settings.lease_ttl).await {
        Ok(0) => {}
        Ok(n) => warn!(reclaimed = n, "Returned requests with expired leases to pending"),
        Err(e) => error!(error = %e, "Lease sweep failed"),
    }

    let claimed = store.claim_batch(settings.batch_size).await?;
    if claimed.is_empty() {
        debug!("Nothing to dispatch");
        return Ok(0);
    }
    info!(count = claimed.len(), "Claimed requests");

    // Heartbeats start now: a full queue can hold these rows for longer
    // than a lease lasts.
    let mut items = claimed
        .into_iter()
        .map(|c| WorkItem::hold(store, c, settings.lease_ttl))
        .collect::<Vec<_>>()
        .into_iter();

    let mut sent = 0;
    while let Some(item) = items.next() {
        let permit = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            permit = queue.reserve() => permit.ok(),
        };

        match permit {
            Some(permit) => {
                debug!(request_id = %item.request.id, "Enqueued request");
                permit.send(item);
                sent += 1;
            }
            None => {
                let unsent: Vec<WorkItem> = std::iter::once(item).chain(items).collect();
                release_all(store.as_ref(), unsent).await;
                if shutdown.is_cancelled() {
                    return Ok(sent);
                }
                return Err(DispatchError::QueueClosed);
            }
        }
    }

    Ok(sent)
}

/// Give unstarted items back to `pending`.
pub(crate) async fn release_all(store: &dyn RequestStore, items: Vec<WorkItem>) {
    for item in items {
        item.lease.stop();
        let id = item.request.id;
        match store.release(id, item.lease.token()).await {
            Ok(true) => debug!(request_id = %id, "Released request"),
            Ok(false) => debug!(request_id = %id, "Request no longer held, nothing to release"),
            Err(e) => error!(request_id = %id, error = %e, "Failed to release request"),
        }
    }
}

/// Runs until `shutdown` fires or the queue closes. Claim failures are
/// logged and retried on the next tick.
pub async fn dispatch_loop(
    store: Arc<dyn RequestStore>,
    queue: mpsc::Sender<WorkItem>,
    settings: DispatchSettings,
    shutdown: CancellationToken,
) {
    info!(
        interval_secs = settings.interval.as_secs(),
        batch_size = settings.batch_size,
        "Dispatcher started"
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(settings.interval) => {}
        }

        match dispatch_once(&store, &queue, &settings, &shutdown).await {
            Ok(_) => {}
            Err(DispatchError::QueueClosed) => {
                warn!("Work queue closed, dispatcher stopping");
                break;
            }
            Err(e) => error!(error = %e, "Dispatch tick failed"),
        }
    }

    info!("Dispatcher stopped");
}
