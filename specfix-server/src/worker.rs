//! The worker pool draining the work queue.
//!
//! Every claimed request runs in its own task so that a panic in a repair
//! is observed here and turned into a `failed` status. The item's lease keeps
//! being renewed while the repair runs; if it is lost the repair is
//! interrupted and nothing is written back.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::dispatch::{release_all, WorkItem};
use crate::hosting::HostingRegistry;
use crate::repair::{RepairMachine, RepairOutcome};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::store::{LeaseToken, RequestId, RequestStore, TerminalStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    pub worker_count: usize,
    /// How long in-flight repairs may run after shutdown before they are interrupted.
    pub shutdown_grace: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            worker_count: 4,
            shutdown_grace: Duration::from_secs(60),
        }
    }
}

/// What every worker shares.
pub struct WorkerContext {
    pub store: Arc<dyn RequestStore>,
    pub hosting: Arc<HostingRegistry>,
    pub machine: Arc<RepairMachine>,
    pub settings: WorkerSettings,
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    receiver: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    store: Arc<dyn RequestStore>,
    interrupt: CancellationToken,
}

impl WorkerPool {
    /// Start `settings.worker_count` workers. They stop taking new work once
    /// `shutdown` fires.
    pub fn spawn(
        context: Arc<WorkerContext>,
        receiver: mpsc::Receiver<WorkItem>,
        shutdown: CancellationToken,
    ) -> Self {
        let receiver = Arc::new(Mutex::new(receiver));
        let interrupt = CancellationToken::new();
        let count = context.settings.worker_count.max(1);

        let handles = (0..count)
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    context.clone(),
                    receiver.clone(),
                    shutdown.clone(),
                    interrupt.clone(),
                ))
            })
            .collect();

        info!(workers = count, "Worker pool started");

        Self {
            handles,
            receiver,
            store: context.store.clone(),
            interrupt,
        }
    }

    /// Wait for the workers after shutdown was signalled. Repairs still
    /// running after `grace` are interrupted and their rows released.
    /// Requests left in the queue are released too.
    pub async fn shutdown(self, grace: Duration) {
        let WorkerPool {
            handles,
            receiver,
            store,
            interrupt,
        } = self;

        let join_all = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task ended abnormally");
                }
            }
        };
        tokio::pin!(join_all);

        tokio::select! {
            _ = &mut join_all => {}
            _ = tokio::time::sleep(grace) => {
                warn!(grace_secs = grace.as_secs(), "Grace period over, interrupting repairs");
                interrupt.cancel();
                join_all.await;
            }
        }

        let mut leftover = Vec::new();
        {
            let mut receiver = receiver.lock().await;
            receiver.close();
            while let Ok(item) = receiver.try_recv() {
                leftover.push(item);
            }
        }
        if !leftover.is_empty() {
            info!(count = leftover.len(), "Releasing queued requests");
            release_all(store.as_ref(), leftover).await;
        }

        info!("Worker pool stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    context: Arc<WorkerContext>,
    receiver: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    shutdown: CancellationToken,
    interrupt: CancellationToken,
) {
    loop {
        let next = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                item = receiver.recv() => item,
            }
        };

        let Some(item) = next else {
            break;
        };
        if !still_held(context.store.as_ref(), &item).await {
            continue;
        }
        process_request(worker_id, &context, item, &interrupt).await;
    }
    debug!(worker = worker_id, "Worker stopped");
}

/// Whether the item's claim is still the row's current one. Storage errors
/// count as held; the final write is guarded by the lease anyway.
async fn still_held(store: &dyn RequestStore, item: &WorkItem) -> bool {
    let id = item.request.id;
    if item.lease.is_lost() {
        warn!(request_id = %id, "Dropping request whose lease was lost in the queue");
        return false;
    }
    match store.renew_lease(id, item.lease.token()).await {
        Ok(true) => true,
        Ok(false) => {
            warn!(request_id = %id, "Dropping request claimed by someone else");
            false
        }
        Err(e) => {
            warn!(request_id = %id, error = %e, "Could not confirm lease");
            true
        }
    }
}

/// Run one claimed request and write its outcome back.
#[instrument(skip_all, fields(worker = worker_id, request_id = %item.request.id))]
pub async fn process_request(
    worker_id: usize,
    context: &Arc<WorkerContext>,
    item: WorkItem,
    interrupt: &CancellationToken,
) -> RepairOutcome {
    let WorkItem { request, lease } = item;
    let id = request.id;

    // Interrupted by shutdown or by losing the lease, whichever comes first.
    let stop = interrupt.child_token();
    let watcher = {
        let lost = lease.lost();
        let stop = stop.clone();
        tokio::spawn(async move {
            lost.cancelled().await;
            stop.cancel();
        })
    };

    let task = {
        let context = context.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            let hosting = match context.hosting.for_url(&request.origin_repo_url) {
                Ok(hosting) => hosting,
                Err(e) => {
                    error!(error = %e, "No hosting adapter for request");
                    return RepairOutcome::Erred {
                        error: e.to_string(),
                    };
                }
            };
            context.machine.run(hosting.as_ref(), &request, &stop).await
        })
    };

    let outcome = match task.await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(error = %e, "Repair task panicked");
            RepairOutcome::Erred {
                error: format!("repair task failed: {}", e),
            }
        }
    };
    watcher.abort();

    match outcome.terminal_status() {
        Some(status) => persist_status(context.store.as_ref(), id, lease.token(), status).await,
        None if lease.is_lost() => {
            warn!("Repair stopped after its lease was lost; leaving the row to its new holder");
        }
        None => {
            info!("Repair interrupted, releasing request");
            lease.stop();
            match context.store.release(id, lease.token()).await {
                Ok(true) => {}
                Ok(false) => warn!("Request was no longer held when released"),
                Err(e) => error!(error = %e, "Failed to release interrupted request"),
            }
        }
    }

    outcome
}

async fn persist_status(
    store: &dyn RequestStore,
    id: RequestId,
    lease: &LeaseToken,
    status: TerminalStatus,
) {
    let result = retry_with_backoff(RetryConfig::PERSIST, "set_status", move || {
        store.set_status(id, lease, status)
    })
    .await;

    match result {
        Ok(true) => info!(status = %status, "Recorded outcome"),
        Ok(false) => warn!(status = %status, "Lease lost before the outcome was recorded"),
        // The lease sweep returns the row to pending.
        Err(e) => error!(status = %status, error = %e, "Failed to record outcome"),
    }
}
