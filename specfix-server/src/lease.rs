//! Heartbeats for claimed requests.
//!
//! A lease is kept alive from the moment a row is claimed until its outcome
//! is written, including the time it waits in the work queue. Dropping a
//! `Lease` stops the heartbeat; the row then expires and the sweep returns
//! it to `pending`.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::store::{LeaseToken, RequestId, RequestStore};

/// Renew often enough that two missed beats still leave the lease valid.
pub fn heartbeat_interval(lease_ttl: Duration) -> Duration {
    (lease_ttl / 3).max(Duration::from_millis(1))
}

pub struct Lease {
    token: LeaseToken,
    lost: CancellationToken,
    heartbeat: JoinHandle<()>,
}

impl Lease {
    /// Start renewing `token` on row `id` every `every`.
    pub fn keep(
        store: Arc<dyn RequestStore>,
        id: RequestId,
        token: LeaseToken,
        every: Duration,
    ) -> Self {
        let lost = CancellationToken::new();
        let heartbeat = tokio::spawn(renew_until_lost(
            store,
            id,
            token.clone(),
            every,
            lost.clone(),
        ));
        Self {
            token,
            lost,
            heartbeat,
        }
    }

    pub fn token(&self) -> &LeaseToken {
        &self.token
    }

    /// Cancelled once a renewal finds the row is no longer ours.
    pub fn lost(&self) -> CancellationToken {
        self.lost.clone()
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    pub fn stop(&self) {
        self.heartbeat.abort();
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.heartbeat.abort();
    }
}

async fn renew_until_lost(
    store: Arc<dyn RequestStore>,
    id: RequestId,
    token: LeaseToken,
    every: Duration,
    lost: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + every, every);
    loop {
        ticker.tick().await;
        match store.renew_lease(id, &token).await {
            Ok(true) => debug!(request_id = %id, "Renewed lease"),
            Ok(false) => {
                warn!(request_id = %id, "Lease lost");
                lost.cancel();
                break;
            }
            // Storage hiccup; the next beat tries again.
            Err(e) => warn!(request_id = %id, error = %e, "Lease renewal failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::new_request;
    use crate::store::{InMemoryRequestStore, RequestStatus};

    #[test]
    fn test_heartbeat_interval() {
        assert_eq!(
            heartbeat_interval(Duration::from_secs(600)),
            Duration::from_secs(200)
        );
        assert_eq!(heartbeat_interval(Duration::ZERO), Duration::from_millis(1));
    }

    #[tokio::test]
    async fn test_kept_lease_survives_the_sweep() {
        let store = Arc::new(InMemoryRequestStore::new());
        let id = store.insert(new_request(1)).await.unwrap();
        let claimed = store.claim_batch(1).await.unwrap().remove(0);

        let lease = Lease::keep(
            store.clone(),
            id,
            claimed.lease,
            Duration::from_millis(10),
        );
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(
            store.reclaim_stale(Duration::from_millis(60)).await.unwrap(),
            0
        );
        assert!(!lease.is_lost());
        assert_eq!(
            store.get(id).await.unwrap().unwrap().status,
            RequestStatus::Processing
        );
    }

    #[tokio::test]
    async fn test_swept_lease_is_reported_lost() {
        let store = Arc::new(InMemoryRequestStore::new());
        let id = store.insert(new_request(1)).await.unwrap();
        let claimed = store.claim_batch(1).await.unwrap().remove(0);
        store.reclaim_stale(Duration::ZERO).await.unwrap();

        let lease = Lease::keep(
            store.clone(),
            id,
            claimed.lease,
            Duration::from_millis(5),
        );
        tokio::time::timeout(Duration::from_secs(5), lease.lost().cancelled())
            .await
            .unwrap();
        assert!(lease.is_lost());
    }
}
