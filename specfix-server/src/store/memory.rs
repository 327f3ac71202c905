//! In-memory `RequestStore` used by tests.
//!
//! Mirrors the SQLite semantics exactly, including claim ordering and the
//! claim budget for failed rows.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{
    duration_millis, now_millis, ClaimedRequest, LeaseToken, NewRepairRequest, RepairRequest,
    RequestId, RequestStatus, RequestStore, StoreError, TerminalStatus, DEFAULT_MAX_CLAIMS,
};

struct Entry {
    request: RepairRequest,
    claimed_at: Option<i64>,
    /// Token of the latest claim. Kept after a terminal write, cleared when
    /// the row goes back to pending.
    lease: Option<LeaseToken>,
}

impl Entry {
    fn held_by(&self, lease: &LeaseToken) -> bool {
        self.request.status == RequestStatus::Processing && self.lease.as_ref() == Some(lease)
    }

    fn return_to_pending(&mut self) {
        self.request.status = RequestStatus::Pending;
        self.claimed_at = None;
        self.lease = None;
    }
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    // BTreeMap keeps ids in insertion order, which is the claim order.
    rows: BTreeMap<RequestId, Entry>,
}

pub struct InMemoryRequestStore {
    inner: Mutex<Inner>,
    max_claims: u32,
}

impl Default for InMemoryRequestStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRequestStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_claims: DEFAULT_MAX_CLAIMS,
        }
    }

    pub fn with_max_claims(mut self, max_claims: u32) -> Self {
        self.max_claims = max_claims;
        self
    }

    fn lock(&self, operation: &'static str) -> Result<std::sync::MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::storage(operation, "store mutex poisoned"))
    }

    /// Snapshot of every row, for assertions.
    pub fn all(&self) -> Vec<RepairRequest> {
        match self.inner.lock() {
            Ok(inner) => inner.rows.values().map(|e| e.request.clone()).collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl RequestStore for InMemoryRequestStore {
    async fn insert(&self, request: NewRepairRequest) -> Result<RequestId, StoreError> {
        let mut inner = self.lock("insert")?;
        inner.next_id += 1;
        let id = RequestId(inner.next_id);
        inner.rows.insert(
            id,
            Entry {
                request: RepairRequest {
                    id,
                    origin_repo_url: request.origin_repo_url,
                    source_repo_url: request.source_repo_url,
                    pr_number: request.pr_number,
                    repo_name: request.repo_name,
                    pr_url: request.pr_url,
                    recipe_content: request.recipe_content,
                    status: RequestStatus::Pending,
                    claim_count: 0,
                },
                claimed_at: None,
                lease: None,
            },
        );
        Ok(id)
    }

    async fn claim_batch(&self, limit: usize) -> Result<Vec<ClaimedRequest>, StoreError> {
        let mut inner = self.lock("claim batch")?;
        let now = now_millis();
        let max_claims = self.max_claims;

        let mut claimed = Vec::new();
        for entry in inner.rows.values_mut() {
            if claimed.len() >= limit {
                break;
            }
            let eligible = match entry.request.status {
                RequestStatus::Pending => true,
                RequestStatus::Failed => entry.request.claim_count < max_claims,
                RequestStatus::Processing | RequestStatus::Completed => false,
            };
            if eligible {
                let lease = LeaseToken::generate();
                entry.request.status = RequestStatus::Processing;
                entry.request.claim_count += 1;
                entry.claimed_at = Some(now);
                entry.lease = Some(lease.clone());
                claimed.push(ClaimedRequest {
                    request: entry.request.clone(),
                    lease,
                });
            }
        }
        Ok(claimed)
    }

    async fn set_status(
        &self,
        id: RequestId,
        lease: &LeaseToken,
        status: TerminalStatus,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock("set status")?;
        let entry = inner.rows.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if entry.held_by(lease) {
            entry.request.status = status.into();
            entry.claimed_at = None;
            return Ok(true);
        }
        let repeated = entry.lease.as_ref() == Some(lease)
            && entry.request.status == RequestStatus::from(status);
        Ok(repeated)
    }

    async fn renew_lease(&self, id: RequestId, lease: &LeaseToken) -> Result<bool, StoreError> {
        let mut inner = self.lock("renew lease")?;
        match inner.rows.get_mut(&id) {
            Some(entry) if entry.held_by(lease) => {
                entry.claimed_at = Some(now_millis());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reclaim_stale(&self, older_than: Duration) -> Result<usize, StoreError> {
        let mut inner = self.lock("reclaim stale")?;
        let cutoff = now_millis().saturating_sub(duration_millis(older_than));

        let mut reclaimed = 0;
        for entry in inner.rows.values_mut() {
            let stale = entry.request.status == RequestStatus::Processing
                && entry.claimed_at.is_some_and(|at| at <= cutoff);
            if stale {
                entry.return_to_pending();
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn release(&self, id: RequestId, lease: &LeaseToken) -> Result<bool, StoreError> {
        let mut inner = self.lock("release")?;
        match inner.rows.get_mut(&id) {
            Some(entry) if entry.held_by(lease) => {
                entry.return_to_pending();
                entry.request.claim_count = entry.request.claim_count.saturating_sub(1);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, id: RequestId) -> Result<Option<RepairRequest>, StoreError> {
        let inner = self.lock("get")?;
        Ok(inner.rows.get(&id).map(|e| e.request.clone()))
    }
}
