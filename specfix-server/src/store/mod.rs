//! Durable storage of repair requests.
//!
//! A request moves `pending -> processing -> {completed, failed}`. `failed`
//! rows may be claimed again (retry-from-store); `completed` is final. The
//! claim transition is the only way to obtain `processing` custody, and it
//! is exclusive per row.
//!
//! Every claim mints a fresh `LeaseToken`. Lease renewal, release and the
//! terminal write only take effect while the row is still `processing`
//! under that token, so a holder whose lease was swept cannot touch a row
//! that is pending again or held by a newer claim.

pub mod memory;
pub mod sqlite;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::Retryable;

pub use memory::InMemoryRequestStore;
pub use sqlite::SqliteRequestStore;

/// Failed rows stop being eligible for claims after this many claims.
pub const DEFAULT_MAX_CLAIMS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub i64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Processing => "processing",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RequestStatus::Pending),
            "processing" => Some(RequestStatus::Processing),
            "completed" => Some(RequestStatus::Completed),
            "failed" => Some(RequestStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one claim of one row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseToken(pub String);

impl LeaseToken {
    pub fn generate() -> Self {
        LeaseToken(uuid::Uuid::new_v4().simple().to_string())
    }
}

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The statuses a worker may write back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TerminalStatus {
    Completed,
    Failed,
}

impl From<TerminalStatus> for RequestStatus {
    fn from(status: TerminalStatus) -> Self {
        match status {
            TerminalStatus::Completed => RequestStatus::Completed,
            TerminalStatus::Failed => RequestStatus::Failed,
        }
    }
}

impl fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        RequestStatus::from(*self).fmt(f)
    }
}

/// What the inbound gate hands over for storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRepairRequest {
    pub origin_repo_url: String,
    pub source_repo_url: String,
    pub pr_number: u64,
    pub repo_name: String,
    pub pr_url: String,
    pub recipe_content: String,
}

/// A stored request as returned by claims and reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairRequest {
    pub id: RequestId,
    pub origin_repo_url: String,
    pub source_repo_url: String,
    pub pr_number: u64,
    pub repo_name: String,
    pub pr_url: String,
    pub recipe_content: String,
    pub status: RequestStatus,
    /// How many times this row has been claimed, including the current claim.
    pub claim_count: u32,
}

/// A row handed out by `claim_batch` together with the token of that claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedRequest {
    pub request: RepairRequest,
    pub lease: LeaseToken,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage failure during {operation}: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },
    #[error("corrupt row: {0}")]
    Corruption(String),
    #[error("request {0} not found")]
    NotFound(RequestId),
}

impl StoreError {
    pub fn storage(operation: &'static str, message: impl Into<String>) -> Self {
        StoreError::Storage {
            operation,
            message: message.into(),
        }
    }

    pub fn corruption(message: impl Into<String>) -> Self {
        StoreError::Corruption(message.into())
    }
}

impl Retryable for StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, StoreError::Storage { .. })
    }
}

#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Persist a new request with status `pending`.
    async fn insert(&self, request: NewRepairRequest) -> Result<RequestId, StoreError>;

    /// Atomically move up to `limit` eligible rows to `processing` and return them.
    ///
    /// Eligible means `pending`, or `failed` with fewer than the store's
    /// maximum number of claims. Nothing eligible is an empty vec, not an error.
    async fn claim_batch(&self, limit: usize) -> Result<Vec<ClaimedRequest>, StoreError>;

    /// Record a terminal outcome for the claim `lease`.
    ///
    /// Returns false, changing nothing, when the row is no longer
    /// `processing` under `lease`. Repeating a write that already succeeded
    /// under the same lease is a no-op that returns true.
    async fn set_status(
        &self,
        id: RequestId,
        lease: &LeaseToken,
        status: TerminalStatus,
    ) -> Result<bool, StoreError>;

    /// Refresh the lease on a `processing` row. Returns false if the row is
    /// no longer `processing` under `lease`.
    async fn renew_lease(&self, id: RequestId, lease: &LeaseToken) -> Result<bool, StoreError>;

    /// Return `processing` rows whose lease is at least `older_than` old to
    /// `pending`. Returns how many rows were moved.
    async fn reclaim_stale(&self, older_than: Duration) -> Result<usize, StoreError>;

    /// Give a `processing` row back to `pending` without a verdict. The
    /// claim does not count against the row's claim budget.
    async fn release(&self, id: RequestId, lease: &LeaseToken) -> Result<bool, StoreError>;

    async fn get(&self, id: RequestId) -> Result<Option<RepairRequest>, StoreError>;
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
