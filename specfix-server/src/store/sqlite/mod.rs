//! SQLite implementation of `RequestStore`.
//!
//! # Claims
//!
//! SQLite has no row-level locks. `claim_batch` takes the database write
//! lock up front with `BEGIN IMMEDIATE` and selects and updates the rows in
//! one `UPDATE … RETURNING` statement, so two claimers (threads or
//! processes sharing the file) can never receive the same row.
//!
//! # Leases
//!
//! `claimed_at` is set on claim and refreshed by `renew_lease`. Rows stuck in
//! `processing` with an old lease are returned to `pending` by
//! `reclaim_stale`. Each claim writes a fresh random `lease_token`; every
//! later write for that claim is conditioned on it.
//!
//! # Schema Versioning
//!
//! The `schema_version` table tracks the schema version. To change the
//! schema, increment `CURRENT_SCHEMA_VERSION` and add a step to
//! `run_migrations()`.

#[cfg(test)]
mod tests;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::warn;

use super::{
    duration_millis, now_millis, ClaimedRequest, LeaseToken, NewRepairRequest, RepairRequest,
    RequestId, RequestStatus, RequestStore, StoreError, TerminalStatus, DEFAULT_MAX_CLAIMS,
};

const CURRENT_SCHEMA_VERSION: i64 = 1;

const RETURNED_COLUMNS: &str = "id, origin_repo_url, source_repo_url, pr_number, repo_name, \
     pr_url, recipe_content, status, claim_count";

/// SQLite-backed request store.
///
/// Uses `tokio::task::spawn_blocking` to run synchronous rusqlite operations
/// without blocking the async runtime.
pub struct SqliteRequestStore {
    /// Exposed to tests so they can age leases directly.
    pub(crate) conn: Arc<Mutex<Connection>>,
    max_claims: u32,
}

impl SqliteRequestStore {
    /// Open (or create) the database at `path` and bring its schema up to date.
    ///
    /// # Durability
    ///
    /// - `journal_mode = WAL`, verified after setting
    /// - `synchronous = FULL`
    /// - `busy_timeout = 5000ms`
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path_ref = path.as_ref();
        let path_str = path_ref.to_string_lossy();
        let is_in_memory = path_str == ":memory:";

        if !is_in_memory && !path_str.is_empty() {
            if let Some(parent) = path_ref.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        StoreError::storage(
                            "create database directory",
                            format!("{}: {}", parent.display(), e),
                        )
                    })?;

                    // Covers the WAL and SHM files SQLite creates next to the database.
                    #[cfg(unix)]
                    {
                        use std::os::unix::fs::PermissionsExt;
                        let dir_permissions = std::fs::Permissions::from_mode(0o700);
                        if let Err(e) = std::fs::set_permissions(parent, dir_permissions) {
                            warn!(
                                "Failed to set restrictive permissions on state directory: {}",
                                e
                            );
                        }
                    }
                }
            }
        }

        let conn = Connection::open(path_ref)
            .map_err(|e| StoreError::storage("open database", e.to_string()))?;

        // Stored recipes and URLs may point at private repositories.
        #[cfg(unix)]
        if !is_in_memory && !path_str.is_empty() {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = std::fs::set_permissions(path_ref, permissions) {
                warn!(
                    "Failed to set restrictive permissions on database file: {}",
                    e
                );
            }
        }

        // SQLite silently keeps DELETE mode on filesystems without shared
        // memory support, so check what we actually got.
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| StoreError::storage("set journal_mode", e.to_string()))?;

        let journal_mode_ok = journal_mode.eq_ignore_ascii_case("wal")
            || (is_in_memory && journal_mode.eq_ignore_ascii_case("memory"));

        if !journal_mode_ok {
            return Err(StoreError::storage(
                "configure journal_mode",
                format!(
                    "Failed to enable WAL mode: SQLite returned '{}' instead of 'wal'",
                    journal_mode
                ),
            ));
        }

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            "#,
        )
        .map_err(|e| StoreError::storage("configure pragmas", e.to_string()))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| StoreError::storage("create schema_version table", e.to_string()))?;

        let current_version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::storage("get schema version", e.to_string()))?
            .unwrap_or(0);

        Self::run_migrations(&conn, current_version)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            max_claims: DEFAULT_MAX_CLAIMS,
        })
    }

    pub fn new_in_memory() -> Result<Self, StoreError> {
        Self::new(":memory:")
    }

    /// Limit how many times a `failed` row may be claimed again.
    pub fn with_max_claims(mut self, max_claims: u32) -> Self {
        self.max_claims = max_claims;
        self
    }

    fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), StoreError> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::storage(
                "schema version",
                format!(
                    "Database schema version {} is newer than supported version {}. \
                     Please upgrade the application.",
                    from_version, CURRENT_SCHEMA_VERSION
                ),
            ));
        }

        if from_version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS repair_requests (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    origin_repo_url TEXT NOT NULL,
                    source_repo_url TEXT NOT NULL,
                    pr_number INTEGER NOT NULL,
                    repo_name TEXT NOT NULL,
                    pr_url TEXT NOT NULL,
                    recipe_content TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending'
                        CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
                    claim_count INTEGER NOT NULL DEFAULT 0,
                    claimed_at INTEGER,
                    lease_token TEXT,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_repair_requests_status
                    ON repair_requests(status);
                CREATE INDEX IF NOT EXISTS idx_repair_requests_lease
                    ON repair_requests(claimed_at) WHERE status = 'processing';
                "#,
            )
            .map_err(|e| StoreError::storage("migration v1", e.to_string()))?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| StoreError::storage("update schema version", e.to_string()))?;

        Ok(())
    }

    async fn with_conn<T, F>(&self, operation: &'static str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = lock(&conn, operation)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::storage(operation, e.to_string()))?
    }
}

fn lock<'a>(
    conn: &'a Mutex<Connection>,
    operation: &'static str,
) -> Result<MutexGuard<'a, Connection>, StoreError> {
    conn.lock()
        .map_err(|_| StoreError::storage(operation, "connection mutex poisoned"))
}

fn pr_number_to_i64(pr_number: u64) -> Result<i64, StoreError> {
    i64::try_from(pr_number).map_err(|_| {
        StoreError::storage(
            "convert pr_number",
            format!("PR number {} exceeds i64::MAX", pr_number),
        )
    })
}

/// Raw column values; converted to `RepairRequest` outside the rusqlite closure
/// so that conversion failures surface as `StoreError::Corruption`.
struct RawRow {
    id: i64,
    origin_repo_url: String,
    source_repo_url: String,
    pr_number: i64,
    repo_name: String,
    pr_url: String,
    recipe_content: String,
    status: String,
    claim_count: i64,
}

impl RawRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            origin_repo_url: row.get(1)?,
            source_repo_url: row.get(2)?,
            pr_number: row.get(3)?,
            repo_name: row.get(4)?,
            pr_url: row.get(5)?,
            recipe_content: row.get(6)?,
            status: row.get(7)?,
            claim_count: row.get(8)?,
        })
    }

    fn into_request(self) -> Result<RepairRequest, StoreError> {
        let status = RequestStatus::parse(&self.status).ok_or_else(|| {
            StoreError::corruption(format!(
                "request {} has unknown status '{}'",
                self.id, self.status
            ))
        })?;
        let pr_number = u64::try_from(self.pr_number).map_err(|_| {
            StoreError::corruption(format!(
                "request {} has negative PR number {}",
                self.id, self.pr_number
            ))
        })?;
        let claim_count = u32::try_from(self.claim_count).map_err(|_| {
            StoreError::corruption(format!(
                "request {} has invalid claim count {}",
                self.id, self.claim_count
            ))
        })?;

        Ok(RepairRequest {
            id: RequestId(self.id),
            origin_repo_url: self.origin_repo_url,
            source_repo_url: self.source_repo_url,
            pr_number,
            repo_name: self.repo_name,
            pr_url: self.pr_url,
            recipe_content: self.recipe_content,
            status,
            claim_count,
        })
    }
}

fn insert_sync(conn: &Connection, request: &NewRepairRequest) -> Result<RequestId, StoreError> {
    let now = now_millis();
    conn.execute(
        r#"
        INSERT INTO repair_requests
            (origin_repo_url, source_repo_url, pr_number, repo_name, pr_url,
             recipe_content, status, claim_count, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0, ?7, ?7)
        "#,
        params![
            request.origin_repo_url,
            request.source_repo_url,
            pr_number_to_i64(request.pr_number)?,
            request.repo_name,
            request.pr_url,
            request.recipe_content,
            now
        ],
    )
    .map_err(|e| StoreError::storage("insert", e.to_string()))?;

    Ok(RequestId(conn.last_insert_rowid()))
}

fn claim_batch_sync(
    conn: &mut Connection,
    limit: usize,
    max_claims: u32,
) -> Result<Vec<ClaimedRequest>, StoreError> {
    if limit == 0 {
        return Ok(Vec::new());
    }
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let now = now_millis();

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| StoreError::storage("claim batch", e.to_string()))?;

    let raw_rows = {
        let sql = format!(
            r#"
            UPDATE repair_requests
            SET status = 'processing',
                claim_count = claim_count + 1,
                claimed_at = ?1,
                lease_token = lower(hex(randomblob(16))),
                updated_at = ?1
            WHERE id IN (
                SELECT id FROM repair_requests
                WHERE status = 'pending'
                   OR (status = 'failed' AND claim_count < ?2)
                ORDER BY created_at, id
                LIMIT ?3
            )
            RETURNING {}, lease_token
            "#,
            RETURNED_COLUMNS
        );
        let mut stmt = tx
            .prepare(&sql)
            .map_err(|e| StoreError::storage("claim batch", e.to_string()))?;
        let rows = stmt
            .query_map(params![now, max_claims, limit], |row| {
                Ok((RawRow::from_row(row)?, row.get::<_, String>(9)?))
            })
            .map_err(|e| StoreError::storage("claim batch", e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::storage("claim batch", e.to_string()))?;
        rows
    };

    // Convert before committing: a corrupt row aborts the whole claim.
    let mut claimed = raw_rows
        .into_iter()
        .map(|(raw, lease)| {
            Ok(ClaimedRequest {
                request: raw.into_request()?,
                lease: LeaseToken(lease),
            })
        })
        .collect::<Result<Vec<_>, StoreError>>()?;

    tx.commit()
        .map_err(|e| StoreError::storage("claim batch commit", e.to_string()))?;

    // RETURNING order is unspecified.
    claimed.sort_by_key(|c| c.request.id);
    Ok(claimed)
}

fn set_status_sync(
    conn: &Connection,
    id: RequestId,
    lease: &LeaseToken,
    status: TerminalStatus,
) -> Result<bool, StoreError> {
    let target = RequestStatus::from(status).as_str();
    let changed = conn
        .execute(
            r#"
            UPDATE repair_requests
            SET status = ?3, claimed_at = NULL, updated_at = ?4
            WHERE id = ?1 AND status = 'processing' AND lease_token = ?2
            "#,
            params![id.0, lease.0, target, now_millis()],
        )
        .map_err(|e| StoreError::storage("set status", e.to_string()))?;
    if changed > 0 {
        return Ok(true);
    }

    // The lease token survives the terminal write, so a repeated write by
    // the same holder is recognised here.
    let current: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT status, lease_token FROM repair_requests WHERE id = ?1",
            params![id.0],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| StoreError::storage("set status", e.to_string()))?;

    match current {
        None => Err(StoreError::NotFound(id)),
        Some((current, token)) => Ok(current == target && token.as_deref() == Some(&*lease.0)),
    }
}

fn renew_lease_sync(conn: &Connection, id: RequestId, lease: &LeaseToken) -> Result<bool, StoreError> {
    let changed = conn
        .execute(
            r#"
            UPDATE repair_requests
            SET claimed_at = ?3
            WHERE id = ?1 AND status = 'processing' AND lease_token = ?2
            "#,
            params![id.0, lease.0, now_millis()],
        )
        .map_err(|e| StoreError::storage("renew lease", e.to_string()))?;
    Ok(changed > 0)
}

fn reclaim_stale_sync(conn: &Connection, older_than: Duration) -> Result<usize, StoreError> {
    let now = now_millis();
    let cutoff = now.saturating_sub(duration_millis(older_than));
    conn.execute(
        r#"
        UPDATE repair_requests
        SET status = 'pending', claimed_at = NULL, lease_token = NULL, updated_at = ?2
        WHERE status = 'processing'
          AND (claimed_at IS NULL OR claimed_at <= ?1)
        "#,
        params![cutoff, now],
    )
    .map_err(|e| StoreError::storage("reclaim stale", e.to_string()))
}

fn release_sync(conn: &Connection, id: RequestId, lease: &LeaseToken) -> Result<bool, StoreError> {
    let changed = conn
        .execute(
            r#"
            UPDATE repair_requests
            SET status = 'pending',
                claimed_at = NULL,
                lease_token = NULL,
                claim_count = MAX(claim_count - 1, 0),
                updated_at = ?3
            WHERE id = ?1 AND status = 'processing' AND lease_token = ?2
            "#,
            params![id.0, lease.0, now_millis()],
        )
        .map_err(|e| StoreError::storage("release", e.to_string()))?;
    Ok(changed > 0)
}

fn get_sync(conn: &Connection, id: RequestId) -> Result<Option<RepairRequest>, StoreError> {
    let sql = format!("SELECT {} FROM repair_requests WHERE id = ?1", RETURNED_COLUMNS);
    conn.query_row(&sql, params![id.0], RawRow::from_row)
        .optional()
        .map_err(|e| StoreError::storage("get", e.to_string()))?
        .map(RawRow::into_request)
        .transpose()
}

#[async_trait]
impl RequestStore for SqliteRequestStore {
    async fn insert(&self, request: NewRepairRequest) -> Result<RequestId, StoreError> {
        self.with_conn("insert", move |conn| insert_sync(conn, &request))
            .await
    }

    async fn claim_batch(&self, limit: usize) -> Result<Vec<ClaimedRequest>, StoreError> {
        let max_claims = self.max_claims;
        self.with_conn("claim batch", move |conn| {
            claim_batch_sync(conn, limit, max_claims)
        })
        .await
    }

    async fn set_status(
        &self,
        id: RequestId,
        lease: &LeaseToken,
        status: TerminalStatus,
    ) -> Result<bool, StoreError> {
        let lease = lease.clone();
        self.with_conn("set status", move |conn| {
            set_status_sync(conn, id, &lease, status)
        })
        .await
    }

    async fn renew_lease(&self, id: RequestId, lease: &LeaseToken) -> Result<bool, StoreError> {
        let lease = lease.clone();
        self.with_conn("renew lease", move |conn| renew_lease_sync(conn, id, &lease))
            .await
    }

    async fn reclaim_stale(&self, older_than: Duration) -> Result<usize, StoreError> {
        self.with_conn("reclaim stale", move |conn| {
            reclaim_stale_sync(conn, older_than)
        })
        .await
    }

    async fn release(&self, id: RequestId, lease: &LeaseToken) -> Result<bool, StoreError> {
        let lease = lease.clone();
        self.with_conn("release", move |conn| release_sync(conn, id, &lease))
            .await
    }

    async fn get(&self, id: RequestId) -> Result<Option<RepairRequest>, StoreError> {
        self.with_conn("get", move |conn| get_sync(conn, id)).await
    }
}
