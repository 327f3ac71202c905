//! Tests for the SQLite request store.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use rusqlite::params;

use super::{SqliteRequestStore, CURRENT_SCHEMA_VERSION};
use crate::store::{
    LeaseToken, NewRepairRequest, RequestId, RequestStatus, RequestStore, StoreError,
    TerminalStatus,
};

fn sample(pr_number: u64) -> NewRepairRequest {
    NewRepairRequest {
        origin_repo_url: "https://gitee.com/src-openeuler/zlib".to_string(),
        source_repo_url: "https://gitee.com/alice/zlib".to_string(),
        pr_number,
        repo_name: "zlib".to_string(),
        pr_url: format!("https://gitee.com/src-openeuler/zlib/pulls/{}", pr_number),
        recipe_content: "Name: zlib\nVersion: 1.3".to_string(),
    }
}

#[tokio::test]
async fn test_insert_then_get_returns_pending_row() {
    let store = SqliteRequestStore::new_in_memory().unwrap();
    let id = store.insert(sample(42)).await.unwrap();

    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, RequestStatus::Pending);
    assert_eq!(row.pr_number, 42);
    assert_eq!(row.recipe_content, "Name: zlib\nVersion: 1.3");
    assert_eq!(row.claim_count, 0);
}

#[tokio::test]
async fn test_get_missing_row() {
    let store = SqliteRequestStore::new_in_memory().unwrap();
    assert!(store.get(RequestId(99)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_claim_batch_empty_store_returns_nothing() {
    let store = SqliteRequestStore::new_in_memory().unwrap();
    assert!(store.claim_batch(8).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_claim_batch_respects_limit_and_order() {
    let store = SqliteRequestStore::new_in_memory().unwrap();
    let mut ids = Vec::new();
    for pr in 1..=5 {
        ids.push(store.insert(sample(pr)).await.unwrap());
    }

    let first = store.claim_batch(3).await.unwrap();
    assert_eq!(
        first.iter().map(|c| c.request.id).collect::<Vec<_>>(),
        ids[..3]
    );
    assert!(first
        .iter()
        .all(|c| c.request.status == RequestStatus::Processing && c.request.claim_count == 1));
    let leases: HashSet<&LeaseToken> = first.iter().map(|c| &c.lease).collect();
    assert_eq!(leases.len(), 3, "every row gets its own lease");

    let second = store.claim_batch(3).await.unwrap();
    assert_eq!(
        second.iter().map(|c| c.request.id).collect::<Vec<_>>(),
        ids[3..]
    );

    assert!(store.claim_batch(3).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_claim_batch_zero_limit() {
    let store = SqliteRequestStore::new_in_memory().unwrap();
    store.insert(sample(1)).await.unwrap();
    assert!(store.claim_batch(0).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_rows_are_reclaimed_until_budget_spent() {
    let store = SqliteRequestStore::new_in_memory()
        .unwrap()
        .with_max_claims(2);
    let id = store.insert(sample(1)).await.unwrap();

    let claimed = store.claim_batch(1).await.unwrap().remove(0);
    assert_eq!(claimed.request.claim_count, 1);
    store
        .set_status(id, &claimed.lease, TerminalStatus::Failed)
        .await
        .unwrap();

    let claimed = store.claim_batch(1).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].request.claim_count, 2);
    store
        .set_status(id, &claimed[0].lease, TerminalStatus::Failed)
        .await
        .unwrap();

    assert!(store.claim_batch(1).await.unwrap().is_empty());
    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, RequestStatus::Failed);
}

#[tokio::test]
async fn test_set_status_completed_is_idempotent_and_final() {
    let store = SqliteRequestStore::new_in_memory().unwrap();
    let id = store.insert(sample(1)).await.unwrap();
    let lease = store.claim_batch(1).await.unwrap().remove(0).lease;

    assert!(store
        .set_status(id, &lease, TerminalStatus::Completed)
        .await
        .unwrap());
    assert!(store
        .set_status(id, &lease, TerminalStatus::Completed)
        .await
        .unwrap());
    assert!(!store
        .set_status(id, &lease, TerminalStatus::Failed)
        .await
        .unwrap());

    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, RequestStatus::Completed);

    assert!(store.claim_batch(10).await.unwrap().is_empty());
    assert!(!store.release(id, &lease).await.unwrap());
    assert_eq!(store.reclaim_stale(Duration::ZERO).await.unwrap(), 0);
}

#[tokio::test]
async fn test_swept_holder_cannot_overwrite_pending_or_newer_claim() {
    let store = SqliteRequestStore::new_in_memory().unwrap();
    let id = store.insert(sample(1)).await.unwrap();
    let old = store.claim_batch(1).await.unwrap().remove(0).lease;

    assert_eq!(store.reclaim_stale(Duration::ZERO).await.unwrap(), 1);
    assert!(!store
        .set_status(id, &old, TerminalStatus::Failed)
        .await
        .unwrap());
    assert_eq!(
        store.get(id).await.unwrap().unwrap().status,
        RequestStatus::Pending
    );

    let new = store.claim_batch(1).await.unwrap().remove(0).lease;
    assert_ne!(new, old);
    assert!(!store.renew_lease(id, &old).await.unwrap());
    assert!(!store.release(id, &old).await.unwrap());
    assert!(!store
        .set_status(id, &old, TerminalStatus::Completed)
        .await
        .unwrap());
    assert_eq!(
        store.get(id).await.unwrap().unwrap().status,
        RequestStatus::Processing
    );

    assert!(store.renew_lease(id, &new).await.unwrap());
    assert!(store
        .set_status(id, &new, TerminalStatus::Failed)
        .await
        .unwrap());
    assert_eq!(
        store.get(id).await.unwrap().unwrap().status,
        RequestStatus::Failed
    );
}

#[tokio::test]
async fn test_set_status_unknown_id() {
    let store = SqliteRequestStore::new_in_memory().unwrap();
    let err = store
        .set_status(RequestId(7), &LeaseToken::generate(), TerminalStatus::Failed)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(RequestId(7))));
}

#[tokio::test]
async fn test_reclaim_stale_only_touches_old_leases() {
    let store = SqliteRequestStore::new_in_memory().unwrap();
    let old = store.insert(sample(1)).await.unwrap();
    let fresh = store.insert(sample(2)).await.unwrap();
    store.claim_batch(2).await.unwrap();

    // Age one lease by an hour.
    {
        let conn = store.conn.lock().unwrap();
        conn.execute(
            "UPDATE repair_requests SET claimed_at = claimed_at - 3600000 WHERE id = ?1",
            params![old.0],
        )
        .unwrap();
    }

    let reclaimed = store
        .reclaim_stale(Duration::from_secs(600))
        .await
        .unwrap();
    assert_eq!(reclaimed, 1);

    assert_eq!(
        store.get(old).await.unwrap().unwrap().status,
        RequestStatus::Pending
    );
    assert_eq!(
        store.get(fresh).await.unwrap().unwrap().status,
        RequestStatus::Processing
    );
}

#[tokio::test]
async fn test_renew_lease_keeps_row_out_of_sweep() {
    let store = SqliteRequestStore::new_in_memory().unwrap();
    let id = store.insert(sample(1)).await.unwrap();
    let lease = store.claim_batch(1).await.unwrap().remove(0).lease;

    {
        let conn = store.conn.lock().unwrap();
        conn.execute(
            "UPDATE repair_requests SET claimed_at = claimed_at - 3600000 WHERE id = ?1",
            params![id.0],
        )
        .unwrap();
    }

    assert!(store.renew_lease(id, &lease).await.unwrap());
    assert_eq!(
        store
            .reclaim_stale(Duration::from_secs(600))
            .await
            .unwrap(),
        0
    );

    store
        .set_status(id, &lease, TerminalStatus::Failed)
        .await
        .unwrap();
    assert!(!store.renew_lease(id, &lease).await.unwrap());
}

#[tokio::test]
async fn test_release_returns_row_without_spending_a_claim() {
    let store = SqliteRequestStore::new_in_memory()
        .unwrap()
        .with_max_claims(1);
    let id = store.insert(sample(1)).await.unwrap();
    let lease = store.claim_batch(1).await.unwrap().remove(0).lease;

    assert!(store.release(id, &lease).await.unwrap());
    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, RequestStatus::Pending);
    assert_eq!(row.claim_count, 0);

    assert_eq!(store.claim_batch(1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_schema_version_recorded_and_reopen_keeps_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("specfix-state.db");

    let id = {
        let store = SqliteRequestStore::new(&path).unwrap();
        let version: i64 = store
            .conn
            .lock()
            .unwrap()
            .query_row("SELECT version FROM schema_version WHERE id = 1", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
        store.insert(sample(3)).await.unwrap()
    };

    let reopened = SqliteRequestStore::new(&path).unwrap();
    let row = reopened.get(id).await.unwrap().unwrap();
    assert_eq!(row.pr_number, 3);
    assert_eq!(row.status, RequestStatus::Pending);
}

#[test]
fn test_newer_schema_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("specfix-state.db");
    {
        let store = SqliteRequestStore::new(&path).unwrap();
        store
            .conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE schema_version SET version = ?1 WHERE id = 1",
                params![CURRENT_SCHEMA_VERSION + 1],
            )
            .unwrap();
    }

    assert!(matches!(
        SqliteRequestStore::new(&path),
        Err(StoreError::Storage { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claimers_on_one_file_never_share_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("specfix-state.db");

    let seed = SqliteRequestStore::new(&path).unwrap();
    for pr in 0..40 {
        seed.insert(sample(pr)).await.unwrap();
    }

    // Separate connections, as separate dispatcher processes would have.
    let mut handles = Vec::new();
    for _ in 0..4 {
        let store = Arc::new(SqliteRequestStore::new(&path).unwrap());
        handles.push(tokio::spawn(async move {
            let mut mine = Vec::new();
            loop {
                let batch = store.claim_batch(3).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                mine.extend(batch.into_iter().map(|c| c.request.id));
            }
            mine
        }));
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    for handle in handles {
        for id in handle.await.unwrap() {
            total += 1;
            assert!(seen.insert(id), "request {} claimed twice", id);
        }
    }
    assert_eq!(total, 40);
}

#[derive(Debug, Clone)]
enum Op {
    Insert,
    Claim(usize),
    Complete(usize),
    Fail(usize),
    Release(usize),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Insert),
        (0usize..5).prop_map(Op::Claim),
        (0usize..20).prop_map(Op::Complete),
        (0usize..20).prop_map(Op::Fail),
        (0usize..20).prop_map(Op::Release),
    ]
}

proptest! {
    /// Property: across any interleaving of operations, a row is never held
    /// by two claims at once, only the current holder can write, and a
    /// completed row never changes again.
    #[test]
    fn claims_are_exclusive_and_completed_is_final(ops in proptest::collection::vec(arb_op(), 1..60)) {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let store = SqliteRequestStore::new_in_memory().unwrap();
            let mut ids: Vec<RequestId> = Vec::new();
            let mut held: HashMap<RequestId, LeaseToken> = HashMap::new();
            let mut completed: HashSet<RequestId> = HashSet::new();

            for op in &ops {
                match op {
                    Op::Insert => ids.push(store.insert(sample(ids.len() as u64)).await.unwrap()),
                    Op::Claim(limit) => {
                        let batch = store.claim_batch(*limit).await.unwrap();
                        assert!(batch.len() <= *limit);
                        for claimed in batch {
                            let id = claimed.request.id;
                            assert!(held.insert(id, claimed.lease).is_none(), "row {} claimed while held", id);
                            assert!(!completed.contains(&id));
                        }
                    }
                    Op::Complete(i) | Op::Fail(i) | Op::Release(i) => {
                        let Some(id) = ids.get(*i).copied() else { continue };
                        // Rows not held are written with a lease nobody owns.
                        let holder = held.remove(&id);
                        let lease = holder.clone().unwrap_or_else(LeaseToken::generate);
                        let applied = match op {
                            Op::Complete(_) => store.set_status(id, &lease, TerminalStatus::Completed).await.unwrap(),
                            Op::Fail(_) => store.set_status(id, &lease, TerminalStatus::Failed).await.unwrap(),
                            _ => store.release(id, &lease).await.unwrap(),
                        };
                        assert_eq!(applied, holder.is_some());
                        if applied && matches!(op, Op::Complete(_)) {
                            completed.insert(id);
                        }
                    }
                }

                for id in &completed {
                    let row = store.get(*id).await.unwrap().unwrap();
                    assert_eq!(row.status, RequestStatus::Completed);
                }
            }
        });
    }
}
