#![forbid(unsafe_code)]

use std::sync::Arc;

use serde_json::json;
use tidal_apply::{merge_labels, EnsureError, EnsureOutcome, Ensurer, ReconcileFn, RetryConfig};
use tidal_core::{Client, ObjectStore, Resource, ResourceKind, StoreError};
use tidal_store::{MemStore, WriteOp};

fn cm_kind() -> ResourceKind {
    "v1/ConfigMap".parse().unwrap()
}

fn child(v: i64) -> Resource {
    Resource::new(cm_kind(), Some("ns"), "child").with_spec(json!({ "v": v }))
}

fn ensurer(store: &MemStore, attempts: u32) -> Ensurer {
    Ensurer::new(Client::new(Arc::new(store.clone()))).with_retry(RetryConfig::immediate(attempts))
}

async fn parent(store: &MemStore) -> Resource {
    let p = Resource::new("tidal.dev/v1/Canary".parse().unwrap(), Some("ns"), "owner").with_spec(json!({}));
    store.create(&p).await.unwrap()
}

#[tokio::test]
async fn creates_missing_child_with_owner_reference() {
    let store = MemStore::new();
    let owner = parent(&store).await;
    let out = ensurer(&store, 3).ensure(Some(&owner), child(1), &[]).await.unwrap();
    assert!(matches!(out, EnsureOutcome::Created(_)));
    let live = store.get(&child(1).key()).await.unwrap();
    let owners = live.owner_keys(&owner.kind);
    assert_eq!(owners.as_slice(), &[owner.key()]);
    assert_eq!(live.owner_references()[0].uid, owner.uid().unwrap());
}

#[tokio::test]
async fn second_ensure_without_change_writes_nothing() {
    let store = MemStore::new();
    let owner = parent(&store).await;
    let e = ensurer(&store, 3);
    e.ensure(Some(&owner), child(1), &[]).await.unwrap();
    let writes = store.writes();
    let out = e.ensure(Some(&owner), child(1), &[&merge_labels]).await.unwrap();
    assert!(matches!(out, EnsureOutcome::Unchanged(_)));
    assert!(!out.wrote());
    assert_eq!(store.writes(), writes);
}

#[tokio::test]
async fn changed_child_is_updated_under_live_version() {
    let store = MemStore::new();
    let e = ensurer(&store, 3);
    let first = e.ensure(None, child(1), &[]).await.unwrap().into_resource();
    let out = e.ensure(None, child(2), &[]).await.unwrap();
    let updated = out.resource();
    assert!(matches!(out, EnsureOutcome::Updated(_)));
    assert_eq!(updated.spec(), Some(&json!({ "v": 2 })));
    assert_ne!(updated.resource_version(), first.resource_version());
}

#[tokio::test]
async fn reconcile_fn_returning_none_skips_write() {
    let store = MemStore::new();
    let e = ensurer(&store, 3);
    e.ensure(None, child(1), &[]).await.unwrap();
    let keep = |_: &Resource, _: Resource| -> anyhow::Result<Option<Resource>> { Ok(None) };
    let out = e.ensure(None, child(5), &[&keep]).await.unwrap();
    assert!(matches!(out, EnsureOutcome::Unchanged(_)));
    assert_eq!(store.get(&child(1).key()).await.unwrap().spec(), Some(&json!({ "v": 1 })));
}

#[tokio::test]
async fn reconcile_fn_error_is_reported() {
    let store = MemStore::new();
    let e = ensurer(&store, 3);
    e.ensure(None, child(1), &[]).await.unwrap();
    let fail = |_: &Resource, _: Resource| -> anyhow::Result<Option<Resource>> { Err(anyhow::anyhow!("bad merge")) };
    let err = e.ensure(None, child(2), &[&fail]).await.unwrap_err();
    assert!(matches!(err, EnsureError::Reconcile { .. }));
    assert!(err.to_string().contains("bad merge"));
}

#[tokio::test]
async fn conflicts_are_retried_against_fresh_version() {
    let store = MemStore::new();
    let e = ensurer(&store, 5);
    e.ensure(None, child(1), &[]).await.unwrap();
    store.fail_next(WriteOp::Update, StoreError::Conflict("stale".into()));
    store.fail_next(WriteOp::Update, StoreError::Conflict("stale".into()));
    let out = e.ensure(None, child(3), &[]).await.unwrap();
    assert!(matches!(out, EnsureOutcome::Updated(_)));
    assert_eq!(store.get(&child(1).key()).await.unwrap().spec(), Some(&json!({ "v": 3 })));
}

#[tokio::test]
async fn conflict_budget_exhaustion_propagates() {
    let store = MemStore::new();
    let e = ensurer(&store, 2);
    e.ensure(None, child(1), &[]).await.unwrap();
    for _ in 0..3 {
        store.fail_next(WriteOp::Update, StoreError::Conflict("stale".into()));
    }
    let err = e.ensure(None, child(2), &[]).await.unwrap_err();
    match err {
        EnsureError::ConflictBudgetExhausted { attempts, .. } => assert_eq!(attempts, 2),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn permanent_errors_are_not_retried() {
    let store = MemStore::new();
    let e = ensurer(&store, 5);
    e.ensure(None, child(1), &[]).await.unwrap();
    store.fail_next(WriteOp::Update, StoreError::Forbidden("rbac".into()));
    store.fail_next(WriteOp::Update, StoreError::Conflict("would succeed on retry".into()));
    let err = e.ensure(None, child(2), &[]).await.unwrap_err();
    assert!(matches!(err, EnsureError::Store(StoreError::Forbidden(_))));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn lost_create_race_is_retried() {
    let store = MemStore::new();
    store.fail_next(WriteOp::Create, StoreError::AlreadyExists("raced".into()));
    let out = ensurer(&store, 3).ensure(None, child(1), &[]).await.unwrap();
    assert!(matches!(out, EnsureOutcome::Created(_)));
    assert_eq!(store.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_ensures_converge_without_lost_updates() {
    let store = MemStore::new();
    let base = ensurer(&store, 3);
    base.ensure(None, child(0), &[]).await.unwrap();

    // Each writer appends its label; a lost update would drop someone's label.
    let mut tasks = Vec::new();
    for i in 0..8 {
        let e = ensurer(&store, 50);
        tasks.push(tokio::spawn(async move {
            let label = format!("w{}", i);
            let add = move |live: &Resource, mut desired: Resource| -> anyhow::Result<Option<Resource>> {
                desired.metadata.labels = live.metadata.labels.clone();
                desired = desired.with_labels([(label.clone(), "1".to_string())]);
                Ok(Some(desired))
            };
            let f: &ReconcileFn = &add;
            e.ensure(None, child(0), &[f]).await
        }));
    }
    for t in tasks {
        t.await.unwrap().unwrap();
    }
    let live = store.get(&child(0).key()).await.unwrap();
    let labels = live.labels().unwrap();
    for i in 0..8 {
        assert_eq!(labels.get(&format!("w{}", i)).map(|s| s.as_str()), Some("1"));
    }
}
