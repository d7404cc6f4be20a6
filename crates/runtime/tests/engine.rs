use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tidal_core::config::ProjectConfig;
use tidal_core::{ObjectKey, ObjectStore, Resource, ResourceKind, StoreError};
use tidal_runtime::{ControllerOptions, Inputs, Manager, RateLimit, SyncContext, SyncOutput, Worker};
use tidal_store::MemStore;
use tokio_util::sync::CancellationToken;

fn canary_kind() -> ResourceKind {
    "tidal.dev/v1/Canary".parse().unwrap()
}

fn fast() -> ControllerOptions {
    ControllerOptions {
        concurrency: 2,
        max_retries: 5,
        rate_limit: RateLimit { base: Duration::from_millis(1), max: Duration::from_millis(50) },
        rewatch_delay: Duration::from_millis(10),
    }
}

async fn wait_for<F>(store: &MemStore, key: &ObjectKey, what: &str, mut pred: F) -> Option<Resource>
where
    F: FnMut(Option<&Resource>) -> bool,
{
    for _ in 0..400 {
        let got = match store.get(key).await {
            Ok(obj) => Some(obj),
            Err(StoreError::NotFound(_)) => None,
            Err(e) => panic!("get {}: {}", key, e),
        };
        if pred(got.as_ref()) {
            return got;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {} on {}", what, key);
}

/// Phase names from the table, advanced one step per pass.
struct Sequence {
    order: Vec<&'static str>,
    finalized: AtomicU32,
}

#[async_trait::async_trait]
impl Worker for Sequence {
    type Phase = String;

    async fn sync(&self, phase: &String, _ctx: &SyncContext, obj: &Resource, _: &Inputs) -> anyhow::Result<SyncOutput<String>> {
        let idx = self.order.iter().position(|p| *p == phase.as_str()).unwrap_or(0);
        let next = self.order.get(idx + 1).copied().unwrap_or(self.order[idx]);
        let mut out = SyncOutput::new(next.to_string());
        if next != phase.as_str() {
            out = out.with_status("advancedFrom", json!(phase));
        }
        if phase.as_str() == "Initializing" {
            let cm = Resource::new("v1/ConfigMap".parse()?, None, &format!("{}-cfg", obj.name()))
                .with_spec(json!({ "replicas": 1 }));
            out = out.with_output(cm);
        }
        Ok(out)
    }

    async fn finalize(&self, _ctx: &SyncContext, _obj: &Resource) -> anyhow::Result<()> {
        self.finalized.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

const SEQUENCE: &str = r#"
kind: tidal.dev/v1/Canary
phases:
  - name: Initializing
    initial: true
    outputs: [v1/ConfigMap]
  - name: Progressing
  - name: Ready
    terminal: true
kinds:
  - kind: v1/ConfigMap
operator:
  work_interval_secs: 3600
"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn phases_advance_to_terminal_and_deletion_is_finalized() {
    let cfg = ProjectConfig::from_yaml_str(SEQUENCE).unwrap();
    let store = MemStore::new();
    let key = store.create(&Resource::new(canary_kind(), Some("prod"), "web")).await.unwrap().key();

    let worker = Sequence { order: vec!["Initializing", "Progressing", "Ready"], finalized: AtomicU32::new(0) };
    let mut manager = Manager::from_config(cfg).with_options(fast());
    manager.add_cluster(None, Arc::new(store.clone()));
    let tracker = manager.tracker();
    let cancel = CancellationToken::new();
    let run = tokio::spawn(manager.run(worker, cancel.clone()));

    let done = wait_for(&store, &key, "Ready", |o| o.and_then(|o| o.phase()) == Some("Ready")).await.unwrap();
    assert_eq!(done.status().unwrap()["advancedFrom"], json!("Progressing"));
    assert!(done.has_finalizer("tidal.dev/finalizer"));
    assert!(tracker.is_tracked(None, &key));

    let cm_key = ObjectKey::new("v1/ConfigMap".parse().unwrap(), Some("prod"), "web-cfg");
    let cm = store.get(&cm_key).await.unwrap();
    assert_eq!(cm.owner_keys(&canary_kind()).into_vec(), vec![key.clone()]);

    store.delete(&key).await.unwrap();
    wait_for(&store, &key, "purge", |o| o.is_none()).await;
    for _ in 0..100 {
        if !tracker.is_tracked(None, &key) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!tracker.is_tracked(None, &key));

    cancel.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn output_drift_is_repaired() {
    let cfg = ProjectConfig::from_yaml_str(SEQUENCE).unwrap();
    // Stay in Initializing so every pass re-ensures the ConfigMap.
    let worker = Sequence { order: vec!["Initializing"], finalized: AtomicU32::new(0) };
    let store = MemStore::new();
    let key = store.create(&Resource::new(canary_kind(), Some("prod"), "web")).await.unwrap().key();
    let mut manager = Manager::from_config(cfg).with_options(fast());
    manager.add_cluster(None, Arc::new(store.clone()));
    let cancel = CancellationToken::new();
    let run = tokio::spawn(manager.run(worker, cancel.clone()));

    let cm_key = ObjectKey::new("v1/ConfigMap".parse().unwrap(), Some("prod"), "web-cfg");
    let mut cm = wait_for(&store, &cm_key, "output", |o| o.is_some()).await.unwrap();
    cm.set_field("spec", json!({ "replicas": 9 }));
    store.update(&cm).await.unwrap();

    // The child's update event maps back to its owner, which rewrites it.
    wait_for(&store, &cm_key, "repair", |o| o.and_then(|o| o.spec()) == Some(&json!({ "replicas": 1 }))).await;
    assert_eq!(store.get(&key).await.unwrap().phase(), Some("Initializing"));

    cancel.cancel();
    run.await.unwrap().unwrap();
}

/// Waits until an input named `gate` exists.
struct Gate;

#[async_trait::async_trait]
impl Worker for Gate {
    type Phase = String;

    async fn sync(&self, phase: &String, _ctx: &SyncContext, _obj: &Resource, inputs: &Inputs) -> anyhow::Result<SyncOutput<String>> {
        match (phase.as_str(), inputs.one("gate")) {
            ("Waiting", Some(gate)) => Ok(SyncOutput::new("Open".to_string()).with_status("openedBy", json!(gate.name()))),
            _ => Ok(SyncOutput::new(phase.clone())),
        }
    }
}

const GATED: &str = r#"
kind: tidal.dev/v1/Canary
phases:
  - name: Waiting
    initial: true
    inputs:
      - name: gate
        kind: v1/Secret
        cardinality: one
        scope: all_namespaces
        cluster: hub
  - name: Open
    terminal: true
kinds:
  - kind: v1/Secret
clusters:
  - name: edge
  - name: hub
operator:
  work_interval_secs: 3600
"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn input_on_another_cluster_wakes_the_owner() {
    let cfg = ProjectConfig::from_yaml_str(GATED).unwrap();
    let edge = MemStore::new();
    let hub = MemStore::new();
    let key = edge.create(&Resource::new(canary_kind(), Some("prod"), "web")).await.unwrap().key();

    let mut manager = Manager::from_config(cfg).with_options(fast());
    manager.add_cluster(Some("edge"), Arc::new(edge.clone()));
    manager.add_cluster(Some("hub"), Arc::new(hub.clone()));
    let tracker = manager.tracker();
    let cancel = CancellationToken::new();
    let run = tokio::spawn(manager.run(Gate, cancel.clone()));

    wait_for(&edge, &key, "Waiting", |o| o.and_then(|o| o.phase()) == Some("Waiting")).await;
    assert!(tracker.is_tracked(Some("edge"), &key));
    assert!(tracker.queue_for(Some("hub")).is_some());

    hub.create(&Resource::new("v1/Secret".parse().unwrap(), Some("ops"), "go")).await.unwrap();
    let open = wait_for(&edge, &key, "Open", |o| o.and_then(|o| o.phase()) == Some("Open")).await.unwrap();
    assert_eq!(open.status().unwrap()["openedBy"], json!("go"));

    cancel.cancel();
    run.await.unwrap().unwrap();
}

/// Fails its first `failures` syncs, then finishes.
struct Flaky {
    failures: AtomicU32,
}

#[async_trait::async_trait]
impl Worker for Flaky {
    type Phase = String;

    async fn sync(&self, _phase: &String, _ctx: &SyncContext, _obj: &Resource, _: &Inputs) -> anyhow::Result<SyncOutput<String>> {
        if self.failures.load(Ordering::SeqCst) > 0 {
            self.failures.fetch_sub(1, Ordering::SeqCst);
            anyhow::bail!("dependency not ready");
        }
        Ok(SyncOutput::new("Done".to_string()))
    }
}

const FLAKY: &str = r#"
kind: tidal.dev/v1/Canary
phases:
  - name: Initializing
    initial: true
  - name: Done
    terminal: true
operator:
  work_interval_secs: 3600
"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_errors_outlast_the_retry_budget() {
    let cfg = ProjectConfig::from_yaml_str(FLAKY).unwrap();
    let store = MemStore::new();
    let key = store.create(&Resource::new(canary_kind(), Some("prod"), "web")).await.unwrap().key();

    let options = ControllerOptions {
        max_retries: 2,
        rate_limit: RateLimit { base: Duration::from_millis(1), max: Duration::from_millis(5) },
        ..fast()
    };
    let mut manager = Manager::from_config(cfg).with_options(options);
    manager.add_cluster(None, Arc::new(store.clone()));
    let cancel = CancellationToken::new();
    let run = tokio::spawn(manager.run(Flaky { failures: AtomicU32::new(4) }, cancel.clone()));

    wait_for(&store, &key, "Done", |o| o.and_then(|o| o.phase()) == Some("Done")).await;

    cancel.cancel();
    run.await.unwrap().unwrap();
}
