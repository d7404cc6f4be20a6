use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tidal_apply::RetryConfig;
use tidal_core::config::ProjectConfig;
use tidal_core::registry::KindRegistry;
use tidal_core::{ObjectStore, Request, Resource, ResourceKind, StoreError};
use tidal_runtime::{ClusterSet, Inputs, Phase, ReconcileAction, Runner, RuntimeError, SyncContext, SyncOutput, Worker};
use tidal_store::{MemStore, WriteOp};

const PROJECT: &str = r#"
kind: tidal.dev/v1/Canary
phases:
  - name: Initializing
    initial: true
    outputs: [v1/ConfigMap]
  - name: Progressing
    inputs:
      - name: gate
        kind: v1/Secret
        cardinality: one
  - name: Promoted
    terminal: true
kinds:
  - kind: v1/ConfigMap
  - kind: v1/Secret
operator:
  work_interval_secs: 7
"#;

#[derive(Debug, Clone, PartialEq)]
enum Step {
    Initializing,
    Progressing,
    Promoted,
}

impl Phase for Step {
    fn name(&self) -> &str {
        match self {
            Step::Initializing => "Initializing",
            Step::Progressing => "Progressing",
            Step::Promoted => "Promoted",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "Initializing" => Some(Step::Initializing),
            "Progressing" => Some(Step::Progressing),
            "Promoted" => Some(Step::Promoted),
            _ => None,
        }
    }
}

#[derive(Default)]
struct Rollout {
    syncs: AtomicU32,
    finalized: AtomicU32,
    fail_finalize: bool,
    stray_output: bool,
}

#[async_trait::async_trait]
impl Worker for Rollout {
    type Phase = Step;

    async fn sync(
        &self,
        phase: &Step,
        ctx: &SyncContext,
        resource: &Resource,
        inputs: &Inputs,
    ) -> anyhow::Result<SyncOutput<Step>> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        match phase {
            Step::Initializing => {
                // Namespace left unset: the runner places it next to the owner.
                let cfg = Resource::new("v1/ConfigMap".parse()?, None, &format!("{}-cfg", resource.name()));
                assert!(ctx.registry.get(&cfg.kind).is_some());
                let mut out = SyncOutput::new(Step::Progressing)
                    .with_output(cfg.with_labels([("app", resource.name())]))
                    .with_status("message", json!("config written"));
                if self.stray_output {
                    out = out.with_output(Resource::new("v1/Service".parse()?, None, resource.name()));
                }
                Ok(out)
            }
            Step::Progressing => match inputs.one("gate") {
                Some(_) => Ok(SyncOutput::new(Step::Promoted).with_status("message", serde_json::Value::Null)),
                None => Ok(SyncOutput::new(Step::Progressing)),
            },
            Step::Promoted => Ok(SyncOutput::new(Step::Promoted)),
        }
    }

    async fn finalize(&self, _ctx: &SyncContext, _resource: &Resource) -> anyhow::Result<()> {
        self.finalized.fetch_add(1, Ordering::SeqCst);
        if self.fail_finalize {
            anyhow::bail!("cleanup endpoint unavailable");
        }
        Ok(())
    }
}

fn canary_kind() -> ResourceKind {
    "tidal.dev/v1/Canary".parse().unwrap()
}

fn setup(worker: Rollout) -> (MemStore, Runner<Rollout>) {
    let cfg = ProjectConfig::from_yaml_str(PROJECT).unwrap();
    let store = MemStore::new();
    let mut clusters = ClusterSet::new();
    clusters.insert(None, Arc::new(store.clone()));
    let registry = Arc::new(KindRegistry::from_config(&cfg));
    let runner = Runner::new(worker, &cfg, Arc::new(clusters), registry)
        .unwrap()
        .with_conflict_retry(RetryConfig::immediate(3));
    (store, runner)
}

async fn seed(store: &MemStore, name: &str) -> Request {
    let obj = Resource::new(canary_kind(), Some("prod"), name).with_spec(json!({ "image": "web:2" }));
    let created = store.create(&obj).await.unwrap();
    Request::new(None, created.key())
}

#[tokio::test]
async fn first_pass_adds_finalizer_and_records_initial_phase() {
    let (store, runner) = setup(Rollout::default());
    let req = seed(&store, "web").await;

    let action = runner.reconcile(&req).await.unwrap();
    assert_eq!(action, ReconcileAction::RequeueAfter(Duration::ZERO));
    let obj = store.get(&req.key).await.unwrap();
    assert!(obj.has_finalizer("tidal.dev/finalizer"));
    assert_eq!(obj.phase(), Some("Initializing"));
    assert_eq!(obj.status().unwrap()["observedGeneration"], json!(1));
    assert_eq!(runner.machine().initial(), &Step::Initializing);
}

#[tokio::test]
async fn second_pass_writes_owned_outputs_and_advances() {
    let worker = Rollout::default();
    let (store, runner) = setup(worker);
    let req = seed(&store, "web").await;
    runner.reconcile(&req).await.unwrap();

    let action = runner.reconcile(&req).await.unwrap();
    assert_eq!(action, ReconcileAction::RequeueAfter(Duration::from_secs(7)));
    let obj = store.get(&req.key).await.unwrap();
    assert_eq!(obj.phase(), Some("Progressing"));
    assert_eq!(obj.status().unwrap()["message"], json!("config written"));

    let cfg_key = tidal_core::ObjectKey::new("v1/ConfigMap".parse().unwrap(), Some("prod"), "web-cfg");
    let child = store.get(&cfg_key).await.unwrap();
    assert_eq!(child.owner_keys(&canary_kind()).into_vec(), vec![req.key.clone()]);
    assert_eq!(child.label("app"), Some("web"));
}

#[tokio::test]
async fn waits_on_input_then_reaches_terminal_phase() {
    let (store, runner) = setup(Rollout::default());
    let req = seed(&store, "web").await;
    runner.reconcile(&req).await.unwrap();
    runner.reconcile(&req).await.unwrap();

    let writes = store.writes();
    assert_eq!(runner.reconcile(&req).await.unwrap(), ReconcileAction::RequeueAfter(Duration::from_secs(7)));
    assert_eq!(store.writes(), writes, "steady state pass writes nothing");

    store.create(&Resource::new("v1/Secret".parse().unwrap(), Some("prod"), "gate")).await.unwrap();
    assert_eq!(runner.reconcile(&req).await.unwrap(), ReconcileAction::AwaitChange);
    let obj = store.get(&req.key).await.unwrap();
    assert_eq!(obj.phase(), Some("Promoted"));
    assert!(obj.status().unwrap().get("message").is_none(), "null status info clears the key");

    assert_eq!(runner.reconcile(&req).await.unwrap(), ReconcileAction::AwaitChange);
}

#[tokio::test]
async fn ambiguous_single_input_is_a_worker_error() {
    let (store, runner) = setup(Rollout::default());
    let req = seed(&store, "web").await;
    runner.reconcile(&req).await.unwrap();
    runner.reconcile(&req).await.unwrap();
    for name in ["a", "b"] {
        store.create(&Resource::new("v1/Secret".parse().unwrap(), Some("prod"), name)).await.unwrap();
    }
    let err = runner.reconcile(&req).await.unwrap_err();
    assert!(matches!(err, RuntimeError::Worker { ref message, .. } if message.contains("found 2")), "{}", err);
}

#[tokio::test]
async fn undeclared_output_kind_is_rejected() {
    let (store, runner) = setup(Rollout { stray_output: true, ..Default::default() });
    let req = seed(&store, "web").await;
    runner.reconcile(&req).await.unwrap();
    let err = runner.reconcile(&req).await.unwrap_err();
    assert!(matches!(err, RuntimeError::Worker { ref phase, .. } if phase == "Initializing"));
    assert_eq!(store.len(), 1, "declared sibling not written when another output is rejected");
}

#[tokio::test]
async fn deletion_finalizes_then_releases() {
    let (store, runner) = setup(Rollout::default());
    let req = seed(&store, "web").await;
    runner.reconcile(&req).await.unwrap();
    store.delete(&req.key).await.unwrap();
    assert!(store.get(&req.key).await.unwrap().is_deleting());

    assert_eq!(runner.reconcile(&req).await.unwrap(), ReconcileAction::AwaitChange);
    assert!(matches!(store.get(&req.key).await, Err(StoreError::NotFound(_))));
    assert_eq!(runner.worker().finalized.load(Ordering::SeqCst), 1);
    assert_eq!(runner.reconcile(&req).await.unwrap(), ReconcileAction::AwaitChange, "gone objects are a no-op");
}

#[tokio::test]
async fn failed_finalize_keeps_the_finalizer() {
    let (store, runner) = setup(Rollout { fail_finalize: true, ..Default::default() });
    let req = seed(&store, "web").await;
    runner.reconcile(&req).await.unwrap();
    store.delete(&req.key).await.unwrap();

    let err = runner.reconcile(&req).await.unwrap_err();
    assert!(matches!(err, RuntimeError::Worker { ref phase, .. } if phase == "finalize"));
    let obj = store.get(&req.key).await.unwrap();
    assert!(obj.has_finalizer("tidal.dev/finalizer"));
    assert_eq!(runner.worker().syncs.load(Ordering::SeqCst), 0, "no sync once deleting");
}

#[tokio::test]
async fn stale_status_write_surfaces_as_retryable() {
    let (store, runner) = setup(Rollout::default());
    let req = seed(&store, "web").await;
    runner.reconcile(&req).await.unwrap();
    store.fail_next(WriteOp::UpdateStatus, StoreError::Conflict("stale".into()));
    let err = runner.reconcile(&req).await.unwrap_err();
    assert!(err.is_retryable() && !err.is_internal());
    runner.reconcile(&req).await.unwrap();
    assert_eq!(store.get(&req.key).await.unwrap().phase(), Some("Progressing"));
}

#[tokio::test]
async fn request_for_another_kind_is_internal() {
    let (_store, runner) = setup(Rollout::default());
    let key = tidal_core::ObjectKey::new("v1/Secret".parse().unwrap(), Some("prod"), "x");
    let err = runner.reconcile(&Request::new(None, key)).await.unwrap_err();
    assert!(err.is_internal());
    let err = runner
        .reconcile(&Request::new(Some("elsewhere"), tidal_core::ObjectKey::new(canary_kind(), Some("prod"), "web")))
        .await
        .unwrap_err();
    assert!(err.is_internal());
}
