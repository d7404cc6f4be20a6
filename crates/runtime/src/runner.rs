//! One reconcile pass for one primary object.
//!
//! The pass reads the object, manages the engine finalizer, resolves the
//! current phase, gathers the phase's declared inputs, runs the worker,
//! ensures the outputs it returns and persists phase and status.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use serde_json::{Map, Value as Json};
use tidal_apply::{merge_annotations, merge_labels, preserve_finalizers, Ensurer, ReconcileFn, RetryConfig};
use tidal_core::config::{Cardinality, InputScope, PhaseConfig, ProjectConfig, ProviderConfig};
use tidal_core::registry::KindRegistry;
use tidal_core::{Client, ListParams, Request, Resource, ResourceKind};
use tracing::{debug, info, warn};

use crate::cluster::ClusterSet;
use crate::RuntimeError;

/// A position in the phase table. Workers usually use an enum; `String`
/// works for tables only known at runtime.
pub trait Phase: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {
    fn name(&self) -> &str;
    fn parse(name: &str) -> Option<Self>;
}

impl Phase for String {
    fn name(&self) -> &str {
        self
    }

    fn parse(name: &str) -> Option<Self> {
        Some(name.to_string())
    }
}

/// Named input bundles gathered for one pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inputs {
    bundles: BTreeMap<String, Vec<Resource>>,
}

impl Inputs {
    pub fn insert(&mut self, name: impl Into<String>, objects: Vec<Resource>) {
        self.bundles.insert(name.into(), objects);
    }

    /// Empty when the bundle is unknown or matched nothing.
    pub fn get(&self, name: &str) -> &[Resource] {
        self.bundles.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn one(&self, name: &str) -> Option<&Resource> {
        self.get(name).first()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.bundles.keys().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncOutput<P> {
    /// Desired children, each of a kind the phase declares.
    pub outputs: Vec<Resource>,
    pub next_phase: P,
    /// Merged into `status`; null values remove keys.
    pub status_info: Map<String, Json>,
}

impl<P> SyncOutput<P> {
    pub fn new(next_phase: P) -> Self {
        Self { outputs: Vec::new(), next_phase, status_info: Map::new() }
    }

    pub fn with_output(mut self, obj: Resource) -> Self {
        self.outputs.push(obj);
        self
    }

    pub fn with_status(mut self, key: &str, value: Json) -> Self {
        self.status_info.insert(key.to_string(), value);
        self
    }
}

/// What a worker sees besides the object itself.
#[derive(Clone)]
pub struct SyncContext {
    pub request: Request,
    /// Client for the primary's cluster.
    pub client: Client,
    pub clusters: Arc<ClusterSet>,
    pub registry: Arc<KindRegistry>,
    pub provider: ProviderConfig,
}

#[async_trait::async_trait]
pub trait Worker: Send + Sync + 'static {
    type Phase: Phase;

    async fn sync(
        &self,
        phase: &Self::Phase,
        ctx: &SyncContext,
        resource: &Resource,
        inputs: &Inputs,
    ) -> anyhow::Result<SyncOutput<Self::Phase>>;

    /// Runs once per deletion, before the engine finalizer is released.
    /// May run again if releasing the finalizer fails.
    async fn finalize(&self, _ctx: &SyncContext, _resource: &Resource) -> anyhow::Result<()> {
        Ok(())
    }
}

/// The phase table bound to a worker's phase type.
#[derive(Debug, Clone)]
pub struct PhaseMachine<P> {
    phases: Vec<(P, PhaseConfig)>,
    initial: usize,
}

impl<P: Phase> PhaseMachine<P> {
    pub fn from_config(cfg: &ProjectConfig) -> Result<Self, RuntimeError> {
        let mut phases = Vec::with_capacity(cfg.phases.len());
        for pc in &cfg.phases {
            let p = P::parse(&pc.name)
                .ok_or_else(|| RuntimeError::Config(format!("phase {} is not known to the worker", pc.name)))?;
            if p.name() != pc.name {
                return Err(RuntimeError::Config(format!("phase {} parses as {}", pc.name, p.name())));
            }
            phases.push((p, pc.clone()));
        }
        let initial = phases
            .iter()
            .position(|(_, pc)| pc.initial)
            .ok_or_else(|| RuntimeError::Config("no initial phase".into()))?;
        Ok(Self { phases, initial })
    }

    pub fn initial(&self) -> &P {
        &self.phases[self.initial].0
    }

    pub fn config(&self, phase: &P) -> Option<&PhaseConfig> {
        self.phases.iter().find(|(p, _)| p == phase).map(|(_, pc)| pc)
    }

    pub fn is_terminal(&self, phase: &P) -> bool {
        self.config(phase).map_or(false, |pc| pc.terminal)
    }

    /// Phase named in status; unset means the initial phase.
    pub fn resolve(&self, name: Option<&str>) -> Result<P, RuntimeError> {
        let Some(name) = name else { return Ok(self.initial().clone()) };
        self.phases
            .iter()
            .find(|(p, _)| p.name() == name)
            .map(|(p, _)| p.clone())
            .ok_or_else(|| RuntimeError::internal("phase", format!("status names unknown phase {}", name)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    RequeueAfter(Duration),
    /// Nothing scheduled; only a watch event brings the object back.
    AwaitChange,
}

pub struct Runner<W: Worker> {
    worker: W,
    machine: PhaseMachine<W::Phase>,
    primary: ResourceKind,
    finalizer: String,
    work_interval: Duration,
    conflict_retry: RetryConfig,
    provider: ProviderConfig,
    clusters: Arc<ClusterSet>,
    registry: Arc<KindRegistry>,
}

impl<W: Worker> Runner<W> {
    pub fn new(
        worker: W,
        cfg: &ProjectConfig,
        clusters: Arc<ClusterSet>,
        registry: Arc<KindRegistry>,
    ) -> Result<Self, RuntimeError> {
        Ok(Self {
            worker,
            machine: PhaseMachine::from_config(cfg)?,
            primary: cfg.kind.clone(),
            finalizer: cfg.finalizer_name(),
            work_interval: cfg.work_interval(),
            conflict_retry: RetryConfig::with_max_attempts(cfg.operator.conflict_retries),
            provider: cfg.operator.provider.clone(),
            clusters,
            registry,
        })
    }

    pub fn with_conflict_retry(mut self, retry: RetryConfig) -> Self {
        self.conflict_retry = retry;
        self
    }

    pub fn primary(&self) -> &ResourceKind {
        &self.primary
    }

    pub fn worker(&self) -> &W {
        &self.worker
    }

    pub fn machine(&self) -> &PhaseMachine<W::Phase> {
        &self.machine
    }

    pub async fn reconcile(&self, req: &Request) -> Result<ReconcileAction, RuntimeError> {
        let started = Instant::now();
        let res = self.reconcile_inner(req).await;
        let took_ms = started.elapsed().as_millis() as u64;
        counter!("reconcile_total", 1u64);
        histogram!("reconcile_latency_ms", took_ms as f64);
        match &res {
            Ok(action) => debug!(request = %req, ?action, took_ms, "reconcile: done"),
            Err(e) => {
                counter!("reconcile_errors_total", 1u64);
                warn!(request = %req, error = %e, took_ms, "reconcile: failed");
            }
        }
        res
    }

    async fn reconcile_inner(&self, req: &Request) -> Result<ReconcileAction, RuntimeError> {
        if req.key.kind != self.primary {
            return Err(RuntimeError::internal(
                "runner",
                format!("request for {} reached the {} runner", req.key.kind, self.primary),
            ));
        }
        let client = self.clusters.client(req.cluster.as_deref())?.clone();
        let Some(mut obj) = client.get_opt(&req.key).await? else {
            debug!(request = %req, "reconcile: object gone");
            return Ok(ReconcileAction::AwaitChange);
        };
        let ctx = SyncContext {
            request: req.clone(),
            client: client.clone(),
            clusters: self.clusters.clone(),
            registry: self.registry.clone(),
            provider: self.provider.clone(),
        };

        if obj.is_deleting() {
            if obj.has_finalizer(&self.finalizer) {
                self.worker.finalize(&ctx, &obj).await.map_err(|e| RuntimeError::worker("finalize", &e))?;
                obj.remove_finalizer(&self.finalizer);
                client.update(&obj).await?;
                info!(request = %req, finalizer = %self.finalizer, "reconcile: finalized");
            }
            return Ok(ReconcileAction::AwaitChange);
        }

        if obj.add_finalizer(&self.finalizer) {
            obj = client.update(&obj).await?;
            debug!(request = %req, finalizer = %self.finalizer, "reconcile: finalizer added");
        }

        let Some(current) = obj.phase().map(str::to_string) else {
            // Record the initial phase before doing any work.
            let initial = self.machine.initial().clone();
            let mut next = obj.clone();
            next.set_phase(initial.name());
            if let Some(g) = obj.generation() {
                next.set_status_field("observedGeneration", Json::from(g));
            }
            client.update_status(&next).await?;
            info!(request = %req, phase = initial.name(), "reconcile: phase initialized");
            return Ok(ReconcileAction::RequeueAfter(Duration::ZERO));
        };
        let phase = self.machine.resolve(Some(&current))?;
        let phase_cfg = self
            .machine
            .config(&phase)
            .ok_or_else(|| RuntimeError::internal("phase", format!("no table entry for {}", current)))?;

        let inputs = self.gather_inputs(&client, &obj, phase_cfg).await?;
        let out = self
            .worker
            .sync(&phase, &ctx, &obj, &inputs)
            .await
            .map_err(|e| RuntimeError::worker(phase.name(), &e))?;

        // Reject the whole pass before any child is written.
        if let Some(stray) = out.outputs.iter().find(|c| !phase_cfg.outputs.contains(&c.kind)) {
            return Err(RuntimeError::Worker {
                phase: phase.name().to_string(),
                message: format!("output kind {} is not declared for this phase", stray.kind),
            });
        }

        let ensurer = Ensurer::new(client.clone()).with_retry(self.conflict_retry.clone());
        let fns: [&ReconcileFn; 3] = [&preserve_finalizers, &merge_labels, &merge_annotations];
        for mut child in out.outputs {
            if child.namespace().is_none() && self.registry.is_namespaced(&child.kind) {
                child.metadata.namespace = obj.namespace().map(str::to_string);
            }
            ensurer.ensure(Some(&obj), child, &fns).await?;
        }

        let mut next = obj.clone();
        next.set_phase(out.next_phase.name());
        next.merge_status(&out.status_info);
        if let Some(g) = obj.generation() {
            next.set_status_field("observedGeneration", Json::from(g));
        }
        if next.status() != obj.status() {
            client.update_status(&next).await?;
            if out.next_phase != phase {
                info!(request = %req, from = phase.name(), to = out.next_phase.name(), "reconcile: phase transition");
            }
        }

        if self.machine.is_terminal(&out.next_phase) {
            Ok(ReconcileAction::AwaitChange)
        } else {
            Ok(ReconcileAction::RequeueAfter(self.work_interval))
        }
    }

    async fn gather_inputs(&self, client: &Client, owner: &Resource, phase: &PhaseConfig) -> Result<Inputs, RuntimeError> {
        let mut inputs = Inputs::default();
        for decl in &phase.inputs {
            let source = match &decl.cluster {
                Some(name) => self.clusters.client(Some(name))?,
                None => client,
            };
            let ns = match decl.scope {
                InputScope::SameNamespace => owner.namespace(),
                InputScope::AllNamespaces => None,
            };
            let params = ListParams::default().namespace(ns).labels(&decl.labels);
            let found = source.list(&decl.kind, &params).await?;
            if decl.cardinality == Cardinality::One && found.len() > 1 {
                return Err(RuntimeError::Worker {
                    phase: phase.name.clone(),
                    message: format!("input {} expects one {}, found {}", decl.name, decl.kind, found.len()),
                });
            }
            debug!(owner = %owner.key(), input = %decl.name, count = found.len(), "reconcile: input gathered");
            inputs.insert(decl.name.clone(), found);
        }
        Ok(inputs)
    }
}
