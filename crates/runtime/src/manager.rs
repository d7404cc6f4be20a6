//! Wires the project descriptor into one controller per cluster, all sharing
//! a single runner and request tracker.

use std::sync::Arc;

use tidal_apply::RetryConfig;
use tidal_core::config::{InputScope, ProjectConfig};
use tidal_core::registry::{Edge, EdgeTable, KindRegistry};
use tidal_core::{ObjectStore, ResourceKind};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cluster::ClusterSet;
use crate::controller::{Controller, ControllerOptions};
use crate::predicate::{EventTypePredicate, LabelPredicate, Predicate};
use crate::runner::{Runner, Worker};
use crate::tracker::RequestTracker;
use crate::RuntimeError;

pub struct Manager {
    config: ProjectConfig,
    registry: Arc<KindRegistry>,
    clusters: ClusterSet,
    tracker: Arc<RequestTracker>,
    options: ControllerOptions,
    conflict_retry: Option<RetryConfig>,
}

impl Manager {
    pub fn new(config: ProjectConfig, registry: KindRegistry) -> Self {
        let options = ControllerOptions::from_config(&config.operator);
        Self {
            config,
            registry: Arc::new(registry),
            clusters: ClusterSet::new(),
            tracker: Arc::new(RequestTracker::new()),
            options,
            conflict_retry: None,
        }
    }

    /// Registry built from the descriptor's kind table.
    pub fn from_config(config: ProjectConfig) -> Self {
        let registry = KindRegistry::from_config(&config);
        Self::new(config, registry)
    }

    pub fn add_cluster(&mut self, name: Option<&str>, store: Arc<dyn ObjectStore>) -> &mut Self {
        self.clusters.insert(name, store);
        self
    }

    pub fn with_options(mut self, options: ControllerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_conflict_retry(mut self, retry: RetryConfig) -> Self {
        self.conflict_retry = Some(retry);
        self
    }

    pub fn tracker(&self) -> Arc<RequestTracker> {
        self.tracker.clone()
    }

    /// Run every cluster's controller until `cancel` fires or one of them fails.
    pub async fn run<W: Worker>(self, worker: W, cancel: CancellationToken) -> Result<(), RuntimeError> {
        if self.clusters.is_empty() {
            return Err(RuntimeError::Config("no clusters registered".into()));
        }
        let clusters = Arc::new(self.clusters);
        let mut runner = Runner::new(worker, &self.config, clusters.clone(), self.registry.clone())?;
        if let Some(retry) = self.conflict_retry {
            runner = runner.with_conflict_retry(retry);
        }
        let runner = Arc::new(runner);
        let edges = EdgeTable::from_config(&self.config);
        let primary = self.config.kind.clone();

        let stop = cancel.child_token();
        let mut controllers = JoinSet::new();
        for client in clusters.clients() {
            let cluster = client.cluster();
            let mut builder = Controller::builder(primary.clone(), client.clone(), self.tracker.clone())
                .namespace(self.config.operator.namespace.as_deref())
                .options(self.options.clone());
            for p in kind_predicates(&self.config, &primary) {
                builder = builder.with_predicate(p);
            }
            for kind in edges.children(&primary, Edge::Output) {
                builder = builder.owns(kind.clone(), kind_predicates(&self.config, kind));
            }
            for kind in edges.children(&primary, Edge::Input) {
                if let Some(scope) = input_scope_on(&self.config, kind, cluster) {
                    builder = builder.watches_input(kind.clone(), scope, kind_predicates(&self.config, kind));
                }
            }
            let controller = builder.build()?;
            controllers.spawn(controller.run(runner.clone(), stop.clone()));
        }
        info!(primary = %primary, clusters = clusters.len(), "manager: controllers started");

        let mut first_err = None;
        while let Some(joined) = controllers.join_next().await {
            let res = joined.unwrap_or_else(|e| Err(RuntimeError::internal("manager", format!("controller task: {}", e))));
            if let Err(e) = res {
                error!(error = %e, "manager: controller failed, stopping the rest");
                stop.cancel();
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Watch-side filters declared for a kind in the kind table.
fn kind_predicates(cfg: &ProjectConfig, kind: &ResourceKind) -> Vec<Arc<dyn Predicate>> {
    let mut out: Vec<Arc<dyn Predicate>> = Vec::new();
    if let Some(kc) = cfg.kind_config(kind) {
        if let Some(events) = &kc.events {
            out.push(Arc::new(EventTypePredicate::new(events.clone())));
        }
        if !kc.labels.is_empty() {
            out.push(Arc::new(LabelPredicate::new(kc.labels.clone())));
        }
    }
    out
}

/// Whether `cluster` should watch input `kind`, and with which fan-out scope.
/// Inputs pinned to another cluster are watched there only. The fan-out is
/// namespace-restricted only if every declaration is.
fn input_scope_on(cfg: &ProjectConfig, kind: &ResourceKind, cluster: Option<&str>) -> Option<InputScope> {
    let decls: Vec<_> = cfg
        .phases
        .iter()
        .flat_map(|p| p.inputs.iter())
        .filter(|d| d.kind == *kind)
        .filter(|d| d.cluster.is_none() || d.cluster.as_deref() == cluster)
        .collect();
    if decls.is_empty() {
        return None;
    }
    if decls.iter().all(|d| d.scope == InputScope::SameNamespace) {
        Some(InputScope::SameNamespace)
    } else {
        Some(InputScope::AllNamespaces)
    }
}
