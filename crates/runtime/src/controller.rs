//! Per-cluster controller: watches, event dispatch and reconcile workers.
//!
//! Watch tasks filter events through predicates and submit them to the
//! event cache. Dispatch workers map events to requests: primaries to
//! themselves, outputs to their owners, inputs through the request tracker
//! to every active primary. Reconcile workers run the [`Runner`].

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tidal_core::config::{InputScope, OperatorConfig};
use tidal_core::{Client, Event, Request, Resource, ResourceKind, StreamHandle};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{Dispatcher, EventCache, EventHandler};
use crate::predicate::{accepts_all, primary_predicates, Predicate};
use crate::queue::{RateLimit, WorkQueue};
use crate::runner::{ReconcileAction, Runner, Worker};
use crate::tracker::RequestTracker;
use crate::RuntimeError;

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerOptions {
    /// Reconcile workers; the same number of dispatch workers run alongside.
    pub concurrency: usize,
    /// Queue retries before a request or event is dropped.
    pub max_retries: u32,
    pub rate_limit: RateLimit,
    /// Pause before re-opening a watch whose stream ended.
    pub rewatch_delay: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self { concurrency: 4, max_retries: 15, rate_limit: RateLimit::default(), rewatch_delay: Duration::from_secs(1) }
    }
}

impl ControllerOptions {
    pub fn from_config(op: &OperatorConfig) -> Self {
        Self { concurrency: op.max_concurrent_reconciles.max(1), max_retries: op.max_retries, ..Default::default() }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Role {
    Output,
    Input { same_namespace: bool },
}

struct WatchDecl {
    kind: ResourceKind,
    role: Role,
    predicates: Vec<Arc<dyn Predicate>>,
}

pub struct ControllerBuilder {
    primary: ResourceKind,
    client: Client,
    tracker: Arc<RequestTracker>,
    namespace: Option<String>,
    options: ControllerOptions,
    predicates: Vec<Arc<dyn Predicate>>,
    watches: Vec<WatchDecl>,
    generic: Vec<mpsc::Receiver<Resource>>,
}

impl ControllerBuilder {
    /// Restrict every watch to one namespace.
    pub fn namespace(mut self, ns: Option<&str>) -> Self {
        self.namespace = ns.map(str::to_string);
        self
    }

    pub fn options(mut self, options: ControllerOptions) -> Self {
        self.options = options;
        self
    }

    /// Filter on the primary watch.
    pub fn with_predicate(mut self, p: Arc<dyn Predicate>) -> Self {
        self.predicates.push(p);
        self
    }

    /// Children whose controller owner reference points at a primary.
    pub fn owns(mut self, kind: ResourceKind, predicates: Vec<Arc<dyn Predicate>>) -> Self {
        self.watches.push(WatchDecl { kind, role: Role::Output, predicates });
        self
    }

    /// A kind read by some phase. Any change wakes every active primary,
    /// restricted to the event's namespace for `SameNamespace` inputs.
    pub fn watches_input(mut self, kind: ResourceKind, scope: InputScope, predicates: Vec<Arc<dyn Predicate>>) -> Self {
        let same_namespace = scope == InputScope::SameNamespace;
        self.watches.push(WatchDecl { kind, role: Role::Input { same_namespace }, predicates });
        self
    }

    /// Objects pushed here are dispatched as `Generic` events.
    pub fn generic_source(mut self, rx: mpsc::Receiver<Resource>) -> Self {
        self.generic.push(rx);
        self
    }

    pub fn build(self) -> Result<Controller, RuntimeError> {
        let mut watches: Vec<WatchDecl> = Vec::with_capacity(self.watches.len());
        for w in self.watches {
            if w.kind == self.primary {
                return Err(RuntimeError::Config(format!("{} is the primary kind and cannot be a dependent", w.kind)));
            }
            match watches.iter_mut().find(|x| x.kind == w.kind) {
                // Ownership is the stronger relation.
                Some(existing) if w.role == Role::Output => {
                    existing.role = Role::Output;
                    existing.predicates = w.predicates;
                }
                Some(existing) => {
                    if let (Role::Input { same_namespace: a }, Role::Input { same_namespace: b }) = (existing.role, w.role) {
                        existing.role = Role::Input { same_namespace: a && b };
                    }
                }
                None => watches.push(w),
            }
        }
        if self.options.concurrency == 0 {
            return Err(RuntimeError::Config("controller concurrency must be > 0".into()));
        }
        Ok(Controller {
            primary: self.primary,
            client: self.client,
            tracker: self.tracker,
            namespace: self.namespace,
            options: self.options,
            predicates: self.predicates,
            watches,
            generic: self.generic,
        })
    }
}

pub struct Controller {
    primary: ResourceKind,
    client: Client,
    tracker: Arc<RequestTracker>,
    namespace: Option<String>,
    options: ControllerOptions,
    predicates: Vec<Arc<dyn Predicate>>,
    watches: Vec<WatchDecl>,
    generic: Vec<mpsc::Receiver<Resource>>,
}

impl Controller {
    pub fn builder(primary: ResourceKind, client: Client, tracker: Arc<RequestTracker>) -> ControllerBuilder {
        ControllerBuilder {
            primary,
            client,
            tracker,
            namespace: None,
            options: ControllerOptions::default(),
            predicates: Vec::new(),
            watches: Vec::new(),
            generic: Vec::new(),
        }
    }

    pub fn primary(&self) -> &ResourceKind {
        &self.primary
    }

    /// Run until `cancel` fires. In-flight reconciles finish; queued work is
    /// abandoned.
    pub async fn run<W: Worker>(self, runner: Arc<Runner<W>>, cancel: CancellationToken) -> Result<(), RuntimeError> {
        if *runner.primary() != self.primary {
            return Err(RuntimeError::Config(format!(
                "runner reconciles {}, controller watches {}",
                runner.primary(),
                self.primary
            )));
        }
        let cluster = self.client.cluster().map(str::to_string);
        let label = cluster.clone().unwrap_or_else(|| "default".to_string());

        let requests = WorkQueue::with_rate_limit(format!("requests/{}", label), self.options.rate_limit);
        if !self.tracker.register_queue(cluster.as_deref(), requests.clone()) {
            return Err(RuntimeError::Config(format!("cluster {} already has a running controller", label)));
        }
        let cache = Arc::new(EventCache::new());
        let tokens = WorkQueue::with_rate_limit(format!("events/{}", label), self.options.rate_limit);
        let dispatcher = Dispatcher::new(cache.clone(), tokens.clone(), self.options.max_retries);

        cache.register(
            self.primary.clone(),
            Arc::new(PrimaryHandler { queue: requests.clone(), cluster: cluster.clone() }),
        );
        for w in &self.watches {
            let handler: Arc<dyn EventHandler> = match w.role {
                Role::Output => Arc::new(OwnerHandler {
                    queue: requests.clone(),
                    cluster: cluster.clone(),
                    owner_kind: self.primary.clone(),
                }),
                Role::Input { same_namespace } => Arc::new(InputHandler {
                    tracker: self.tracker.clone(),
                    owner_kind: self.primary.clone(),
                    same_namespace,
                }),
            };
            cache.register(w.kind.clone(), handler);
        }

        let mut tasks = JoinSet::new();
        let primary_preds = primary_predicates(self.tracker.clone(), cluster.as_deref(), &self.predicates);
        let source = WatchSource {
            client: self.client.clone(),
            namespace: self.namespace.clone(),
            dispatcher: dispatcher.clone(),
            cancel: cancel.clone(),
            rewatch_delay: self.options.rewatch_delay,
        };
        tasks.spawn(source.clone().run(self.primary.clone(), primary_preds));
        for w in self.watches {
            tasks.spawn(source.clone().run(w.kind, w.predicates));
        }
        for rx in self.generic {
            tasks.spawn(generic_loop(rx, dispatcher.clone(), cancel.clone()));
        }
        for _ in 0..self.options.concurrency {
            tasks.spawn(dispatcher.clone().run_worker());
            tasks.spawn(reconcile_worker(requests.clone(), runner.clone(), self.options.max_retries, cancel.clone()));
        }
        info!(
            cluster = %label,
            primary = %self.primary,
            workers = self.options.concurrency,
            namespace = ?self.namespace,
            "controller: started"
        );

        cancel.cancelled().await;
        tokens.shutdown();
        requests.shutdown();
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                if e.is_panic() {
                    error!(cluster = %label, error = %e, "controller: task panicked");
                }
            }
        }
        info!(cluster = %label, "controller: stopped");
        Ok(())
    }
}

#[derive(Clone)]
struct WatchSource {
    client: Client,
    namespace: Option<String>,
    dispatcher: Dispatcher,
    cancel: CancellationToken,
    rewatch_delay: Duration,
}

impl WatchSource {
    async fn run(self, kind: ResourceKind, predicates: Vec<Arc<dyn Predicate>>) {
        loop {
            let opened = tokio::select! {
                _ = self.cancel.cancelled() => return,
                res = self.client.watch(&kind, self.namespace.as_deref()) => res,
            };
            match opened {
                Ok(StreamHandle { mut rx, cancel: stop }) => {
                    debug!(kind = %kind, cluster = ?self.client.cluster(), "controller: watch open");
                    loop {
                        tokio::select! {
                            _ = self.cancel.cancelled() => {
                                stop.cancel();
                                return;
                            }
                            ev = rx.recv() => match ev {
                                Some(ev) => {
                                    if accepts_all(&predicates, &ev) {
                                        self.dispatcher.submit(ev);
                                    }
                                }
                                None => break,
                            }
                        }
                    }
                    warn!(kind = %kind, cluster = ?self.client.cluster(), "controller: watch stream ended, reopening");
                }
                Err(e) => {
                    warn!(kind = %kind, cluster = ?self.client.cluster(), error = %e, "controller: watch failed");
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.rewatch_delay) => {}
            }
        }
    }
}

async fn generic_loop(mut rx: mpsc::Receiver<Resource>, dispatcher: Dispatcher, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            obj = rx.recv() => match obj {
                Some(object) => {
                    dispatcher.submit(Event::Generic { object });
                }
                None => return,
            }
        }
    }
}

async fn reconcile_worker<W: Worker>(
    queue: WorkQueue<Request>,
    runner: Arc<Runner<W>>,
    max_retries: u32,
    cancel: CancellationToken,
) {
    loop {
        let req = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = queue.get() => match next {
                Some(req) => req,
                None => return,
            },
        };
        match runner.reconcile(&req).await {
            Ok(ReconcileAction::RequeueAfter(delay)) => {
                queue.forget(&req);
                queue.add_after(req.clone(), delay);
            }
            Ok(ReconcileAction::AwaitChange) => queue.forget(&req),
            Err(e) if e.is_internal() => {
                error!(request = %req, error = %e, "controller: internal error, dropping request");
                counter!("internal_errors_total", 1u64);
                queue.forget(&req);
            }
            Err(e) => {
                let attempts = queue.num_requeues(&req);
                if e.exhausts_budget() && attempts >= max_retries {
                    error!(request = %req, attempts, error = %e, "controller: retries exhausted, dropping request");
                    queue.forget(&req);
                } else {
                    warn!(request = %req, attempts, error = %e, "controller: reconcile failed, retrying with backoff");
                    queue.add_rate_limited(req.clone());
                }
            }
        }
        queue.done(&req);
    }
}

struct PrimaryHandler {
    queue: WorkQueue<Request>,
    cluster: Option<String>,
}

impl EventHandler for PrimaryHandler {
    fn name(&self) -> &str {
        "primary"
    }

    fn handle(&self, event: &Event) -> Result<(), RuntimeError> {
        self.queue.add(Request::new(self.cluster.as_deref(), event.object().key()));
        Ok(())
    }
}

struct OwnerHandler {
    queue: WorkQueue<Request>,
    cluster: Option<String>,
    owner_kind: ResourceKind,
}

impl EventHandler for OwnerHandler {
    fn name(&self) -> &str {
        "owner"
    }

    fn handle(&self, event: &Event) -> Result<(), RuntimeError> {
        let mut keys = event.object().owner_keys(&self.owner_kind);
        if let Event::Update { old, .. } = event {
            for k in old.owner_keys(&self.owner_kind) {
                if !keys.contains(&k) {
                    keys.push(k);
                }
            }
        }
        for key in keys {
            self.queue.add(Request::new(self.cluster.as_deref(), key));
        }
        Ok(())
    }
}

struct InputHandler {
    tracker: Arc<RequestTracker>,
    owner_kind: ResourceKind,
    same_namespace: bool,
}

impl EventHandler for InputHandler {
    fn name(&self) -> &str {
        "input"
    }

    fn handle(&self, event: &Event) -> Result<(), RuntimeError> {
        let ns = if self.same_namespace { event.object().namespace() } else { None };
        self.tracker.fan_out(&self.owner_kind, ns).map(|_| ())
    }
}
