//! Tidal kubehub: the Kubernetes-backed object store.
//!
//! `KubeStore` speaks to one API server through `Api<DynamicObject>`, with
//! each kind resolved once through discovery and cached. Writes carry the
//! object's resource version, so the server enforces optimistic concurrency.

#![forbid(unsafe_code)]

use std::sync::{PoisonError, RwLock};

use futures::TryStreamExt;
use kube::{
    api::{Api, DeleteParams, PostParams},
    config::KubeConfigOptions,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{self, Scope},
    runtime::{watcher, WatchStreamExt},
    Client, Config,
};
use rustc_hash::FxHashMap;
use tidal_core::{
    CancelHandle, Event, ListParams, ObjectKey, ObjectStore, Resource, ResourceKind, StoreError, StoreResult,
    StreamHandle,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub mod leader;

pub use leader::{LeaderElector, LeaderError, LeaderGuard};

/// Client for a kubeconfig context, or the inferred config (in-cluster or
/// current context) when none is named.
pub async fn connect(context: Option<&str>) -> anyhow::Result<Client> {
    let config = match context {
        Some(ctx) => {
            let opts = KubeConfigOptions { context: Some(ctx.to_string()), ..Default::default() };
            Config::from_kubeconfig(&opts).await?
        }
        None => Config::infer().await?,
    };
    info!(context = ?context, cluster_url = %config.cluster_url, "kubehub: connected");
    Ok(Client::try_from(config)?)
}

/// Map an API error onto the store taxonomy.
pub fn store_error(err: kube::Error, what: &str) -> StoreError {
    match err {
        kube::Error::Api(ae) => {
            let msg = format!("{}: {}", what, ae.message);
            match ae.code {
                404 => StoreError::NotFound(msg),
                409 if ae.reason == "AlreadyExists" => StoreError::AlreadyExists(msg),
                409 => StoreError::Conflict(msg),
                400 | 422 => StoreError::Invalid(msg),
                401 | 403 => StoreError::Forbidden(msg),
                _ => StoreError::Transient(msg),
            }
        }
        other => StoreError::Transient(format!("{}: {}", what, other)),
    }
}

fn to_dynamic(obj: &Resource) -> StoreResult<DynamicObject> {
    serde_json::from_value(obj.to_json()?)
        .map_err(|e| StoreError::Internal(format!("{}: encoding object: {}", obj.key(), e)))
}

fn from_dynamic(obj: DynamicObject) -> StoreResult<Resource> {
    let mut raw = serde_json::to_value(&obj).map_err(|e| StoreError::Internal(format!("decoding object: {}", e)))?;
    if let Some(meta) = raw.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
    Resource::from_json(raw)
}

#[derive(Clone)]
struct Resolved {
    ar: ApiResource,
    namespaced: bool,
}

pub struct KubeStore {
    client: Client,
    resolved: RwLock<FxHashMap<ResourceKind, Resolved>>,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client, resolved: RwLock::new(FxHashMap::default()) }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn resolve(&self, kind: &ResourceKind) -> StoreResult<Resolved> {
        let cached = self.resolved.read().unwrap_or_else(PoisonError::into_inner).get(kind).cloned();
        if let Some(r) = cached {
            return Ok(r);
        }
        let gvk = GroupVersionKind::gvk(&kind.group, &kind.version, &kind.kind);
        let (ar, caps) = discovery::pinned_kind(&self.client, &gvk)
            .await
            .map_err(|e| store_error(e, &format!("discovering {}", kind)))?;
        let resolved = Resolved { ar, namespaced: matches!(caps.scope, Scope::Namespaced) };
        debug!(kind = %kind, plural = %resolved.ar.plural, namespaced = resolved.namespaced, "kubehub: kind resolved");
        self.resolved.write().unwrap_or_else(PoisonError::into_inner).insert(kind.clone(), resolved.clone());
        Ok(resolved)
    }

    async fn api(&self, kind: &ResourceKind, namespace: Option<&str>) -> StoreResult<Api<DynamicObject>> {
        let r = self.resolve(kind).await?;
        Ok(match (r.namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &r.ar),
            _ => Api::all_with(self.client.clone(), &r.ar),
        })
    }

    /// Api scoped for a single-object call; namespaced kinds need a namespace.
    async fn api_for(&self, key: &ObjectKey) -> StoreResult<Api<DynamicObject>> {
        let r = self.resolve(&key.kind).await?;
        match (r.namespaced, key.namespace()) {
            (true, None) => Err(StoreError::Invalid(format!("{}: namespace required", key))),
            (true, Some(ns)) => Ok(Api::namespaced_with(self.client.clone(), ns, &r.ar)),
            (false, _) => Ok(Api::all_with(self.client.clone(), &r.ar)),
        }
    }
}

#[async_trait::async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> StoreResult<Resource> {
        let api = self.api_for(key).await?;
        let obj = api.get(&key.name).await.map_err(|e| store_error(e, &key.to_string()))?;
        from_dynamic(obj)
    }

    async fn list(&self, kind: &ResourceKind, params: &ListParams) -> StoreResult<Vec<Resource>> {
        let api = self.api(kind, params.namespace.as_deref()).await?;
        let mut lp = kube::api::ListParams::default();
        if let Some(sel) = params.label_selector() {
            lp = lp.labels(&sel);
        }
        let list = api.list(&lp).await.map_err(|e| store_error(e, &format!("listing {}", kind)))?;
        list.items.into_iter().map(from_dynamic).collect()
    }

    async fn create(&self, obj: &Resource) -> StoreResult<Resource> {
        let key = obj.key();
        let api = self.api_for(&key).await?;
        let created =
            api.create(&PostParams::default(), &to_dynamic(obj)?).await.map_err(|e| store_error(e, &key.to_string()))?;
        from_dynamic(created)
    }

    async fn update(&self, obj: &Resource) -> StoreResult<Resource> {
        let key = obj.key();
        let api = self.api_for(&key).await?;
        let replaced = api
            .replace(&key.name, &PostParams::default(), &to_dynamic(obj)?)
            .await
            .map_err(|e| store_error(e, &key.to_string()))?;
        from_dynamic(replaced)
    }

    async fn update_status(&self, obj: &Resource) -> StoreResult<Resource> {
        let key = obj.key();
        let api = self.api_for(&key).await?;
        let body = serde_json::to_vec(&obj.to_json()?)
            .map_err(|e| StoreError::Internal(format!("{}: encoding status: {}", key, e)))?;
        let replaced = api
            .replace_status(&key.name, &PostParams::default(), body)
            .await
            .map_err(|e| store_error(e, &key.to_string()))?;
        from_dynamic(replaced)
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> {
        let api = self.api_for(key).await?;
        api.delete(&key.name, &DeleteParams::default()).await.map_err(|e| store_error(e, &key.to_string()))?;
        Ok(())
    }

    async fn watch(&self, kind: &ResourceKind, namespace: Option<&str>) -> StoreResult<StreamHandle<Event>> {
        let api = self.api(kind, namespace).await?;
        let (tx, rx) = mpsc::channel(1024);
        let (cancel, mut cancel_rx) = CancelHandle::new();
        let kind = kind.clone();
        let namespace = namespace.map(str::to_string);
        tokio::spawn(async move {
            let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
            futures::pin_mut!(stream);
            let mut state = WatchState::default();
            info!(kind = %kind, ns = ?namespace, "kubehub: watch started");
            loop {
                let next = tokio::select! {
                    _ = &mut cancel_rx => break,
                    next = stream.try_next() => next,
                };
                let ev = match next {
                    Ok(Some(ev)) => ev,
                    Ok(None) => break,
                    Err(e) => {
                        // The watcher backs off and relists on its own.
                        warn!(kind = %kind, error = %e, "kubehub: watch error");
                        continue;
                    }
                };
                for out in state.apply(ev) {
                    if tx.send(out).await.is_err() {
                        return;
                    }
                }
            }
            debug!(kind = %kind, "kubehub: watch stopped");
        });
        Ok(StreamHandle { rx, cancel })
    }
}

/// Turns watcher events into create/update/delete by remembering what has
/// been seen. A relist reports vanished objects as deletes.
#[derive(Default)]
pub struct WatchState {
    seen: FxHashMap<ObjectKey, Resource>,
}

impl WatchState {
    pub fn apply(&mut self, ev: watcher::Event<DynamicObject>) -> Vec<Event> {
        match ev {
            watcher::Event::Applied(obj) => self.applied(obj).into_iter().collect(),
            watcher::Event::Deleted(obj) => match from_dynamic(obj) {
                Ok(object) => {
                    self.seen.remove(&object.key());
                    vec![Event::Delete { object }]
                }
                Err(e) => {
                    warn!(error = %e, "kubehub: undecodable delete");
                    Vec::new()
                }
            },
            watcher::Event::Restarted(list) => {
                let mut out = Vec::new();
                let mut live = rustc_hash::FxHashSet::default();
                for obj in list {
                    if let Some(ev) = self.applied(obj) {
                        live.insert(ev.object().key());
                        out.push(ev);
                    }
                }
                let gone: Vec<ObjectKey> = self.seen.keys().filter(|k| !live.contains(*k)).cloned().collect();
                for key in gone {
                    if let Some(object) = self.seen.remove(&key) {
                        out.push(Event::Delete { object });
                    }
                }
                out
            }
        }
    }

    fn applied(&mut self, obj: DynamicObject) -> Option<Event> {
        let new = match from_dynamic(obj) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "kubehub: undecodable object");
                return None;
            }
        };
        match self.seen.insert(new.key(), new.clone()) {
            Some(old) => Some(Event::Update { old, new }),
            None => Some(Event::Create { object: new }),
        }
    }
}
