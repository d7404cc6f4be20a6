//! Object store boundary: the CRUD + watch contract the engine consumes, and
//! the `Client` facade used by everything above it.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::{Event, ObjectKey, Resource, ResourceKind};

/// Store errors, classified the way callers need to react to them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum StoreError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("already_exists: {0}")]
    AlreadyExists(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("transient: {0}")]
    Transient(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    /// Worth another attempt later; validation and permission failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict(_) | StoreError::Transient(_) | StoreError::Internal(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// List filter: optional namespace plus equality label selector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListParams {
    pub namespace: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl ListParams {
    pub fn namespace(mut self, ns: Option<&str>) -> Self {
        self.namespace = ns.map(|s| s.to_string());
        self
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn labels(mut self, labels: &BTreeMap<String, String>) -> Self {
        self.labels.extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// `k=v,k2=v2`, the API server's label selector syntax.
    pub fn label_selector(&self) -> Option<String> {
        if self.labels.is_empty() {
            return None;
        }
        Some(self.labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(","))
    }

    pub fn matches(&self, obj: &Resource) -> bool {
        if let Some(ns) = &self.namespace {
            if obj.namespace() != Some(ns.as_str()) {
                return false;
            }
        }
        obj.matches_labels(&self.labels)
    }
}

/// Cancellation handle for a running watch. Dropping it also cancels.
#[derive(Debug)]
pub struct CancelHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl CancelHandle {
    pub fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn cancel(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Result of starting a streaming operation.
#[derive(Debug)]
pub struct StreamHandle<T> {
    pub rx: mpsc::Receiver<T>,
    pub cancel: CancelHandle,
}

/// Everything the engine needs from the store. Writes use resource-version
/// optimistic concurrency; there is no other locking.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> StoreResult<Resource>;

    async fn list(&self, kind: &ResourceKind, params: &ListParams) -> StoreResult<Vec<Resource>>;

    async fn create(&self, obj: &Resource) -> StoreResult<Resource>;

    /// Replace everything except `status`. A non-empty resource version must
    /// match the stored one or the call fails with `Conflict`.
    async fn update(&self, obj: &Resource) -> StoreResult<Resource>;

    /// Replace only `status`, same concurrency rule as `update`.
    async fn update_status(&self, obj: &Resource) -> StoreResult<Resource>;

    /// Request deletion. Objects with finalizers linger with a deletion timestamp.
    async fn delete(&self, key: &ObjectKey) -> StoreResult<()>;

    /// Stream changes for one kind. Existing objects are replayed first as `Create`.
    async fn watch(&self, kind: &ResourceKind, namespace: Option<&str>) -> StoreResult<StreamHandle<Event>>;
}

/// Store facade bound to one cluster.
#[derive(Clone)]
pub struct Client {
    cluster: Option<String>,
    store: Arc<dyn ObjectStore>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("cluster", &self.cluster).finish_non_exhaustive()
    }
}

impl Client {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { cluster: None, store }
    }

    pub fn for_cluster(cluster: Option<&str>, store: Arc<dyn ObjectStore>) -> Self {
        Self { cluster: cluster.map(|s| s.to_string()), store }
    }

    pub fn cluster(&self) -> Option<&str> {
        self.cluster.as_deref()
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub async fn get(&self, key: &ObjectKey) -> StoreResult<Resource> {
        self.store.get(key).await
    }

    /// `get` with NotFound mapped to `None`.
    pub async fn get_opt(&self, key: &ObjectKey) -> StoreResult<Option<Resource>> {
        match self.store.get(key).await {
            Ok(obj) => Ok(Some(obj)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn list(&self, kind: &ResourceKind, params: &ListParams) -> StoreResult<Vec<Resource>> {
        self.store.list(kind, params).await
    }

    pub async fn create(&self, obj: &Resource) -> StoreResult<Resource> {
        self.store.create(obj).await
    }

    pub async fn update(&self, obj: &Resource) -> StoreResult<Resource> {
        self.store.update(obj).await
    }

    pub async fn update_status(&self, obj: &Resource) -> StoreResult<Resource> {
        self.store.update_status(obj).await
    }

    /// Delete; an already-missing object counts as deleted.
    pub async fn delete(&self, key: &ObjectKey) -> StoreResult<()> {
        match self.store.delete(key).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    pub async fn watch(&self, kind: &ResourceKind, namespace: Option<&str>) -> StoreResult<StreamHandle<Event>> {
        self.store.watch(kind, namespace).await
    }
}
