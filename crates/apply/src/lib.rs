//! Tidal apply: the "ensure" write path.
//!
//! `Ensurer::ensure` links a child to its owner, creates it when missing, and
//! otherwise merges it onto the live object through reconcile functions and
//! replaces it under the live resource version. Stale versions are retried
//! against a fresh read with jittered backoff; nothing is blindly overwritten.

#![forbid(unsafe_code)]

use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tidal_core::{Client, Resource, StoreError};
use tracing::{debug, info};

pub mod retry;

pub use retry::{retry_if, RetryConfig};

/// `reconcile(existing, desired) -> merged`. `Ok(None)` means "leave the live
/// object as it is".
pub type ReconcileFn = dyn Fn(&Resource, Resource) -> anyhow::Result<Option<Resource>> + Send + Sync;

#[derive(Debug, thiserror::Error)]
pub enum EnsureError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("conflict on {key} persisted after {attempts} attempts: {last}")]
    ConflictBudgetExhausted { key: String, attempts: u32, last: StoreError },
    #[error("reconcile function failed for {key}: {message}")]
    Reconcile { key: String, message: String },
}

impl EnsureError {
    /// Whether the caller should requeue and try again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            EnsureError::Store(e) => e.is_retryable(),
            EnsureError::ConflictBudgetExhausted { .. } => true,
            EnsureError::Reconcile { .. } => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnsureOutcome {
    Created(Resource),
    Updated(Resource),
    Unchanged(Resource),
}

impl EnsureOutcome {
    pub fn resource(&self) -> &Resource {
        match self {
            EnsureOutcome::Created(r) | EnsureOutcome::Updated(r) | EnsureOutcome::Unchanged(r) => r,
        }
    }

    pub fn into_resource(self) -> Resource {
        match self {
            EnsureOutcome::Created(r) | EnsureOutcome::Updated(r) | EnsureOutcome::Unchanged(r) => r,
        }
    }

    pub fn wrote(&self) -> bool {
        !matches!(self, EnsureOutcome::Unchanged(_))
    }
}

/// Create-or-update with ownership linking and conflict retry.
#[derive(Debug, Clone)]
pub struct Ensurer {
    client: Client,
    retry: RetryConfig,
}

impl Ensurer {
    pub fn new(client: Client) -> Self {
        Self { client, retry: RetryConfig::default() }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub async fn ensure(
        &self,
        parent: Option<&Resource>,
        mut child: Resource,
        fns: &[&ReconcileFn],
    ) -> Result<EnsureOutcome, EnsureError> {
        if let Some(p) = parent {
            child.set_owner(p);
        }
        let key = child.key().to_string();
        let desired = &child;
        let this = self;
        let res = retry_if(&self.retry, "ensure", is_contended, move || this.ensure_once(desired, fns)).await;
        match res {
            Ok(outcome) => {
                match &outcome {
                    EnsureOutcome::Created(_) => {
                        counter!("ensure_created_total", 1u64);
                    }
                    EnsureOutcome::Updated(_) => {
                        counter!("ensure_updated_total", 1u64);
                    }
                    EnsureOutcome::Unchanged(_) => {
                        counter!("ensure_noop_total", 1u64);
                    }
                }
                Ok(outcome)
            }
            Err((EnsureError::Store(last), attempts)) if last.is_conflict() || is_lost_create(&last) => {
                Err(EnsureError::ConflictBudgetExhausted { key, attempts, last })
            }
            Err((e, _)) => Err(e),
        }
    }

    async fn ensure_once(&self, desired: &Resource, fns: &[&ReconcileFn]) -> Result<EnsureOutcome, EnsureError> {
        let key = desired.key();
        let Some(existing) = self.client.get_opt(&key).await? else {
            let created = self.client.create(desired).await?;
            info!(key = %key, cluster = ?self.client.cluster(), "ensure: created");
            return Ok(EnsureOutcome::Created(created));
        };

        let mut merged = desired.clone();
        for f in fns {
            match f(&existing, merged) {
                Ok(Some(next)) => merged = next,
                Ok(None) => {
                    debug!(key = %key, "ensure: reconcile function kept live object");
                    return Ok(EnsureOutcome::Unchanged(existing));
                }
                Err(e) => return Err(EnsureError::Reconcile { key: key.to_string(), message: format!("{:#}", e) }),
            }
        }
        merged.set_resource_version(existing.resource_version());

        let (target, base) = (comparable(&merged)?, comparable(&existing)?);
        if target == base {
            return Ok(EnsureOutcome::Unchanged(existing));
        }
        let summary = diff_summary(&target, &base);
        match self.client.update(&merged).await {
            Ok(updated) => {
                info!(
                    key = %key,
                    cluster = ?self.client.cluster(),
                    adds = summary.adds,
                    updates = summary.updates,
                    removes = summary.removes,
                    "ensure: updated"
                );
                Ok(EnsureOutcome::Updated(updated))
            }
            Err(e) => {
                if e.is_conflict() {
                    counter!("ensure_conflicts_total", 1u64);
                }
                Err(e.into())
            }
        }
    }
}

fn is_lost_create(e: &StoreError) -> bool {
    matches!(e, StoreError::AlreadyExists(_))
}

/// Stale version, or someone created the child between our read and create.
fn is_contended(e: &EnsureError) -> bool {
    matches!(e, EnsureError::Store(s) if s.is_conflict() || is_lost_create(s))
}

// ---- built-in reconcile functions ----

/// Keep finalizers registered on the live object by other controllers.
pub fn preserve_finalizers(existing: &Resource, mut desired: Resource) -> anyhow::Result<Option<Resource>> {
    for f in existing.finalizers() {
        desired.add_finalizer(f);
    }
    Ok(Some(desired))
}

/// Union of live and desired labels, desired wins.
pub fn merge_labels(existing: &Resource, mut desired: Resource) -> anyhow::Result<Option<Resource>> {
    if let Some(live) = existing.labels() {
        let labels = desired.metadata.labels.get_or_insert_with(Default::default);
        for (k, v) in live {
            labels.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
    Ok(Some(desired))
}

/// Union of live and desired annotations, desired wins. Other writers'
/// annotations survive our updates.
pub fn merge_annotations(existing: &Resource, mut desired: Resource) -> anyhow::Result<Option<Resource>> {
    if let Some(live) = &existing.metadata.annotations {
        let annotations = desired.metadata.annotations.get_or_insert_with(Default::default);
        for (k, v) in live {
            annotations.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
    Ok(Some(desired))
}

/// Carry the live status so status-less desired objects compare equal.
pub fn preserve_status(existing: &Resource, mut desired: Resource) -> anyhow::Result<Option<Resource>> {
    if let Some(status) = existing.field("status") {
        desired.set_field("status", status.clone());
    }
    Ok(Some(desired))
}

// ---- semantic comparison ----

/// Wire form with server-populated metadata and status removed.
fn comparable(obj: &Resource) -> Result<Json, StoreError> {
    Ok(strip_noisy(obj.to_json()?))
}

fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            for field in [
                "managedFields",
                "resourceVersion",
                "generation",
                "creationTimestamp",
                "deletionTimestamp",
                "deletionGracePeriodSeconds",
                "uid",
            ] {
                obj.remove(field);
            }
            // Absent and empty collections mean the same thing.
            obj.retain(|_, val| {
                !matches!(val, Json::Array(a) if a.is_empty()) && !matches!(val, Json::Object(o) if o.is_empty())
            });
        }
    }
    // Status is owned by the child's own controller.
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, out: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, out),
                        None => out.adds += 1,
                    }
                }
                out.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                out.updates += aa.iter().zip(bb.iter()).filter(|(x, y)| x != y).count();
                out.adds += aa.len().saturating_sub(bb.len());
                out.removes += bb.len().saturating_sub(aa.len());
            }
            (av, bv) => {
                if av != bv {
                    out.updates += 1;
                }
            }
        }
    }
    let mut out = DiffSummary::default();
    walk(target, base, &mut out);
    out
}
