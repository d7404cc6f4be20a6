//! Active request sets per cluster and the cluster → queue registry.
//!
//! Watch predicates keep the active sets current; input handlers fan an
//! input change out to every active primary, on whichever cluster it lives.
//! Lock order is `active` then `queues`.

use std::sync::{PoisonError, RwLock};

use rustc_hash::{FxHashMap, FxHashSet};
use tidal_core::{ObjectKey, Request, ResourceKind};
use tracing::{debug, info};

use crate::queue::WorkQueue;
use crate::RuntimeError;

type ClusterId = Option<String>;

#[derive(Default)]
pub struct RequestTracker {
    active: RwLock<FxHashMap<ClusterId, FxHashSet<ObjectKey>>>,
    queues: RwLock<FxHashMap<ClusterId, WorkQueue<Request>>>,
}

fn cluster_label(c: &ClusterId) -> &str {
    c.as_deref().unwrap_or("<default>")
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, cluster: Option<&str>, key: ObjectKey) {
        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        active.entry(cluster.map(str::to_string)).or_default().insert(key);
    }

    pub fn untrack(&self, cluster: Option<&str>, key: &ObjectKey) {
        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(set) = active.get_mut(&cluster.map(str::to_string)) {
            set.remove(key);
        }
    }

    pub fn is_tracked(&self, cluster: Option<&str>, key: &ObjectKey) -> bool {
        let active = self.active.read().unwrap_or_else(PoisonError::into_inner);
        active.get(&cluster.map(str::to_string)).map_or(false, |s| s.contains(key))
    }

    /// Sorted snapshot of one cluster's active set.
    pub fn active(&self, cluster: Option<&str>) -> Vec<ObjectKey> {
        let active = self.active.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<_> =
            active.get(&cluster.map(str::to_string)).map(|s| s.iter().cloned().collect()).unwrap_or_default();
        keys.sort();
        keys
    }

    /// First registration wins; returns whether this call registered.
    pub fn register_queue(&self, cluster: Option<&str>, queue: WorkQueue<Request>) -> bool {
        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        let id = cluster.map(str::to_string);
        if queues.contains_key(&id) {
            return false;
        }
        info!(cluster = cluster_label(&id), queue = queue.name(), "tracker: request queue registered");
        queues.insert(id, queue);
        true
    }

    pub fn queue_for(&self, cluster: Option<&str>) -> Option<WorkQueue<Request>> {
        self.queues.read().unwrap_or_else(PoisonError::into_inner).get(&cluster.map(str::to_string)).cloned()
    }

    /// Enqueue every active primary of `owner_kind`, on its own cluster's
    /// queue. `namespace` restricts the fan-out to owners in that namespace.
    /// Owners on a cluster without a queue yet make the whole call fail so
    /// the event is retried; the ones already enqueued coalesce.
    pub fn fan_out(&self, owner_kind: &ResourceKind, namespace: Option<&str>) -> Result<usize, RuntimeError> {
        let active = self.active.read().unwrap_or_else(PoisonError::into_inner);
        let queues = self.queues.read().unwrap_or_else(PoisonError::into_inner);
        let mut sent = 0;
        let mut unrouted = None;
        for (cluster, keys) in active.iter() {
            let targets = keys
                .iter()
                .filter(|k| k.kind == *owner_kind)
                .filter(|k| namespace.is_none() || k.namespace() == namespace);
            for key in targets {
                match queues.get(cluster) {
                    Some(q) => {
                        q.add(Request { cluster: cluster.clone(), key: key.clone() });
                        sent += 1;
                    }
                    None => {
                        unrouted.get_or_insert_with(|| cluster_label(cluster).to_string());
                    }
                }
            }
        }
        debug!(owner_kind = %owner_kind, namespace = ?namespace, sent, "tracker: fan-out");
        match unrouted {
            Some(cluster) => Err(RuntimeError::Unrouted { cluster }),
            None => Ok(sent),
        }
    }
}
