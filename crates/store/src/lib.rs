//! Tidal in-memory object store.
//!
//! Implements the `ObjectStore` boundary with the semantics the engine relies
//! on: strictly increasing resource versions, optimistic-concurrency writes,
//! status as a separate write path, finalizer-gated purge and a watch that
//! replays existing objects before streaming changes.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tidal_core::{
    CancelHandle, Event, ListParams, ObjectKey, ObjectStore, Resource, ResourceKind, StoreError, StoreResult,
    StreamHandle,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

/// Mutating operations, for fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteOp {
    Create,
    Update,
    UpdateStatus,
    Delete,
}

struct State {
    objects: FxHashMap<ObjectKey, Resource>,
    rv: u64,
    writes: u64,
    faults: FxHashMap<WriteOp, VecDeque<StoreError>>,
}

struct Shared {
    state: Mutex<State>,
    events: broadcast::Sender<Event>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory store; cheap to clone, clones share state.
#[derive(Clone)]
pub struct MemStore {
    shared: Arc<Shared>,
    watch_cap: usize,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// `cap` bounds both the change fan-out buffer and each watch channel.
    pub fn with_capacity(cap: usize) -> Self {
        let (events, _) = broadcast::channel(cap.max(1));
        let state = State { objects: FxHashMap::default(), rv: 0, writes: 0, faults: FxHashMap::default() };
        Self { shared: Arc::new(Shared { state: Mutex::new(state), events }), watch_cap: cap.max(1) }
    }

    pub fn len(&self) -> usize {
        self.shared.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count of writes that changed stored state.
    pub fn writes(&self) -> u64 {
        self.shared.lock().writes
    }

    /// Fail the next call of `op` with `err` (queued, one per call).
    pub fn fail_next(&self, op: WriteOp, err: StoreError) {
        self.shared.lock().faults.entry(op).or_default().push_back(err);
    }

    /// Emit a `Generic` event for a stored object, e.g. an external trigger.
    pub fn touch(&self, key: &ObjectKey) -> StoreResult<()> {
        let st = self.shared.lock();
        let obj = st.objects.get(key).cloned().ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        let _ = self.shared.events.send(Event::Generic { object: obj });
        Ok(())
    }

    fn injected(st: &mut State, op: WriteOp) -> StoreResult<()> {
        match st.faults.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn check_rv(existing: &Resource, incoming: &Resource) -> StoreResult<()> {
        match incoming.resource_version() {
            Some(rv) if Some(rv) != existing.resource_version() => Err(StoreError::Conflict(format!(
                "{}: resource version {} is stale (current {})",
                existing.key(),
                rv,
                existing.resource_version().unwrap_or("-")
            ))),
            _ => Ok(()),
        }
    }

    fn bump(st: &mut State, obj: &mut Resource) {
        st.rv += 1;
        st.writes += 1;
        obj.set_resource_version(Some(&st.rv.to_string()));
    }

    fn publish(&self, st: &State, ev: Event) {
        gauge!("store_objects", st.objects.len() as f64);
        counter!("store_writes_total", 1u64);
        // No receivers is fine: nobody is watching yet.
        let _ = self.shared.events.send(ev);
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemStore {
    async fn get(&self, key: &ObjectKey) -> StoreResult<Resource> {
        self.shared.lock().objects.get(key).cloned().ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn list(&self, kind: &ResourceKind, params: &ListParams) -> StoreResult<Vec<Resource>> {
        let st = self.shared.lock();
        let mut out: Vec<Resource> =
            st.objects.values().filter(|o| o.kind == *kind && params.matches(o)).cloned().collect();
        out.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(out)
    }

    async fn create(&self, obj: &Resource) -> StoreResult<Resource> {
        if obj.name().is_empty() {
            return Err(StoreError::Invalid(format!("{}: metadata.name required", obj.kind)));
        }
        let mut st = self.shared.lock();
        Self::injected(&mut st, WriteOp::Create)?;
        let key = obj.key();
        if st.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        let mut stored = obj.clone();
        stored.metadata.uid = Some(Uuid::new_v4().to_string());
        stored.metadata.generation = Some(1);
        stored.metadata.creation_timestamp = Some(Time(Utc::now()));
        stored.metadata.deletion_timestamp = None;
        stored.metadata.finalizers = stored.metadata.finalizers.take().filter(|f| !f.is_empty());
        Self::bump(&mut st, &mut stored);
        st.objects.insert(key.clone(), stored.clone());
        debug!(key = %key, rv = ?stored.resource_version(), "store: created");
        self.publish(&st, Event::Create { object: stored.clone() });
        Ok(stored)
    }

    async fn update(&self, obj: &Resource) -> StoreResult<Resource> {
        let mut st = self.shared.lock();
        Self::injected(&mut st, WriteOp::Update)?;
        let key = obj.key();
        let existing = st.objects.get(&key).cloned().ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        Self::check_rv(&existing, obj)?;
        if existing.is_deleting() && obj.finalizers().iter().any(|f| !existing.has_finalizer(f)) {
            return Err(StoreError::Invalid(format!("{}: no new finalizers may be added while deleting", key)));
        }

        let mut next = existing.clone();
        next.metadata.labels = obj.metadata.labels.clone();
        next.metadata.annotations = obj.metadata.annotations.clone();
        next.metadata.finalizers = obj.metadata.finalizers.clone().filter(|f| !f.is_empty());
        next.metadata.owner_references = obj.metadata.owner_references.clone();
        let body = obj.body_without_status();
        let spec_changed = body != existing.body_without_status();
        next.data = body;
        if let Some(status) = existing.field("status") {
            next.set_field("status", status.clone());
        }
        if next == existing {
            return Ok(existing);
        }
        if spec_changed {
            next.metadata.generation = Some(existing.generation().unwrap_or(0) + 1);
        }
        Self::bump(&mut st, &mut next);

        if next.is_deleting() && next.finalizers().is_empty() {
            st.objects.remove(&key);
            debug!(key = %key, "store: finalizers drained; purged");
            self.publish(&st, Event::Delete { object: next.clone() });
        } else {
            st.objects.insert(key.clone(), next.clone());
            debug!(key = %key, rv = ?next.resource_version(), "store: updated");
            self.publish(&st, Event::Update { old: existing, new: next.clone() });
        }
        Ok(next)
    }

    async fn update_status(&self, obj: &Resource) -> StoreResult<Resource> {
        let mut st = self.shared.lock();
        Self::injected(&mut st, WriteOp::UpdateStatus)?;
        let key = obj.key();
        let existing = st.objects.get(&key).cloned().ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        Self::check_rv(&existing, obj)?;
        let mut next = existing.clone();
        match obj.field("status") {
            Some(status) => next.set_field("status", status.clone()),
            None => {
                if let Some(m) = next.data.as_object_mut() {
                    m.remove("status");
                }
            }
        }
        if next == existing {
            return Ok(existing);
        }
        Self::bump(&mut st, &mut next);
        st.objects.insert(key.clone(), next.clone());
        debug!(key = %key, rv = ?next.resource_version(), phase = ?next.phase(), "store: status updated");
        self.publish(&st, Event::Update { old: existing, new: next.clone() });
        Ok(next)
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> {
        let mut st = self.shared.lock();
        Self::injected(&mut st, WriteOp::Delete)?;
        let existing = st.objects.get(key).cloned().ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if existing.finalizers().is_empty() {
            st.objects.remove(key);
            st.writes += 1;
            debug!(key = %key, "store: deleted");
            self.publish(&st, Event::Delete { object: existing });
            return Ok(());
        }
        if existing.is_deleting() {
            return Ok(());
        }
        let mut next = existing.clone();
        next.mark_deleting();
        next.metadata.generation = Some(existing.generation().unwrap_or(0) + 1);
        Self::bump(&mut st, &mut next);
        st.objects.insert(key.clone(), next.clone());
        debug!(key = %key, finalizers = ?next.finalizers(), "store: deletion pending finalizers");
        self.publish(&st, Event::Update { old: existing, new: next });
        Ok(())
    }

    async fn watch(&self, kind: &ResourceKind, namespace: Option<&str>) -> StoreResult<StreamHandle<Event>> {
        let filter = ListParams::default().namespace(namespace);
        // Subscribe before the snapshot so nothing falls between the two.
        let mut sub = self.shared.events.subscribe();
        let initial = self.list(kind, &filter).await?;
        let (tx, rx) = mpsc::channel(self.watch_cap);
        let (cancel, mut cancel_rx) = CancelHandle::new();
        let store = self.clone();
        let kind = kind.clone();
        tokio::spawn(async move {
            let mut delivered = Delivered::default();
            for object in initial {
                let ev = Event::Create { object };
                delivered.record(&ev);
                if tx.send(ev).await.is_err() {
                    return;
                }
            }
            loop {
                tokio::select! {
                    _ = &mut cancel_rx => break,
                    msg = sub.recv() => match msg {
                        Ok(ev) => {
                            if ev.kind() != &kind || !filter.matches(ev.object()) {
                                continue;
                            }
                            delivered.record(&ev);
                            if tx.send(ev).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(kind = %kind, missed, "store watch lagged; resyncing");
                            let Ok(all) = store.list(&kind, &filter).await else { break };
                            for ev in delivered.resync(all) {
                                if tx.send(ev).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            debug!(kind = %kind, "store watch stopped");
        });
        Ok(StreamHandle { rx, cancel })
    }
}

/// Last object sent per key on one watch, so a resync can report what
/// vanished while the watch lagged.
#[derive(Default)]
struct Delivered(FxHashMap<ObjectKey, Resource>);

impl Delivered {
    fn record(&mut self, ev: &Event) {
        match ev {
            Event::Delete { object } => {
                self.0.remove(&object.key());
            }
            other => {
                let object = other.object();
                self.0.insert(object.key(), object.clone());
            }
        }
    }

    /// `Delete` for delivered objects no longer listed, then `Generic` for the rest.
    fn resync(&mut self, listed: Vec<Resource>) -> Vec<Event> {
        let live: FxHashSet<ObjectKey> = listed.iter().map(Resource::key).collect();
        let mut out: Vec<Event> = self
            .0
            .iter()
            .filter(|(key, _)| !live.contains(*key))
            .map(|(_, object)| Event::Delete { object: object.clone() })
            .collect();
        out.extend(listed.into_iter().map(|object| Event::Generic { object }));
        for ev in &out {
            self.record(ev);
        }
        out
    }
}
