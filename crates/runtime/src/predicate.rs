//! Watch-side event filters.

use std::collections::BTreeMap;
use std::sync::Arc;

use tidal_core::{Event, EventType};

use crate::tracker::RequestTracker;

pub trait Predicate: Send + Sync {
    fn accepts(&self, event: &Event) -> bool;
}

/// All predicates must accept, evaluated in order.
pub fn accepts_all(predicates: &[Arc<dyn Predicate>], event: &Event) -> bool {
    predicates.iter().all(|p| p.accepts(event))
}

/// Predicates for the primary kind: tracking first, so the active set sees
/// every create and delete whatever the user filters reject.
pub fn primary_predicates(
    tracker: Arc<RequestTracker>,
    cluster: Option<&str>,
    user: &[Arc<dyn Predicate>],
) -> Vec<Arc<dyn Predicate>> {
    let mut preds: Vec<Arc<dyn Predicate>> = vec![Arc::new(TrackingPredicate::new(tracker, cluster))];
    preds.extend(user.iter().cloned());
    preds
}

/// Objects carrying every label in the selector.
#[derive(Debug, Clone)]
pub struct LabelPredicate {
    selector: BTreeMap<String, String>,
}

impl LabelPredicate {
    pub fn new(selector: BTreeMap<String, String>) -> Self {
        Self { selector }
    }
}

impl Predicate for LabelPredicate {
    fn accepts(&self, event: &Event) -> bool {
        match event {
            // A label removal still has to reach the handler.
            Event::Update { old, new } => old.matches_labels(&self.selector) || new.matches_labels(&self.selector),
            _ => event.object().matches_labels(&self.selector),
        }
    }
}

/// Drops updates that only touched status or metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenerationChangedPredicate;

impl Predicate for GenerationChangedPredicate {
    fn accepts(&self, event: &Event) -> bool {
        match event {
            Event::Update { old, new } => {
                old.generation() != new.generation() || old.is_deleting() != new.is_deleting()
            }
            _ => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventTypePredicate {
    allowed: Vec<EventType>,
}

impl EventTypePredicate {
    pub fn new(allowed: Vec<EventType>) -> Self {
        Self { allowed }
    }
}

impl Predicate for EventTypePredicate {
    fn accepts(&self, event: &Event) -> bool {
        self.allowed.contains(&event.event_type())
    }
}

pub struct FnPredicate<F>(F);

impl<F> FnPredicate<F>
where
    F: Fn(&Event) -> bool + Send + Sync,
{
    pub fn new(f: F) -> Self {
        FnPredicate(f)
    }
}

impl<F> Predicate for FnPredicate<F>
where
    F: Fn(&Event) -> bool + Send + Sync,
{
    fn accepts(&self, event: &Event) -> bool {
        (self.0)(event)
    }
}

/// Maintains the tracker's active set for primaries. Always accepts.
pub struct TrackingPredicate {
    tracker: Arc<RequestTracker>,
    cluster: Option<String>,
}

impl TrackingPredicate {
    pub fn new(tracker: Arc<RequestTracker>, cluster: Option<&str>) -> Self {
        Self { tracker, cluster: cluster.map(str::to_string) }
    }
}

impl Predicate for TrackingPredicate {
    fn accepts(&self, event: &Event) -> bool {
        let cluster = self.cluster.as_deref();
        match event {
            Event::Create { object } | Event::Update { new: object, .. } | Event::Generic { object } => {
                self.tracker.track(cluster, object.key());
            }
            Event::Delete { object } => self.tracker.untrack(cluster, &object.key()),
        }
        true
    }
}
