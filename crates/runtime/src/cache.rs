//! Event cache and dispatcher.
//!
//! Events are stored under an opaque [`Token`]; only tokens travel through the
//! dispatch queue. A token resolves until its event has been handled
//! successfully (or dropped), so a failed dispatch can be retried against the
//! same payload.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tidal_core::{Event, ResourceKind};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::queue::WorkQueue;
use crate::RuntimeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(Uuid);

impl Token {
    fn fresh() -> Self {
        Token(Uuid::new_v4())
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Turns one event into work: usually enqueues requests.
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;
    fn handle(&self, event: &Event) -> Result<(), RuntimeError>;
}

type Handlers = SmallVec<[Arc<dyn EventHandler>; 2]>;

#[derive(Default)]
pub struct EventCache {
    events: RwLock<FxHashMap<Token, Event>>,
    handlers: RwLock<FxHashMap<ResourceKind, Handlers>>,
}

impl EventCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: ResourceKind, handler: Arc<dyn EventHandler>) {
        let mut map = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(kind).or_default().push(handler);
    }

    pub fn has_handlers(&self, kind: &ResourceKind) -> bool {
        let map = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        map.get(kind).map_or(false, |h| !h.is_empty())
    }

    pub fn add(&self, event: Event) -> Token {
        let token = Token::fresh();
        let mut map = self.events.write().unwrap_or_else(PoisonError::into_inner);
        map.insert(token, event);
        gauge!("event_cache_size", map.len() as f64);
        token
    }

    pub fn get(&self, token: Token) -> Option<Event> {
        self.events.read().unwrap_or_else(PoisonError::into_inner).get(&token).cloned()
    }

    pub fn forget(&self, token: Token) {
        let mut map = self.events.write().unwrap_or_else(PoisonError::into_inner);
        map.remove(&token);
        gauge!("event_cache_size", map.len() as f64);
    }

    pub fn len(&self) -> usize {
        self.events.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every handler registered for the event's kind. The first handler
    /// error aborts and leaves the token cached; success forgets it.
    pub fn reconcile(&self, token: Token) -> Result<(), RuntimeError> {
        let Some(event) = self.get(token) else {
            return Err(RuntimeError::internal("event-cache", format!("token {} does not resolve to an event", token)));
        };
        let handlers: Handlers = {
            let map = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
            map.get(event.kind()).cloned().unwrap_or_default()
        };
        for h in &handlers {
            if let Err(e) = h.handle(&event) {
                debug!(token = %token, handler = h.name(), kind = %event.kind(), error = %e, "dispatch: handler failed");
                return Err(e);
            }
        }
        self.forget(token);
        Ok(())
    }
}

/// Event cache plus the token queue that feeds it.
#[derive(Clone)]
pub struct Dispatcher {
    cache: Arc<EventCache>,
    queue: WorkQueue<Token>,
    max_retries: u32,
}

impl Dispatcher {
    pub fn new(cache: Arc<EventCache>, queue: WorkQueue<Token>, max_retries: u32) -> Self {
        Self { cache, queue, max_retries }
    }

    pub fn cache(&self) -> &Arc<EventCache> {
        &self.cache
    }

    pub fn queue(&self) -> &WorkQueue<Token> {
        &self.queue
    }

    pub fn submit(&self, event: Event) -> Token {
        let token = self.cache.add(event);
        self.queue.add(token);
        token
    }

    /// Drain tokens until the queue shuts down.
    pub async fn run_worker(self) {
        while let Some(token) = self.queue.get().await {
            self.process(token);
            self.queue.done(&token);
        }
    }

    fn process(&self, token: Token) {
        match self.cache.reconcile(token) {
            Ok(()) => self.queue.forget(&token),
            Err(e) if e.is_internal() => {
                error!(token = %token, error = %e, "dispatch: internal error, dropping event");
                counter!("internal_errors_total", 1u64);
                self.drop_token(token);
            }
            Err(e) => {
                counter!("event_dispatch_errors_total", 1u64);
                let attempts = self.queue.num_requeues(&token);
                if attempts < self.max_retries {
                    warn!(token = %token, attempts, error = %e, "dispatch: retrying event");
                    self.queue.add_rate_limited(token);
                } else {
                    error!(token = %token, attempts, error = %e, "dispatch: retries exhausted, dropping event");
                    self.drop_token(token);
                }
            }
        }
    }

    fn drop_token(&self, token: Token) {
        self.cache.forget(token);
        self.queue.forget(&token);
    }
}
