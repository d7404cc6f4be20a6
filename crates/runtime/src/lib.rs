//! Tidal runtime: the reconciliation engine.
//!
//! Watches feed an [`EventCache`] through predicates; handlers turn events
//! into [`Request`](tidal_core::Request)s on a per-cluster [`WorkQueue`];
//! the [`Runner`] drives each request through the phase table.

#![forbid(unsafe_code)]

pub mod cache;
pub mod cluster;
pub mod controller;
mod error;
pub mod manager;
pub mod predicate;
pub mod queue;
pub mod runner;
pub mod tracker;

pub use cache::{Dispatcher, EventCache, EventHandler, Token};
pub use cluster::ClusterSet;
pub use controller::{Controller, ControllerBuilder, ControllerOptions};
pub use error::RuntimeError;
pub use manager::Manager;
pub use predicate::{
    EventTypePredicate, FnPredicate, GenerationChangedPredicate, LabelPredicate, Predicate, TrackingPredicate,
};
pub use queue::{RateLimit, WorkQueue};
pub use runner::{Inputs, Phase, PhaseMachine, ReconcileAction, Runner, SyncContext, SyncOutput, Worker};
pub use tracker::RequestTracker;
