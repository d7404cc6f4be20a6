//! Static tables built once at startup: kind string -> factory, and the
//! owner x child edge table that drives dependent-resource routing.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use serde_json::json;

use crate::config::ProjectConfig;
use crate::{Resource, ResourceKind};

/// Builds a blank object of a kind.
pub type Factory = fn(&ResourceKind, Option<&str>, &str) -> Resource;

/// Empty body.
pub fn blank_object(kind: &ResourceKind, namespace: Option<&str>, name: &str) -> Resource {
    Resource::new(kind.clone(), namespace, name)
}

/// Empty `spec` section, for custom resources.
pub fn spec_object(kind: &ResourceKind, namespace: Option<&str>, name: &str) -> Resource {
    Resource::new(kind.clone(), namespace, name).with_spec(json!({}))
}

#[derive(Debug, Clone)]
pub struct KindEntry {
    pub kind: ResourceKind,
    pub namespaced: bool,
    factory: Factory,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown kind: {0}")]
    Unknown(String),
    #[error("ambiguous kind {0}: use group/version/Kind")]
    Ambiguous(String),
    #[error("kind {0} is namespaced; namespace required")]
    NamespaceRequired(String),
}

/// Kind table keyed by `gvk_key`; lookups also accept a bare `Kind` when unique.
#[derive(Debug, Clone, Default)]
pub struct KindRegistry {
    entries: FxHashMap<String, KindEntry>,
}

impl KindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: ResourceKind, namespaced: bool) -> &mut Self {
        self.register_with(kind, namespaced, blank_object)
    }

    pub fn register_with(&mut self, kind: ResourceKind, namespaced: bool, factory: Factory) -> &mut Self {
        self.entries.insert(kind.gvk_key(), KindEntry { kind, namespaced, factory });
        self
    }

    /// Primary kind (with `spec`) plus every kind in the descriptor's kind table.
    pub fn from_config(cfg: &ProjectConfig) -> Self {
        let mut reg = Self::new();
        reg.register_with(cfg.kind.clone(), cfg.namespaced, spec_object);
        for k in &cfg.kinds {
            reg.register(k.kind.clone(), k.namespaced);
        }
        reg
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn kinds(&self) -> impl Iterator<Item = &ResourceKind> {
        self.entries.values().map(|e| &e.kind)
    }

    pub fn resolve(&self, name: &str) -> Result<&KindEntry, RegistryError> {
        if let Some(e) = self.entries.get(name) {
            return Ok(e);
        }
        let mut matches = self.entries.values().filter(|e| e.kind.kind == name);
        match (matches.next(), matches.next()) {
            (Some(e), None) => Ok(e),
            (Some(_), Some(_)) => Err(RegistryError::Ambiguous(name.to_string())),
            _ => Err(RegistryError::Unknown(name.to_string())),
        }
    }

    pub fn get(&self, kind: &ResourceKind) -> Option<&KindEntry> {
        self.entries.get(&kind.gvk_key())
    }

    /// Namespaced unless registered otherwise.
    pub fn is_namespaced(&self, kind: &ResourceKind) -> bool {
        self.get(kind).map(|e| e.namespaced).unwrap_or(true)
    }

    /// Blank object of a registered kind. The namespace is dropped for
    /// cluster-scoped kinds and required for namespaced ones.
    pub fn new_object(&self, kind: &str, namespace: Option<&str>, name: &str) -> Result<Resource, RegistryError> {
        let entry = self.resolve(kind)?;
        let ns = if entry.namespaced {
            Some(namespace.ok_or_else(|| RegistryError::NamespaceRequired(entry.kind.gvk_key()))?)
        } else {
            None
        };
        Ok((entry.factory)(&entry.kind, ns, name))
    }
}

/// How a child kind relates to an owner kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Edge {
    /// Read by the owner; changes fan out through the active request set.
    Input,
    /// Produced by the owner; changes route back via owner references.
    Output,
}

/// Directed edges `(owner kind, child kind) -> Edge`.
#[derive(Debug, Clone, Default)]
pub struct EdgeTable {
    edges: BTreeMap<(ResourceKind, ResourceKind), Edge>,
}

impl EdgeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Output wins when a kind is both read and produced: owner references
    /// route more precisely than the fan-out.
    pub fn add(&mut self, owner: ResourceKind, child: ResourceKind, edge: Edge) -> &mut Self {
        let slot = self.edges.entry((owner, child)).or_insert(edge);
        if edge == Edge::Output {
            *slot = Edge::Output;
        }
        self
    }

    pub fn from_config(cfg: &ProjectConfig) -> Self {
        let mut table = Self::new();
        for k in cfg.input_kinds() {
            table.add(cfg.kind.clone(), k, Edge::Input);
        }
        for k in cfg.output_kinds() {
            table.add(cfg.kind.clone(), k, Edge::Output);
        }
        table
    }

    pub fn edge(&self, owner: &ResourceKind, child: &ResourceKind) -> Option<Edge> {
        self.edges.get(&(owner.clone(), child.clone())).copied()
    }

    pub fn children(&self, owner: &ResourceKind, edge: Edge) -> Vec<&ResourceKind> {
        self.edges
            .iter()
            .filter(|((o, _), e)| o == owner && **e == edge)
            .map(|((_, c), _)| c)
            .collect()
    }

    pub fn owners(&self, child: &ResourceKind, edge: Edge) -> Vec<&ResourceKind> {
        self.edges
            .iter()
            .filter(|((_, c), e)| c == child && **e == edge)
            .map(|((o, _), _)| o)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}
