use std::collections::BTreeMap;
use std::sync::Arc;

use tidal_core::{Client, ObjectStore};

use crate::RuntimeError;

/// Named clients, one per cluster. `None` is the single default cluster.
#[derive(Clone, Default)]
pub struct ClusterSet {
    clients: BTreeMap<Option<String>, Client>,
}

impl ClusterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: Option<&str>, store: Arc<dyn ObjectStore>) -> &mut Self {
        self.clients.insert(name.map(str::to_string), Client::for_cluster(name, store));
        self
    }

    pub fn client(&self, name: Option<&str>) -> Result<&Client, RuntimeError> {
        self.clients
            .get(&name.map(str::to_string))
            .ok_or_else(|| RuntimeError::internal("clusters", format!("unknown cluster {:?}", name)))
    }

    pub fn clients(&self) -> impl Iterator<Item = &Client> {
        self.clients.values()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
