//! Table-driven worker used when the operator runs a descriptor directly.

use anyhow::bail;
use serde_json::{json, Value};
use tidal_core::config::{PhaseConfig, ProjectConfig};
use tidal_core::Resource;
use tidal_runtime::{Inputs, SyncContext, SyncOutput, Worker};
use tracing::{debug, info};

/// Walks the phase table in declaration order. A phase advances once every
/// input it declares matched at least one object; terminal phases stay put.
pub struct PhaseTable {
    phases: Vec<PhaseConfig>,
}

impl PhaseTable {
    pub fn from_config(cfg: &ProjectConfig) -> Self {
        Self { phases: cfg.phases.clone() }
    }
}

#[async_trait::async_trait]
impl Worker for PhaseTable {
    type Phase = String;

    async fn sync(
        &self,
        phase: &String,
        _ctx: &SyncContext,
        resource: &Resource,
        inputs: &Inputs,
    ) -> anyhow::Result<SyncOutput<String>> {
        let Some(idx) = self.phases.iter().position(|p| p.name == *phase) else {
            bail!("phase {} is not in the table", phase);
        };
        let current = &self.phases[idx];
        if current.terminal {
            return Ok(SyncOutput::new(phase.clone()));
        }
        let missing: Vec<&str> =
            current.inputs.iter().filter(|d| inputs.get(&d.name).is_empty()).map(|d| d.name.as_str()).collect();
        if !missing.is_empty() {
            debug!(name = %resource.name(), phase = %phase, missing = ?missing, "worker: inputs pending");
            return Ok(SyncOutput::new(phase.clone()).with_status("waitingFor", json!(missing)));
        }
        let next = self.phases.get(idx + 1).map(|p| p.name.clone()).unwrap_or_else(|| phase.clone());
        Ok(SyncOutput::new(next).with_status("waitingFor", Value::Null))
    }

    async fn finalize(&self, _ctx: &SyncContext, resource: &Resource) -> anyhow::Result<()> {
        info!(kind = %resource.kind, name = %resource.name(), "worker: finalized");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tidal_core::registry::KindRegistry;
    use tidal_core::{ObjectStore, Request};
    use tidal_runtime::{ClusterSet, ReconcileAction, Runner};
    use tidal_store::MemStore;

    use super::*;

    const PROJECT: &str = r#"
kind: tidal.dev/v1/Quarantine
phases:
  - name: Pending
    initial: true
    inputs:
      - name: approval
        kind: v1/ConfigMap
  - name: Isolating
  - name: Isolated
    terminal: true
kinds:
  - kind: v1/ConfigMap
operator:
  work_interval_secs: 10
"#;

    #[tokio::test]
    async fn walks_the_table_once_inputs_appear() {
        let cfg = ProjectConfig::from_yaml_str(PROJECT).unwrap();
        let store = MemStore::new();
        let mut clusters = ClusterSet::new();
        clusters.insert(None, Arc::new(store.clone()));
        let registry = Arc::new(KindRegistry::from_config(&cfg));
        let runner = Runner::new(PhaseTable::from_config(&cfg), &cfg, Arc::new(clusters), registry).unwrap();

        let obj = Resource::new(cfg.kind.clone(), Some("ops"), "node-7");
        let req = Request::new(None, store.create(&obj).await.unwrap().key());

        assert_eq!(runner.reconcile(&req).await.unwrap(), ReconcileAction::RequeueAfter(Duration::ZERO));
        runner.reconcile(&req).await.unwrap();
        let got = store.get(&req.key).await.unwrap();
        assert_eq!(got.phase(), Some("Pending"));
        assert_eq!(got.status().unwrap()["waitingFor"], json!(["approval"]));

        store.create(&Resource::new("v1/ConfigMap".parse().unwrap(), Some("ops"), "approved")).await.unwrap();
        assert_eq!(runner.reconcile(&req).await.unwrap(), ReconcileAction::RequeueAfter(Duration::from_secs(10)));
        let got = store.get(&req.key).await.unwrap();
        assert_eq!(got.phase(), Some("Isolating"));
        assert!(got.status().unwrap().get("waitingFor").is_none());

        assert_eq!(runner.reconcile(&req).await.unwrap(), ReconcileAction::AwaitChange);
        assert_eq!(store.get(&req.key).await.unwrap().phase(), Some("Isolated"));
    }
}
