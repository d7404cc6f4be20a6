//! Project descriptor: the phase table, kind table and operator settings.
//!
//! Loaded once at process start (YAML), validated, then passed down by value.
//! `TIDAL_*` environment variables override operator settings.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{EventType, ResourceKind};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing project descriptor: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid project descriptor: {0}")]
    Invalid(String),
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Primary kind reconciled by this project.
    pub kind: ResourceKind,
    #[serde(default = "default_true")]
    pub namespaced: bool,
    /// Engine finalizer name; defaults to `<group>/finalizer`.
    #[serde(default)]
    pub finalizer: Option<String>,
    pub phases: Vec<PhaseConfig>,
    /// Static kind table for dependent kinds.
    #[serde(default)]
    pub kinds: Vec<KindConfig>,
    #[serde(default)]
    pub operator: OperatorConfig,
    /// Empty means a single default cluster.
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseConfig {
    pub name: String,
    #[serde(default)]
    pub initial: bool,
    #[serde(default)]
    pub terminal: bool,
    #[serde(default)]
    pub inputs: Vec<InputDecl>,
    #[serde(default)]
    pub outputs: Vec<ResourceKind>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Cardinality {
    One,
    #[default]
    Many,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InputScope {
    #[default]
    SameNamespace,
    AllNamespaces,
}

/// A named bundle of another kind a phase reads before syncing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputDecl {
    pub name: String,
    pub kind: ResourceKind,
    #[serde(default)]
    pub cardinality: Cardinality,
    #[serde(default)]
    pub scope: InputScope,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Read from this cluster instead of the owner's.
    #[serde(default)]
    pub cluster: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KindConfig {
    pub kind: ResourceKind,
    #[serde(default = "default_true")]
    pub namespaced: bool,
    /// Event types considered for this kind; absent means all.
    #[serde(default)]
    pub events: Option<Vec<EventType>>,
    /// Only objects carrying these labels are considered.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    #[serde(default)]
    pub mesh: Option<String>,
    #[serde(default)]
    pub metrics: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperatorConfig {
    #[serde(default = "OperatorConfig::default_work_interval")]
    pub work_interval_secs: u64,
    /// Restrict watches to one namespace.
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub leader_election: bool,
    #[serde(default = "OperatorConfig::default_lease_namespace")]
    pub lease_namespace: String,
    #[serde(default = "OperatorConfig::default_concurrency")]
    pub max_concurrent_reconciles: usize,
    /// Work-queue retries before a request or event is dropped.
    #[serde(default = "OperatorConfig::default_max_retries")]
    pub max_retries: u32,
    /// Conflict retries inside a single ensure.
    #[serde(default = "OperatorConfig::default_conflict_retries")]
    pub conflict_retries: u32,
    #[serde(default)]
    pub provider: ProviderConfig,
}

impl OperatorConfig {
    fn default_work_interval() -> u64 {
        30
    }
    fn default_lease_namespace() -> String {
        "default".to_string()
    }
    fn default_concurrency() -> usize {
        4
    }
    fn default_max_retries() -> u32 {
        15
    }
    fn default_conflict_retries() -> u32 {
        5
    }
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            work_interval_secs: Self::default_work_interval(),
            namespace: None,
            leader_election: false,
            lease_namespace: Self::default_lease_namespace(),
            max_concurrent_reconciles: Self::default_concurrency(),
            max_retries: Self::default_max_retries(),
            conflict_retries: Self::default_conflict_retries(),
            provider: ProviderConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterConfig {
    pub name: String,
    /// kubeconfig context; absent means the default context.
    #[serde(default)]
    pub context: Option<String>,
}

impl ProjectConfig {
    /// Parse and validate, without environment overrides.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let cfg: ProjectConfig = serde_yaml::from_str(yaml)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read, apply `TIDAL_*` overrides, validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;
        let cfg: ProjectConfig = serde_yaml::from_str(&text)?;
        let cfg = cfg.with_env_overrides();
        cfg.validate()?;
        info!(kind = %cfg.kind, phases = cfg.phases.len(), path = %path.display(), "project descriptor loaded");
        Ok(cfg)
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = std::env::var("TIDAL_WORK_INTERVAL_SECS").ok().and_then(|s| s.parse().ok()) {
            self.operator.work_interval_secs = v;
        }
        if let Ok(ns) = std::env::var("TIDAL_NAMESPACE") {
            self.operator.namespace = if ns.is_empty() { None } else { Some(ns) };
        }
        if let Some(v) = std::env::var("TIDAL_MAX_CONCURRENT_RECONCILES").ok().and_then(|s| s.parse().ok()) {
            self.operator.max_concurrent_reconciles = v;
        }
        if let Ok(v) = std::env::var("TIDAL_LEADER_ELECTION") {
            self.operator.leader_election = v == "1" || v.eq_ignore_ascii_case("true");
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if self.phases.is_empty() {
            return invalid("no phases declared".into());
        }
        let mut names = BTreeSet::new();
        for p in &self.phases {
            if p.name.is_empty() {
                return invalid("phase with empty name".into());
            }
            if !names.insert(p.name.as_str()) {
                return invalid(format!("duplicate phase {}", p.name));
            }
            let mut inputs = BTreeSet::new();
            for i in &p.inputs {
                if !inputs.insert(i.name.as_str()) {
                    return invalid(format!("phase {}: duplicate input {}", p.name, i.name));
                }
                if !self.knows_kind(&i.kind) {
                    return invalid(format!("phase {}: input kind {} not in kind table", p.name, i.kind));
                }
            }
            for o in &p.outputs {
                if !self.knows_kind(o) {
                    return invalid(format!("phase {}: output kind {} not in kind table", p.name, o));
                }
            }
        }
        match self.phases.iter().filter(|p| p.initial).count() {
            1 => {}
            0 => return invalid("no initial phase".into()),
            n => return invalid(format!("{} initial phases, expected exactly one", n)),
        }
        if self.operator.work_interval_secs == 0 {
            return invalid("operator.work_interval_secs must be > 0".into());
        }
        if self.operator.max_concurrent_reconciles == 0 {
            return invalid("operator.max_concurrent_reconciles must be > 0".into());
        }
        let mut clusters = BTreeSet::new();
        for c in &self.clusters {
            if !clusters.insert(c.name.as_str()) {
                return invalid(format!("duplicate cluster {}", c.name));
            }
        }
        for p in &self.phases {
            for i in &p.inputs {
                if let Some(c) = &i.cluster {
                    if !clusters.contains(c.as_str()) {
                        return invalid(format!("phase {}: input {} names unknown cluster {}", p.name, i.name, c));
                    }
                }
            }
        }
        Ok(())
    }

    fn knows_kind(&self, kind: &ResourceKind) -> bool {
        *kind == self.kind || self.kinds.iter().any(|k| k.kind == *kind)
    }

    pub fn finalizer_name(&self) -> String {
        match &self.finalizer {
            Some(f) => f.clone(),
            None if self.kind.group.is_empty() => "tidal.dev/finalizer".to_string(),
            None => format!("{}/finalizer", self.kind.group),
        }
    }

    pub fn initial_phase(&self) -> Option<&PhaseConfig> {
        self.phases.iter().find(|p| p.initial)
    }

    pub fn phase(&self, name: &str) -> Option<&PhaseConfig> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn kind_config(&self, kind: &ResourceKind) -> Option<&KindConfig> {
        self.kinds.iter().find(|k| k.kind == *kind)
    }

    pub fn work_interval(&self) -> Duration {
        Duration::from_secs(self.operator.work_interval_secs)
    }

    /// Every kind read by some phase, deduplicated.
    pub fn input_kinds(&self) -> Vec<ResourceKind> {
        let set: BTreeSet<_> = self.phases.iter().flat_map(|p| p.inputs.iter().map(|i| i.kind.clone())).collect();
        set.into_iter().collect()
    }

    /// Every kind produced by some phase, deduplicated.
    pub fn output_kinds(&self) -> Vec<ResourceKind> {
        let set: BTreeSet<_> = self.phases.iter().flat_map(|p| p.outputs.iter().cloned()).collect();
        set.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROJECT: &str = r#"
kind: tidal.dev/v1/Canary
phases:
  - name: Initializing
    initial: true
    outputs: [v1/ConfigMap]
  - name: Progressing
    inputs:
      - name: metrics
        kind: v1/Secret
        cardinality: one
        labels: { app: web }
  - name: Promoted
    terminal: true
kinds:
  - kind: v1/ConfigMap
  - kind: v1/Secret
    events: [create, update]
operator:
  work_interval_secs: 10
"#;

    #[test]
    fn parses_phase_and_kind_tables() {
        let cfg = ProjectConfig::from_yaml_str(PROJECT).unwrap();
        assert_eq!(cfg.initial_phase().map(|p| p.name.as_str()), Some("Initializing"));
        assert!(cfg.phase("Promoted").unwrap().terminal);
        let input = &cfg.phase("Progressing").unwrap().inputs[0];
        assert_eq!(input.cardinality, Cardinality::One);
        assert_eq!(input.scope, InputScope::SameNamespace);
        assert_eq!(cfg.work_interval(), Duration::from_secs(10));
        assert_eq!(cfg.operator.max_concurrent_reconciles, 4);
        assert_eq!(cfg.finalizer_name(), "tidal.dev/finalizer");
        assert_eq!(cfg.input_kinds(), vec!["v1/Secret".parse().unwrap()]);
        assert_eq!(cfg.output_kinds(), vec!["v1/ConfigMap".parse().unwrap()]);
        let secret = cfg.kind_config(&"v1/Secret".parse().unwrap()).unwrap();
        assert_eq!(secret.events.as_deref(), Some(&[EventType::Create, EventType::Update][..]));
    }

    #[test]
    fn rejects_missing_or_duplicate_initial_phase() {
        let none = PROJECT.replace("initial: true", "initial: false");
        let e = ProjectConfig::from_yaml_str(&none).unwrap_err().to_string();
        assert!(e.contains("no initial phase"), "e={}", e);

        let two = PROJECT.replace("terminal: true", "terminal: true\n    initial: true");
        let e = ProjectConfig::from_yaml_str(&two).unwrap_err().to_string();
        assert!(e.contains("2 initial phases"), "e={}", e);
    }

    #[test]
    fn rejects_unknown_kinds_and_event_tags() {
        let unknown = PROJECT.replace("outputs: [v1/ConfigMap]", "outputs: [v1/Service]");
        let e = ProjectConfig::from_yaml_str(&unknown).unwrap_err().to_string();
        assert!(e.contains("v1/Service"), "e={}", e);

        let tag = PROJECT.replace("events: [create, update]", "events: [create, resync]");
        assert!(matches!(ProjectConfig::from_yaml_str(&tag), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn rejects_zero_interval() {
        let zero = PROJECT.replace("work_interval_secs: 10", "work_interval_secs: 0");
        assert!(ProjectConfig::from_yaml_str(&zero).is_err());
    }
}
