//! Versioned resource object: identity metadata plus free-form body.

use std::collections::BTreeMap;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};
use serde_json::{Map, Value as Json};
use smallvec::SmallVec;

use crate::{ObjectKey, ResourceKind, StoreError};

/// One object as stored: `kind`, standard metadata and every other top-level
/// field (`spec`, `status`, `data`, ...) in `data`.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub kind: ResourceKind,
    pub metadata: ObjectMeta,
    pub data: Json,
}

impl Resource {
    pub fn new(kind: ResourceKind, namespace: Option<&str>, name: &str) -> Self {
        Self {
            kind,
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: namespace.map(|s| s.to_string()),
                ..Default::default()
            },
            data: Json::Object(Map::new()),
        }
    }

    pub fn with_spec(mut self, spec: Json) -> Self {
        self.set_field("spec", spec);
        self
    }

    pub fn with_labels<I, K, V>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map = self.metadata.labels.get_or_insert_with(BTreeMap::new);
        for (k, v) in labels {
            map.insert(k.into(), v.into());
        }
        self
    }

    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("")
    }

    pub fn namespace(&self) -> Option<&str> {
        self.metadata.namespace.as_deref()
    }

    pub fn uid(&self) -> Option<&str> {
        self.metadata.uid.as_deref()
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.kind.clone(), self.namespace(), self.name())
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.metadata.resource_version.as_deref().filter(|rv| !rv.is_empty())
    }

    pub fn set_resource_version(&mut self, rv: Option<&str>) {
        self.metadata.resource_version = rv.map(|s| s.to_string());
    }

    pub fn generation(&self) -> Option<i64> {
        self.metadata.generation
    }

    pub fn field(&self, name: &str) -> Option<&Json> {
        self.data.get(name)
    }

    pub fn set_field(&mut self, name: &str, value: Json) {
        if !self.data.is_object() {
            self.data = Json::Object(Map::new());
        }
        if let Some(obj) = self.data.as_object_mut() {
            obj.insert(name.to_string(), value);
        }
    }

    pub fn spec(&self) -> Option<&Json> {
        self.field("spec")
    }

    pub fn status(&self) -> Option<&Json> {
        self.field("status").filter(|s| !s.is_null())
    }

    pub fn set_status(&mut self, status: Json) {
        self.set_field("status", status);
    }

    /// Body without `status`; what a plain update is allowed to change.
    pub fn body_without_status(&self) -> Json {
        let mut body = self.data.clone();
        if let Some(obj) = body.as_object_mut() {
            obj.remove("status");
        }
        body
    }

    /// `status.phase`, with an empty string treated as unset.
    pub fn phase(&self) -> Option<&str> {
        self.status()
            .and_then(|s| s.get("phase"))
            .and_then(|p| p.as_str())
            .filter(|p| !p.is_empty())
    }

    pub fn set_phase(&mut self, phase: &str) {
        self.set_status_field("phase", Json::String(phase.to_string()));
    }

    pub fn set_status_field(&mut self, key: &str, value: Json) {
        let mut status = match self.status() {
            Some(Json::Object(m)) => m.clone(),
            _ => Map::new(),
        };
        status.insert(key.to_string(), value);
        self.set_status(Json::Object(status));
    }

    /// Shallow-merge `patch` into `status`; a null value removes the key.
    pub fn merge_status(&mut self, patch: &Map<String, Json>) {
        let mut status = match self.status() {
            Some(Json::Object(m)) => m.clone(),
            _ => Map::new(),
        };
        for (k, v) in patch {
            if v.is_null() {
                status.remove(k);
            } else {
                status.insert(k.clone(), v.clone());
            }
        }
        self.set_status(Json::Object(status));
    }

    pub fn finalizers(&self) -> &[String] {
        self.metadata.finalizers.as_deref().unwrap_or(&[])
    }

    pub fn has_finalizer(&self, name: &str) -> bool {
        self.finalizers().iter().any(|f| f == name)
    }

    /// Returns true when the finalizer was not present before.
    pub fn add_finalizer(&mut self, name: &str) -> bool {
        if self.has_finalizer(name) {
            return false;
        }
        self.metadata.finalizers.get_or_insert_with(Vec::new).push(name.to_string());
        true
    }

    /// Returns true when the finalizer was present.
    pub fn remove_finalizer(&mut self, name: &str) -> bool {
        let Some(list) = self.metadata.finalizers.as_mut() else { return false };
        let before = list.len();
        list.retain(|f| f != name);
        before != list.len()
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn mark_deleting(&mut self) {
        if self.metadata.deletion_timestamp.is_none() {
            self.metadata.deletion_timestamp = Some(Time(Utc::now()));
        }
    }

    pub fn labels(&self) -> Option<&BTreeMap<String, String>> {
        self.metadata.labels.as_ref()
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels().and_then(|l| l.get(key)).map(|s| s.as_str())
    }

    /// Every `selector` pair must be present with an equal value.
    pub fn matches_labels(&self, selector: &BTreeMap<String, String>) -> bool {
        selector.iter().all(|(k, v)| self.label(k) == Some(v.as_str()))
    }

    /// Record `parent` as the controlling owner of this object.
    pub fn set_owner(&mut self, parent: &Resource) {
        let reference = OwnerReference {
            api_version: parent.kind.api_version(),
            kind: parent.kind.kind.clone(),
            name: parent.name().to_string(),
            uid: parent.uid().unwrap_or_default().to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        };
        let refs = self.metadata.owner_references.get_or_insert_with(Vec::new);
        refs.retain(|r| {
            let same = r.api_version == reference.api_version && r.kind == reference.kind && r.name == reference.name;
            !same && r.controller != Some(true)
        });
        refs.push(reference);
    }

    pub fn owner_references(&self) -> &[OwnerReference] {
        self.metadata.owner_references.as_deref().unwrap_or(&[])
    }

    /// Keys of owners of type `kind`; owners share this object's namespace.
    pub fn owner_keys(&self, kind: &ResourceKind) -> SmallVec<[ObjectKey; 1]> {
        let api_version = kind.api_version();
        self.owner_references()
            .iter()
            .filter(|r| r.kind == kind.kind && r.api_version == api_version)
            .map(|r| ObjectKey::new(kind.clone(), self.namespace(), &r.name))
            .collect()
    }

    /// Kubernetes wire form (`apiVersion`, `kind`, `metadata`, body fields).
    pub fn to_json(&self) -> Result<Json, StoreError> {
        let mut out = match &self.data {
            Json::Object(m) => m.clone(),
            Json::Null => Map::new(),
            _ => return Err(StoreError::Invalid(format!("{}: body is not an object", self.key()))),
        };
        out.insert("apiVersion".into(), Json::String(self.kind.api_version()));
        out.insert("kind".into(), Json::String(self.kind.kind.clone()));
        let meta = serde_json::to_value(&self.metadata).map_err(|e| StoreError::Internal(e.to_string()))?;
        out.insert("metadata".into(), meta);
        Ok(Json::Object(out))
    }

    pub fn from_json(value: Json) -> Result<Self, StoreError> {
        let Json::Object(mut map) = value else {
            return Err(StoreError::Invalid("object is not a JSON map".into()));
        };
        let api_version = map
            .remove("apiVersion")
            .and_then(|v| v.as_str().map(|s| s.to_string()))
            .ok_or_else(|| StoreError::Invalid("object missing apiVersion".into()))?;
        let kind = map
            .remove("kind")
            .and_then(|v| v.as_str().map(|s| s.to_string()))
            .ok_or_else(|| StoreError::Invalid("object missing kind".into()))?;
        let metadata: ObjectMeta = match map.remove("metadata") {
            Some(m) => serde_json::from_value(m).map_err(|e| StoreError::Invalid(format!("metadata: {}", e)))?,
            None => ObjectMeta::default(),
        };
        Ok(Self { kind: ResourceKind::from_api_version(&api_version, &kind), metadata, data: Json::Object(map) })
    }
}
