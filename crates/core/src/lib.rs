//! Tidal core types: resource identity, change events, work requests and the
//! object store boundary every other crate builds on.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod config;
pub mod registry;
mod resource;
mod store;

pub use resource::Resource;
pub use store::{CancelHandle, Client, ListParams, ObjectStore, StoreError, StoreResult, StreamHandle};

pub mod prelude {
    pub use super::{
        Client, Event, EventType, ListParams, ObjectKey, ObjectStore, Request, Resource, ResourceKind,
        StoreError, StoreResult, StreamHandle,
    };
}

/// Group/version/kind of a resource type, written `v1/Kind` or `group/v1/Kind`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl ResourceKind {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    /// Value of the `apiVersion` field for objects of this kind.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Inverse of [`ResourceKind::api_version`] plus a kind name.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((group, version)) => Self::new(group, version, kind),
            None => Self::new("", api_version, kind),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.gvk_key())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid kind key: {0} (expect v1/Kind or group/v1/Kind)")]
pub struct KindParseError(pub String);

impl FromStr for ResourceKind {
    type Err = KindParseError;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new("", *version, *kind)),
            [group, version, kind] if !group.is_empty() && !version.is_empty() && !kind.is_empty() => {
                Ok(Self::new(*group, *version, *kind))
            }
            _ => Err(KindParseError(key.to_string())),
        }
    }
}

impl TryFrom<String> for ResourceKind {
    type Error = KindParseError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ResourceKind> for String {
    fn from(value: ResourceKind) -> Self {
        value.gvk_key()
    }
}

/// Identity of one object: kind plus namespace (absent for cluster-scoped) and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub kind: ResourceKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: ResourceKind, namespace: Option<&str>, name: &str) -> Self {
        Self { kind, namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}:{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}:{}", self.kind, self.name),
        }
    }
}

/// "Re-run reconciliation for this object", optionally pinned to a cluster.
///
/// Requests are plain values; the work queue coalesces equal requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Request {
    pub cluster: Option<String>,
    pub key: ObjectKey,
}

impl Request {
    pub fn new(cluster: Option<&str>, key: ObjectKey) -> Self {
        Self { cluster: cluster.map(|s| s.to_string()), key }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cluster {
            Some(c) => write!(f, "{}|{}", c, self.key),
            None => write!(f, "{}", self.key),
        }
    }
}

/// Tag of an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Create,
    Update,
    Delete,
    Generic,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Create => "create",
            EventType::Update => "update",
            EventType::Delete => "delete",
            EventType::Generic => "generic",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event type: {0}")]
pub struct UnknownEventType(pub String);

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(EventType::Create),
            "update" => Ok(EventType::Update),
            "delete" => Ok(EventType::Delete),
            "generic" => Ok(EventType::Generic),
            _ => Err(UnknownEventType(s.to_string())),
        }
    }
}

/// One change notification from the object store.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Create { object: Resource },
    Update { old: Resource, new: Resource },
    Delete { object: Resource },
    Generic { object: Resource },
}

impl Event {
    pub fn event_type(&self) -> EventType {
        match self {
            Event::Create { .. } => EventType::Create,
            Event::Update { .. } => EventType::Update,
            Event::Delete { .. } => EventType::Delete,
            Event::Generic { .. } => EventType::Generic,
        }
    }

    /// Latest snapshot carried by the event (`new` for updates).
    pub fn object(&self) -> &Resource {
        match self {
            Event::Create { object } | Event::Delete { object } | Event::Generic { object } => object,
            Event::Update { new, .. } => new,
        }
    }

    pub fn kind(&self) -> &ResourceKind {
        &self.object().kind
    }
}
