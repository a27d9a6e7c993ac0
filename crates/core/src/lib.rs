//! Tollgate core types: GVKs, source keys, mirrored objects and the collaborator
//! traits the cache manager drives (data store, watch registrar, reader, readiness).

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub mod process;

pub use process::{Excluder, MatchEntry, Process};

/// Group/Version/Kind of a Kubernetes resource type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    /// Build from an `apiVersion` string (`v1` or `group/v1`) and a kind.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((group, version)) => Self::new(group, version, kind),
            None => Self::new("", api_version, kind),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    /// Core `v1/Namespace` objects are excluded by their own name rather than `metadata.namespace`.
    pub fn is_namespace(&self) -> bool {
        self.group.is_empty() && self.version == "v1" && self.kind == "Namespace"
    }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.kind)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

impl FromStr for Gvk {
    type Err = ObjectError;

    /// Parse `v1/Kind` or `group/v1/Kind`.
    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new("", *version, *kind)),
            [group, version, kind] if !group.is_empty() && !version.is_empty() && !kind.is_empty() => {
                Ok(Self::new(*group, *version, *kind))
            }
            _ => Err(ObjectError::InvalidGvk(key.to_string())),
        }
    }
}

/// Identifies one independent requester of a GVK set (a constraint, a config, an audit run).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceKey {
    pub source_type: String,
    pub source_id: String,
}

impl SourceKey {
    pub fn new(source_type: impl Into<String>, source_id: impl Into<String>) -> Self {
        Self { source_type: source_type.into(), source_id: source_id.into() }
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source_type, self.source_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObjectError {
    #[error("object missing {0}")]
    MissingField(&'static str),
    #[error("object field {0} is not a string")]
    NotAString(&'static str),
    #[error("invalid gvk: {0} (expect v1/Kind or group/v1/Kind)")]
    InvalidGvk(String),
}

/// Identity of a mirrored object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub gvk: Gvk,
    pub namespace: Option<String>,
    pub name: String,
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.gvk, ns, self.name),
            None => write!(f, "{} {}", self.gvk, self.name),
        }
    }
}

/// A cluster object carried as raw JSON plus its GVK. Metadata is read lazily.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    gvk: Gvk,
    raw: serde_json::Value,
}

impl Object {
    pub fn new(gvk: Gvk, raw: serde_json::Value) -> Self {
        Self { gvk, raw }
    }

    /// Parse the GVK from `apiVersion`/`kind` of a raw object.
    pub fn from_raw(mut raw: serde_json::Value) -> Result<Self, ObjectError> {
        let api_version = top_str(&raw, "apiVersion")?.ok_or(ObjectError::MissingField("apiVersion"))?;
        let kind = top_str(&raw, "kind")?.ok_or(ObjectError::MissingField("kind"))?;
        let gvk = Gvk::from_api_version(api_version, kind);
        if cfg!(feature = "strip-managed-fields") {
            strip_managed_fields(&mut raw);
        }
        Ok(Self { gvk, raw })
    }

    pub fn gvk(&self) -> &Gvk { &self.gvk }
    pub fn raw(&self) -> &serde_json::Value { &self.raw }
    pub fn into_raw(self) -> serde_json::Value { self.raw }

    pub fn name(&self) -> Result<&str, ObjectError> {
        self.meta_str("name")?.ok_or(ObjectError::MissingField("metadata.name"))
    }

    /// `None` for cluster-scoped objects.
    pub fn namespace(&self) -> Result<Option<&str>, ObjectError> {
        Ok(self.meta_str("namespace")?.filter(|ns| !ns.is_empty()))
    }

    pub fn key(&self) -> Result<ObjectKey, ObjectError> {
        Ok(ObjectKey {
            gvk: self.gvk.clone(),
            namespace: self.namespace()?.map(str::to_string),
            name: self.name()?.to_string(),
        })
    }

    fn meta_str(&self, field: &'static str) -> Result<Option<&str>, ObjectError> {
        let Some(meta) = self.raw.get("metadata") else { return Ok(None) };
        match meta.get(field) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::String(s)) => Ok(Some(s.as_str())),
            Some(_) => Err(ObjectError::NotAString(field)),
        }
    }
}

/// A change delivered by a running watch.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Upsert(Object),
    Delete(Object),
}

impl WatchEvent {
    pub fn object(&self) -> &Object {
        match self {
            WatchEvent::Upsert(o) | WatchEvent::Delete(o) => o,
        }
    }
}

fn top_str<'a>(raw: &'a serde_json::Value, field: &'static str) -> Result<Option<&'a str>, ObjectError> {
    match raw.get(field) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(ObjectError::NotAString(field)),
    }
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(obj) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        obj.remove("managedFields");
    }
}

// ---- collaborator seams ----

/// Backing store the mirrored objects are written into (the policy engine's data cache).
#[async_trait::async_trait]
pub trait DataStore: Send + Sync {
    /// Idempotent upsert by object identity.
    async fn add_data(&self, obj: &Object) -> anyhow::Result<()>;
    /// Idempotent delete; no-op if absent.
    async fn remove_data(&self, obj: &Object) -> anyhow::Result<()>;
    /// Remove all mirrored data unconditionally.
    async fn wipe_data(&self) -> anyhow::Result<()>;
}

/// Dynamic watch registration for a set of kinds.
#[async_trait::async_trait]
pub trait WatchRegistrar: Send + Sync {
    /// Establish exactly this watch set, dropping any kind not listed.
    async fn replace_watch(&self, gvks: &[Gvk]) -> anyhow::Result<()>;
}

/// Lists live objects of a kind.
#[async_trait::async_trait]
pub trait Reader: Send + Sync {
    async fn list(&self, gvk: &Gvk) -> anyhow::Result<Vec<Object>>;
}

/// Expected-vs-observed bookkeeping for one GVK.
pub trait Expectations: Send + Sync {
    fn expect(&self, key: &ObjectKey);
    fn observe(&self, key: &ObjectKey);
    fn cancel_expect(&self, key: &ObjectKey);
    fn expectations_done(&self);
    fn satisfied(&self) -> bool;
}

pub trait ReadinessTracker: Send + Sync {
    fn for_data(&self, gvk: &Gvk) -> Arc<dyn Expectations>;
    /// Drop all expectations for a GVK.
    fn cancel_data(&self, gvk: &Gvk);
}

pub mod prelude {
    pub use super::{
        DataStore, Excluder, Expectations, Gvk, Object, ObjectError, ObjectKey, Process, ReadinessTracker, Reader,
        SourceKey, WatchEvent, WatchRegistrar,
    };
}
