//! Stagehand core types: object identities, kind descriptors and the seams
//! between the cache/loader and the cluster transport.

#![forbid(unsafe_code)]

use std::fmt;

use futures::stream::BoxStream;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod prelude {
    pub use super::{
        FeedEvent, GroupKind, KindResolver, ListWatch, ObjectKey, OwnerKeys, ResolvedKind, WriteClient,
        WriteError,
    };
}

/// Split an `apiVersion` into `(group, version)`. The core group is empty.
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

/// Matching identity of an object as recorded in its own manifest.
///
/// The uid is the one from the system the object was captured in; it is only
/// ever used as a lookup key, never submitted to another cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
}

/// Keys of the owners an object still waits on. Most objects have one.
pub type OwnerKeys = SmallVec<[ObjectKey; 2]>;

impl ObjectKey {
    pub fn from_owner_ref(owner: &OwnerReference) -> Self {
        Self {
            api_version: owner.api_version.clone(),
            kind: owner.kind.clone(),
            name: owner.name.clone(),
            uid: owner.uid.clone(),
        }
    }

    pub fn from_object(obj: &DynamicObject) -> Self {
        let (api_version, kind) = match obj.types.as_ref() {
            Some(t) => (t.api_version.clone(), t.kind.clone()),
            None => (String::new(), String::new()),
        };
        Self {
            api_version,
            kind,
            name: obj.metadata.name.clone().unwrap_or_default(),
            uid: obj.metadata.uid.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({})", self.kind, self.name, self.uid)
    }
}

/// Group and kind, ignoring version. Used to decide whether an object is wanted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupKind {
    pub group: String,
    pub kind: String,
}

impl GroupKind {
    pub fn new(group: &str, kind: &str) -> Self {
        Self { group: group.to_string(), kind: kind.to_string() }
    }

    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        let (group, _) = split_api_version(api_version);
        Self::new(group, kind)
    }

    pub fn of(obj: &DynamicObject) -> Option<Self> {
        obj.types.as_ref().map(|t| Self::from_api_version(&t.api_version, &t.kind))
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}.{}", self.kind, self.group)
        }
    }
}

/// A served kind together with the REST endpoint it maps to.
#[derive(Debug, Clone)]
pub struct ResolvedKind {
    pub resource: ApiResource,
    pub namespaced: bool,
}

impl ResolvedKind {
    pub fn group_kind(&self) -> GroupKind {
        GroupKind::new(&self.resource.group, &self.resource.kind)
    }

    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.resource.group, &self.resource.version, &self.resource.kind)
    }
}

/// `namespace/name` for namespaced objects, `name` otherwise.
pub fn display_name(obj: &DynamicObject) -> String {
    let name = obj.metadata.name.as_deref().unwrap_or("");
    match obj.metadata.namespace.as_deref() {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, name),
        _ => name.to_string(),
    }
}

/// `Kind` of a dynamic object, empty when the manifest carried no type meta.
pub fn kind_of(obj: &DynamicObject) -> &str {
    obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or("")
}

/// One change observed on a watched collection.
#[derive(Debug, Clone)]
pub enum FeedEvent<T> {
    Applied(T),
    Deleted(T),
    /// The collection was listed again; these items replace everything held.
    Restarted(Vec<T>),
}

/// Continuous list-then-watch of a remote collection.
pub trait ListWatch<T>: Send + Sync {
    /// Events starting with a full listing. Failures are yielded as items and
    /// the stream keeps retrying on its own; it only ends when the source does.
    fn watch(&self) -> BoxStream<'static, anyhow::Result<FeedEvent<T>>>;
}

/// Failure classes of a cluster write that the loader reacts to differently.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Create/update access to the target cluster.
#[async_trait::async_trait]
pub trait WriteClient: Send + Sync {
    async fn create(&self, kind: &ResolvedKind, obj: &DynamicObject) -> Result<DynamicObject, WriteError>;
    async fn update(&self, kind: &ResolvedKind, obj: &DynamicObject) -> Result<DynamicObject, WriteError>;
}

/// Maps resource type names and object kinds onto served endpoints.
#[async_trait::async_trait]
pub trait KindResolver: Send + Sync {
    /// Resolve a user supplied name such as `pods`, `Deployment` or `deployments.apps`.
    async fn resolve_name(&self, resource: &str) -> anyhow::Result<ResolvedKind>;

    /// Resolve the endpoint serving exactly this group/version/kind.
    async fn resolve_gvk(&self, gvk: &GroupVersionKind) -> anyhow::Result<ResolvedKind>;
}
