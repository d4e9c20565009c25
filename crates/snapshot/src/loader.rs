//! Dependency-ordered replay of captured objects into a target cluster.
//!
//! Objects arrive in any order. An object whose owners have not been applied
//! yet waits in a pending queue keyed by each missing owner; once an owner is
//! applied its new uid is recorded and the objects waiting on it are
//! re-evaluated. Owner uids in the snapshot belong to the origin cluster and
//! are always rewritten through the resolved-identity map before submission.

use std::collections::VecDeque;

use kube::core::{DynamicObject, GroupVersionKind};
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use stagehand_core::{
    display_name, kind_of, split_api_version, GroupKind, KindResolver, ObjectKey, OwnerKeys, WriteClient, WriteError,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::decode::{DecodeError, Decoder};

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to get mapping for resource {resource:?}")]
    Filter {
        resource: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to decode objects")]
    Decode(#[from] DecodeError),
    #[error("discovering served resource types")]
    Discovery(#[source] anyhow::Error),
    /// Carries what was done before the load stopped.
    #[error("load cancelled after {} objects were applied", .0.applied())]
    Cancelled(Box<LoadReport>),
}

/// An object left out of the load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Skipped {
    pub kind: String,
    pub name: String,
}

impl Skipped {
    fn of(obj: &DynamicObject) -> Self {
        Self { kind: kind_of(obj).to_string(), name: display_name(obj) }
    }
}

/// Outcome of one load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
    pub created: usize,
    pub updated: usize,
    /// Not in the requested resource types.
    pub filtered: usize,
    /// Abandoned because an update raced with another writer.
    pub conflicts: usize,
    /// Abandoned because of any other error.
    pub failed: usize,
    /// Still waiting on owners when the stream ended.
    pub unresolved: Vec<Skipped>,
}

impl LoadReport {
    pub fn applied(&self) -> usize {
        self.created + self.updated
    }
}

struct Deferred {
    obj: DynamicObject,
    /// Owner keys not resolved yet.
    waiting_on: usize,
}

/// Objects waiting on owners. Each deferred object is stored once and
/// referenced from the key of every owner it is missing.
#[derive(Default)]
struct PendingQueue {
    by_owner: FxHashMap<ObjectKey, Vec<usize>>,
    deferred: Vec<Option<Deferred>>,
}

impl PendingQueue {
    fn defer(&mut self, obj: DynamicObject, missing: OwnerKeys) {
        let id = self.deferred.len();
        self.deferred.push(Some(Deferred { obj, waiting_on: missing.len() }));
        for key in missing {
            self.by_owner.entry(key).or_default().push(id);
        }
    }

    /// `owner` was applied: drop the entry under its key and return the
    /// objects that no longer wait on anything. Objects still missing other
    /// owners stay registered under those keys.
    fn resolve(&mut self, owner: &ObjectKey) -> Vec<DynamicObject> {
        let Some(ids) = self.by_owner.remove(owner) else { return Vec::new() };
        let mut ready = Vec::new();
        for id in ids {
            let Some(slot) = self.deferred.get_mut(id) else { continue };
            let now_ready = match slot.as_mut() {
                Some(d) => {
                    d.waiting_on = d.waiting_on.saturating_sub(1);
                    d.waiting_on == 0
                }
                None => false,
            };
            if now_ready {
                if let Some(d) = slot.take() {
                    ready.push(d.obj);
                }
            }
        }
        ready
    }

    /// Everything never released, in arrival order, each object once.
    fn into_unresolved(self) -> impl Iterator<Item = DynamicObject> {
        self.deferred.into_iter().flatten().map(|d| d.obj)
    }
}

/// Replays objects into a cluster. One loader serves one load.
pub struct Loader<W, R> {
    writer: W,
    resolver: R,
    filter: FxHashSet<GroupKind>,
    /// Origin identity -> uid assigned by the target cluster.
    exist: FxHashMap<ObjectKey, String>,
    pending: PendingQueue,
    report: LoadReport,
}

impl<W: WriteClient, R: KindResolver> Loader<W, R> {
    /// Build the filter set by resolving every requested resource type.
    pub async fn new<S: AsRef<str>>(writer: W, resolver: R, resources: &[S]) -> Result<Self, LoadError> {
        let mut filter = FxHashSet::default();
        for resource in resources {
            let resource = resource.as_ref();
            let kind = resolver
                .resolve_name(resource)
                .await
                .map_err(|source| LoadError::Filter { resource: resource.to_string(), source })?;
            debug!(resource, group_kind = %kind.group_kind(), "loading resource type");
            filter.insert(kind.group_kind());
        }
        Ok(Self {
            writer,
            resolver,
            filter,
            exist: FxHashMap::default(),
            pending: PendingQueue::default(),
            report: LoadReport::default(),
        })
    }

    /// Decode objects from `input` and apply them in owner order.
    ///
    /// Per-object failures are logged and counted; only decode errors and
    /// cancellation end the load early. Objects applied so far stay applied.
    /// The input is held in memory so decoding never blocks the runtime.
    pub async fn load(mut self, input: &str, cancel: &CancellationToken) -> Result<LoadReport, LoadError> {
        for next in Decoder::new(input.as_bytes()) {
            if cancel.is_cancelled() {
                info!("load cancelled; stopping at object boundary");
                return Err(LoadError::Cancelled(Box::new(self.finish())));
            }
            let obj = next?;
            if !self.permits(&obj) {
                info!(reason = "filtered", kind = %kind_of(&obj), name = %display_name(&obj), "skipped");
                counter!("snapshot_objects_filtered", 1u64);
                self.report.filtered += 1;
                continue;
            }
            self.load_object(obj).await;
        }

        Ok(self.finish())
    }

    /// Report what was done; whatever still waits on owners is unresolved.
    fn finish(self) -> LoadReport {
        let mut report = self.report;
        for obj in self.pending.into_unresolved() {
            info!(reason = "missing owner", kind = %kind_of(&obj), name = %display_name(&obj), "skipped");
            counter!("snapshot_objects_unresolved", 1u64);
            report.unresolved.push(Skipped::of(&obj));
        }
        info!(
            applied = report.applied(),
            created = report.created,
            updated = report.updated,
            filtered = report.filtered,
            conflicts = report.conflicts,
            failed = report.failed,
            unresolved = report.unresolved.len(),
            "snapshot load finished"
        );
        report
    }

    fn permits(&self, obj: &DynamicObject) -> bool {
        GroupKind::of(obj).is_some_and(|gk| self.filter.contains(&gk))
    }

    /// Owner keys of `obj` that have not been applied yet, without duplicates.
    fn missing_owners(&self, obj: &DynamicObject) -> OwnerKeys {
        let mut missing = OwnerKeys::new();
        for owner in obj.metadata.owner_references.iter().flatten() {
            let key = ObjectKey::from_owner_ref(owner);
            if !self.exist.contains_key(&key) && !missing.contains(&key) {
                missing.push(key);
            }
        }
        missing
    }

    async fn load_object(&mut self, obj: DynamicObject) {
        let missing = self.missing_owners(&obj);
        if !missing.is_empty() {
            debug!(kind = %kind_of(&obj), name = %display_name(&obj), owners = missing.len(), "waiting for owners");
            self.pending.defer(obj, missing);
            return;
        }

        let mut ready = VecDeque::from([obj]);
        while let Some(mut obj) = ready.pop_front() {
            // Identity as captured; must be taken before the uid is cleared.
            let key = ObjectKey::from_object(&obj);
            self.rewrite_owner_refs(&mut obj);
            let Some(uid) = self.apply(obj).await else { continue };
            self.exist.insert(key.clone(), uid);
            ready.extend(self.pending.resolve(&key));
        }
    }

    fn rewrite_owner_refs(&self, obj: &mut DynamicObject) {
        for owner in obj.metadata.owner_references.iter_mut().flatten() {
            if let Some(uid) = self.exist.get(&ObjectKey::from_owner_ref(owner)) {
                owner.uid = uid.clone();
            }
        }
    }

    /// Create, or update when it already exists. Returns the uid the target
    /// assigned, `None` when the object was abandoned.
    async fn apply(&mut self, mut obj: DynamicObject) -> Option<String> {
        let kind = kind_of(&obj).to_string();
        let name = display_name(&obj);
        let gvk = match obj.types.as_ref() {
            Some(t) => {
                let (group, version) = split_api_version(&t.api_version);
                GroupVersionKind::gvk(group, version, &t.kind)
            }
            None => GroupVersionKind::gvk("", "", ""),
        };
        let target = match self.resolver.resolve_gvk(&gvk).await {
            Ok(t) => t,
            Err(e) => {
                error!(kind = %kind, name = %name, error = %e, "failed to get resource");
                self.abandon_failed();
                return None;
            }
        };

        clear_server_fields(&mut obj);

        let applied = match self.writer.create(&target, &obj).await {
            Ok(created) => {
                info!(kind = %kind, name = %name, "created");
                counter!("snapshot_objects_created", 1u64);
                self.report.created += 1;
                created
            }
            Err(WriteError::AlreadyExists(_)) => match self.writer.update(&target, &obj).await {
                Ok(updated) => {
                    info!(kind = %kind, name = %name, "updated");
                    counter!("snapshot_objects_updated", 1u64);
                    self.report.updated += 1;
                    updated
                }
                Err(WriteError::Conflict(msg)) => {
                    warn!(kind = %kind, name = %name, reason = %msg, "conflict");
                    counter!("snapshot_objects_conflict", 1u64);
                    self.report.conflicts += 1;
                    return None;
                }
                Err(e) => {
                    error!(kind = %kind, name = %name, error = %e, "failed to update resource");
                    self.abandon_failed();
                    return None;
                }
            },
            Err(e) => {
                error!(kind = %kind, name = %name, error = %e, "failed to create resource");
                self.abandon_failed();
                return None;
            }
        };

        if applied.metadata.uid.is_none() {
            warn!(kind = %kind, name = %name, "applied object came back without a uid; dependents stay pending");
        }
        applied.metadata.uid
    }

    fn abandon_failed(&mut self) {
        counter!("snapshot_objects_failed", 1u64);
        self.report.failed += 1;
    }
}

/// Drop fields the target cluster assigns itself so the object is submitted
/// as a fresh creation.
fn clear_server_fields(obj: &mut DynamicObject) {
    let meta = &mut obj.metadata;
    meta.uid = None;
    meta.resource_version = None;
    meta.creation_timestamp = None;
    meta.managed_fields = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ManagedFieldsEntry, OwnerReference, Time};
    use kube::core::TypeMeta;

    fn obj(kind: &str, name: &str, uid: &str) -> DynamicObject {
        let mut o = DynamicObject {
            types: Some(TypeMeta { api_version: "v1".into(), kind: kind.into() }),
            metadata: Default::default(),
            data: serde_json::json!({}),
        };
        o.metadata.name = Some(name.into());
        o.metadata.uid = Some(uid.into());
        o
    }

    fn key(kind: &str, name: &str, uid: &str) -> ObjectKey {
        ObjectKey { api_version: "v1".into(), kind: kind.into(), name: name.into(), uid: uid.into() }
    }

    #[test]
    fn clear_server_fields_prunes_assigned_metadata() {
        let mut o = obj("ConfigMap", "x", "uid-1");
        o.metadata.resource_version = Some("123".into());
        o.metadata.creation_timestamp = Some(Time(Default::default()));
        o.metadata.managed_fields = Some(vec![ManagedFieldsEntry::default()]);
        o.metadata.owner_references = Some(vec![OwnerReference { name: "owner".into(), ..Default::default() }]);
        clear_server_fields(&mut o);
        assert!(o.metadata.uid.is_none());
        assert!(o.metadata.resource_version.is_none());
        assert!(o.metadata.creation_timestamp.is_none());
        assert!(o.metadata.managed_fields.is_none());
        assert_eq!(o.metadata.owner_references.map(|r| r.len()), Some(1));
    }

    #[test]
    fn pending_object_waits_for_every_owner() {
        let mut q = PendingQueue::default();
        let mut missing = OwnerKeys::new();
        missing.push(key("A", "a", "1"));
        missing.push(key("B", "b", "2"));
        q.defer(obj("Pod", "p", "3"), missing);

        assert!(q.resolve(&key("A", "a", "1")).is_empty());
        // Resolving the same owner twice does not release it early.
        assert!(q.resolve(&key("A", "a", "1")).is_empty());
        let ready = q.resolve(&key("B", "b", "2"));
        assert_eq!(ready.len(), 1);
        assert_eq!(q.into_unresolved().count(), 0);
    }

    #[test]
    fn unresolved_objects_are_listed_once() {
        let mut q = PendingQueue::default();
        let mut missing = OwnerKeys::new();
        missing.push(key("A", "a", "1"));
        missing.push(key("B", "b", "2"));
        q.defer(obj("Pod", "p", "3"), missing);
        let names: Vec<_> = q.into_unresolved().map(|o| display_name(&o)).collect();
        assert_eq!(names, vec!["p"]);
    }
}
