//! Stagehand store: a local mirror of a watched collection and a getter that
//! derives a value from it, recomputed only when the collection version moves.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use arc_swap::ArcSwap;
use kube::{Resource, ResourceExt};
use rustc_hash::FxHashMap;
use stagehand_core::FeedEvent;

mod getter;

pub use getter::DynamicGetter;

/// Version token of a mirror.
///
/// `generation` advances by one on every change the feed delivers and is what
/// the getter compares. `resource_version` is the newest server version seen,
/// kept for display.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedVersion {
    pub generation: u64,
    pub resource_version: String,
}

impl fmt::Display for FeedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (generation {})", self.resource_version, self.generation)
    }
}

/// Newer of two apiserver resource versions. They are decimal strings in
/// practice; a longer string is a larger number.
fn newer_version(a: String, b: String) -> String {
    if (b.len(), &b) > (a.len(), &a) {
        b
    } else {
        a
    }
}

/// Store key: `namespace/name` or `name` for cluster scoped objects.
fn store_key<T: Resource>(obj: &T) -> String {
    match obj.namespace() {
        Some(ns) => format!("{}/{}", ns, obj.name_any()),
        None => obj.name_any(),
    }
}

/// Local copy of a remote collection tagged with its version.
///
/// Items and version are updated by the feed only; readers take a snapshot.
/// The version is published after the items it covers, so a reader that saw
/// version `v` and then snapshots gets a state at least as new as `v`.
pub(crate) struct Mirror<T> {
    items: RwLock<FxHashMap<String, T>>,
    version: ArcSwap<FeedVersion>,
}

impl<T: Resource + Clone> Mirror<T> {
    pub(crate) fn new() -> Self {
        Self { items: RwLock::new(FxHashMap::default()), version: ArcSwap::from_pointee(FeedVersion::default()) }
    }

    pub(crate) fn version(&self) -> Arc<FeedVersion> {
        self.version.load_full()
    }

    /// Apply one feed event. A single writer is assumed.
    pub(crate) fn apply(&self, event: FeedEvent<T>) {
        let seen = {
            let mut map = self.items.write().unwrap_or_else(PoisonError::into_inner);
            match event {
                FeedEvent::Applied(obj) => {
                    let rv = obj.resource_version();
                    map.insert(store_key(&obj), obj);
                    rv
                }
                FeedEvent::Deleted(obj) => {
                    let rv = obj.resource_version();
                    map.remove(&store_key(&obj));
                    rv
                }
                FeedEvent::Restarted(items) => {
                    map.clear();
                    let mut newest = None;
                    for obj in items {
                        newest = match (newest, obj.resource_version()) {
                            (Some(a), Some(b)) => Some(newer_version(a, b)),
                            (a, b) => a.or(b),
                        };
                        map.insert(store_key(&obj), obj);
                    }
                    newest
                }
            }
        };
        let prev = self.version.load();
        let resource_version = match seen {
            Some(rv) => newer_version(prev.resource_version.clone(), rv),
            None => prev.resource_version.clone(),
        };
        self.version.store(Arc::new(FeedVersion { generation: prev.generation + 1, resource_version }));
    }

    /// All items, ordered by store key.
    pub(crate) fn snapshot(&self) -> Vec<T> {
        let map = self.items.read().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<(&String, &T)> = map.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter().map(|(_, obj)| obj.clone()).collect()
    }
}
