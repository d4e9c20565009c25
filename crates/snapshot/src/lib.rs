//! Stagehand snapshot: load a captured set of objects into a cluster in
//! owner-first order, rewriting owner references to the uids the target assigns.

#![forbid(unsafe_code)]

use kube::Client;
use stagehand_kubehub::{DiscoveryResolver, KubeWriter};
use tokio_util::sync::CancellationToken;

mod decode;
mod loader;

pub use decode::DecodeError;
pub use loader::{LoadError, LoadReport, Loader, Skipped};

/// Resource types loaded when none are requested.
pub const DEFAULT_RESOURCES: &[&str] = &[
    "namespace",
    "node",
    "serviceaccount",
    "configmap",
    "secret",
    "limitrange",
    "runtimeclass.node.k8s.io",
    "priorityclass.scheduling.k8s.io",
    "clusterrolebinding.rbac.authorization.k8s.io",
    "clusterrole.rbac.authorization.k8s.io",
    "rolebinding.rbac.authorization.k8s.io",
    "role.rbac.authorization.k8s.io",
    "daemonset.apps",
    "deployment.apps",
    "replicaset.apps",
    "statefulset.apps",
    "cronjob.batch",
    "job.batch",
    "persistentvolumeclaim",
    "persistentvolume",
    "pod",
    "service",
    "endpoints",
];

/// Discover the cluster behind `client` and load `input` into it.
pub async fn load_into_cluster<S: AsRef<str>>(
    client: Client,
    input: &str,
    resources: &[S],
    cancel: &CancellationToken,
) -> Result<LoadReport, LoadError> {
    let resolver = DiscoveryResolver::new(client.clone()).await.map_err(LoadError::Discovery)?;
    let loader = Loader::new(KubeWriter::new(client), resolver, resources).await?;
    loader.load(input, cancel).await
}
