//! Dynamic create/update against the target cluster.

use anyhow::anyhow;
use kube::{
    api::{Api, DynamicObject, PostParams},
    Client,
};
use metrics::counter;
use stagehand_core::{ResolvedKind, WriteClient, WriteError};

/// Field manager recorded on every object this writer submits.
pub const FIELD_MANAGER: &str = "stagehand";

pub struct KubeWriter {
    client: Client,
    params: PostParams,
}

impl KubeWriter {
    pub fn new(client: Client) -> Self {
        let params = PostParams { field_manager: Some(FIELD_MANAGER.to_string()), ..Default::default() };
        Self { client, params }
    }

    fn api_for(&self, kind: &ResolvedKind, obj: &DynamicObject) -> Api<DynamicObject> {
        if !kind.namespaced {
            return Api::all_with(self.client.clone(), &kind.resource);
        }
        match obj.metadata.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => Api::namespaced_with(self.client.clone(), ns, &kind.resource),
            _ => Api::default_namespaced_with(self.client.clone(), &kind.resource),
        }
    }
}

#[async_trait::async_trait]
impl WriteClient for KubeWriter {
    async fn create(&self, kind: &ResolvedKind, obj: &DynamicObject) -> Result<DynamicObject, WriteError> {
        self.api_for(kind, obj).create(&self.params, obj).await.map_err(classify)
    }

    async fn update(&self, kind: &ResolvedKind, obj: &DynamicObject) -> Result<DynamicObject, WriteError> {
        let name = obj.metadata.name.as_deref().ok_or_else(|| WriteError::Other(anyhow!("object has no metadata.name")))?;
        self.api_for(kind, obj).replace(name, &self.params, obj).await.map_err(classify)
    }
}

/// Sort a kube error into the classes the loader distinguishes.
pub fn classify(err: kube::Error) -> WriteError {
    match err {
        kube::Error::Api(resp) if resp.reason == "AlreadyExists" => WriteError::AlreadyExists(resp.message),
        kube::Error::Api(resp) if resp.reason == "Conflict" => WriteError::Conflict(resp.message),
        other => {
            counter!("kube_write_errors", 1u64);
            WriteError::Other(anyhow::Error::new(other))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_err(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("{} happened", reason),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn classifies_already_exists_and_conflict() {
        assert!(matches!(classify(api_err(409, "AlreadyExists")), WriteError::AlreadyExists(m) if m == "AlreadyExists happened"));
        assert!(matches!(classify(api_err(409, "Conflict")), WriteError::Conflict(_)));
        assert!(matches!(classify(api_err(403, "Forbidden")), WriteError::Other(_)));
    }
}
