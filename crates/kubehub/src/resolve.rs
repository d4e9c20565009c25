//! Resource type resolution backed by API discovery.

use anyhow::{anyhow, Context, Result};
use kube::{
    core::GroupVersionKind,
    discovery::{Discovery, Scope},
    Client,
};
use stagehand_core::{KindResolver, ResolvedKind};
use tracing::debug;

/// A served resource as reported by discovery.
#[derive(Debug, Clone)]
pub struct DiscoveredKind {
    pub kind: ResolvedKind,
    /// Whether this is the preferred version of its group.
    pub preferred: bool,
}

/// Resource argument split the way kubectl reads it: `name[.version].group`.
#[derive(Debug, PartialEq, Eq)]
struct ResourceArg<'a> {
    name: &'a str,
    version: Option<&'a str>,
    group: Option<&'a str>,
}

fn looks_like_version(s: &str) -> bool {
    let mut chars = s.chars();
    chars.next() == Some('v') && chars.next().is_some_and(|c| c.is_ascii_digit())
}

fn parse_resource_arg(arg: &str) -> ResourceArg<'_> {
    match arg.split_once('.') {
        None => ResourceArg { name: arg, version: None, group: None },
        Some((name, rest)) => match rest.split_once('.') {
            Some((version, group)) if looks_like_version(version) => {
                ResourceArg { name, version: Some(version), group: Some(group) }
            }
            None if looks_like_version(rest) => ResourceArg { name, version: Some(rest), group: Some("") },
            _ => ResourceArg { name, version: None, group: Some(rest) },
        },
    }
}

/// Resolver over a discovery result taken once at construction.
#[derive(Debug, Clone)]
pub struct DiscoveryResolver {
    kinds: Vec<DiscoveredKind>,
}

impl DiscoveryResolver {
    /// Run discovery against the cluster and keep every served version.
    pub async fn new(client: Client) -> Result<Self> {
        let discovery = Discovery::new(client).run().await.context("running api discovery")?;
        let mut kinds = Vec::new();
        for group in discovery.groups() {
            let preferred = group.preferred_version_or_latest().to_string();
            for version in group.versions() {
                for (ar, caps) in group.versioned_resources(version) {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    kinds.push(DiscoveredKind {
                        kind: ResolvedKind { resource: ar, namespaced },
                        preferred: version == preferred,
                    });
                }
            }
        }
        debug!(kinds = kinds.len(), "api discovery complete");
        Ok(Self::from_kinds(kinds))
    }

    /// Build from an already known set of kinds.
    pub fn from_kinds(mut kinds: Vec<DiscoveredKind>) -> Self {
        // Core group wins name clashes (`events` vs `events.events.k8s.io`), like kubectl.
        kinds.sort_by(|a, b| {
            let (ra, rb) = (&a.kind.resource, &b.kind.resource);
            (!ra.group.is_empty(), &ra.group, !a.preferred, &ra.version)
                .cmp(&(!rb.group.is_empty(), &rb.group, !b.preferred, &rb.version))
        });
        Self { kinds }
    }

    /// Look up `pods`, `pod`, `Pod`, `deployments.apps` or `deployments.v1.apps`.
    pub fn find_by_name(&self, arg: &str) -> Option<&DiscoveredKind> {
        let arg = parse_resource_arg(arg);
        let matches = |d: &&DiscoveredKind| {
            let ar = &d.kind.resource;
            arg.group.map_or(true, |g| g == ar.group)
                && arg.version.map_or(true, |v| v == ar.version)
                && (ar.plural.eq_ignore_ascii_case(arg.name) || ar.kind.eq_ignore_ascii_case(arg.name))
        };
        self.kinds
            .iter()
            .filter(matches)
            .find(|d| d.preferred || arg.version.is_some())
            .or_else(|| self.kinds.iter().find(matches))
    }

    pub fn find_by_gvk(&self, gvk: &GroupVersionKind) -> Option<&DiscoveredKind> {
        self.kinds.iter().find(|d| {
            let ar = &d.kind.resource;
            ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind
        })
    }
}

#[async_trait::async_trait]
impl KindResolver for DiscoveryResolver {
    async fn resolve_name(&self, resource: &str) -> Result<ResolvedKind> {
        self.find_by_name(resource)
            .map(|d| d.kind.clone())
            .ok_or_else(|| anyhow!("the server doesn't have a resource type {:?}", resource))
    }

    async fn resolve_gvk(&self, gvk: &GroupVersionKind) -> Result<ResolvedKind> {
        self.find_by_gvk(gvk)
            .map(|d| d.kind.clone())
            .ok_or_else(|| anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ApiResource;

    fn kind(group: &str, version: &str, kind: &str, plural: &str, preferred: bool) -> DiscoveredKind {
        let api_version = if group.is_empty() { version.to_string() } else { format!("{}/{}", group, version) };
        DiscoveredKind {
            kind: ResolvedKind {
                resource: ApiResource {
                    group: group.into(),
                    version: version.into(),
                    api_version,
                    kind: kind.into(),
                    plural: plural.into(),
                },
                namespaced: true,
            },
            preferred,
        }
    }

    fn resolver() -> DiscoveryResolver {
        DiscoveryResolver::from_kinds(vec![
            kind("events.k8s.io", "v1", "Event", "events", true),
            kind("apps", "v1", "Deployment", "deployments", true),
            kind("", "v1", "Pod", "pods", true),
            kind("", "v1", "Event", "events", true),
            kind("autoscaling", "v1", "HorizontalPodAutoscaler", "horizontalpodautoscalers", false),
            kind("autoscaling", "v2", "HorizontalPodAutoscaler", "horizontalpodautoscalers", true),
        ])
    }

    #[test]
    fn parses_kubectl_style_arguments() {
        assert_eq!(parse_resource_arg("pods"), ResourceArg { name: "pods", version: None, group: None });
        assert_eq!(
            parse_resource_arg("deployments.apps"),
            ResourceArg { name: "deployments", version: None, group: Some("apps") }
        );
        assert_eq!(
            parse_resource_arg("deployments.v1.apps"),
            ResourceArg { name: "deployments", version: Some("v1"), group: Some("apps") }
        );
        assert_eq!(
            parse_resource_arg("ingresses.networking.k8s.io"),
            ResourceArg { name: "ingresses", version: None, group: Some("networking.k8s.io") }
        );
    }

    #[test]
    fn resolves_plural_singular_and_kind() {
        let r = resolver();
        for arg in ["pods", "pod", "Pod"] {
            let found = r.find_by_name(arg).expect(arg);
            assert_eq!(found.kind.resource.kind, "Pod");
        }
        assert_eq!(r.find_by_name("deployments.apps").unwrap().kind.group_kind().to_string(), "Deployment.apps");
        assert!(r.find_by_name("deployments.batch").is_none());
    }

    #[test]
    fn core_group_wins_and_preferred_version_is_used() {
        let r = resolver();
        assert_eq!(r.find_by_name("events").unwrap().kind.resource.group, "");
        assert_eq!(r.find_by_name("events.events.k8s.io").unwrap().kind.resource.group, "events.k8s.io");
        assert_eq!(r.find_by_name("hpa").map(|d| d.kind.resource.version.as_str()), None);
        assert_eq!(r.find_by_name("horizontalpodautoscalers").unwrap().kind.resource.version, "v2");
        assert_eq!(
            r.find_by_name("horizontalpodautoscalers.v1.autoscaling").unwrap().kind.resource.version,
            "v1"
        );
    }

    #[tokio::test]
    async fn gvk_lookup_is_exact() {
        let r = resolver();
        let found = r.resolve_gvk(&GroupVersionKind::gvk("autoscaling", "v1", "HorizontalPodAutoscaler")).await.unwrap();
        assert_eq!(found.resource.plural, "horizontalpodautoscalers");
        let err = r.resolve_gvk(&GroupVersionKind::gvk("apps", "v1beta1", "Deployment")).await.unwrap_err();
        assert!(err.to_string().contains("GVK not found"), "err={}", err);
        let err = r.resolve_name("widgets").await.unwrap_err();
        assert!(err.to_string().contains("widgets"), "err={}", err);
    }
}
