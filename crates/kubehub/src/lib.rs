//! kstage kubehub: client wiring and the handful of dynamic-resource reads and
//! deletes the reconciler needs (phase, existence, dependents, controller readiness).

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    api::{Api, DeleteParams, ListParams, PropagationPolicy},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Reference to one object by GVK key (`v1/Kind` or `group/v1/Kind`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceRef {
    pub gvk: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceRef {
    pub fn new(gvk: impl Into<String>, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self { gvk: gvk.into(), namespace: namespace.map(|s| s.to_string()), name: name.into() }
    }

    pub fn kind(&self) -> &str {
        self.gvk.rsplit('/').next().unwrap_or(&self.gvk)
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind(), ns, self.name),
            None => write!(f, "{} {}", self.kind(), self.name),
        }
    }
}

/// Kube client from the ambient kubeconfig / in-cluster env.
pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client from kubeconfig")
}

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() })
        }
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: (*group).to_string(), version: (*version).to_string(), kind: (*kind).to_string() })
        }
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

pub fn gvk_key(api_version: &str, kind: &str) -> String {
    format!("{}/{}", api_version, kind)
}

/// Resolve a GVK to its served resource. Fails when the CRD is not installed.
pub async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

/// Dynamic API handle for a GVK key, scoped to `namespace` when the kind is namespaced.
pub async fn dynamic_api(client: Client, gvk_key: &str, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
    let gvk = parse_gvk_key(gvk_key)?;
    let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
    Ok(if namespaced {
        match namespace {
            Some(ns) => Api::namespaced_with(client, ns, &ar),
            None => Api::all_with(client, &ar),
        }
    } else {
        Api::all_with(client, &ar)
    })
}

pub async fn get_opt(client: Client, target: &ResourceRef) -> Result<Option<DynamicObject>> {
    let api = dynamic_api(client, &target.gvk, target.namespace.as_deref()).await?;
    api.get_opt(&target.name).await.with_context(|| format!("reading {}", target))
}

/// `status.phase` of an object, if present.
pub fn status_phase(obj: &DynamicObject) -> Option<String> {
    obj.data.get("status").and_then(|s| s.get("phase")).and_then(|p| p.as_str()).map(|s| s.to_string())
}

/// True once the API server has stamped a deletion timestamp.
pub fn is_terminating(obj: &DynamicObject) -> bool {
    obj.metadata.deletion_timestamp.is_some()
}

/// Delete with foreground propagation. A missing object is not an error.
pub async fn delete(client: Client, target: &ResourceRef) -> Result<bool> {
    let api = dynamic_api(client, &target.gvk, target.namespace.as_deref()).await?;
    let dp = DeleteParams { propagation_policy: Some(PropagationPolicy::Foreground), ..Default::default() };
    match api.delete(&target.name, &dp).await {
        Ok(_) => {
            info!(target = %target, "delete requested");
            Ok(true)
        }
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            debug!(target = %target, "already gone");
            Ok(false)
        }
        Err(e) => Err(anyhow!("deleting {}: {}", target, e)),
    }
}

/// Names of objects of `gvk_key` in `namespace`. A kind whose CRD is not
/// served counts as having no objects.
pub async fn list_names(client: Client, gvk_key: &str, namespace: Option<&str>) -> Result<Vec<String>> {
    let api = match dynamic_api(client, gvk_key, namespace).await {
        Ok(api) => api,
        Err(e) if e.to_string().starts_with("GVK not found") => {
            warn!(gvk = %gvk_key, "kind not served; treating as empty");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e),
    };
    let list = api.list(&ListParams::default()).await.with_context(|| format!("listing {}", gvk_key))?;
    let mut names: Vec<String> = list.items.into_iter().filter_map(|o| o.metadata.name).collect();
    names.sort();
    Ok(names)
}

/// Deployment has at least as many available replicas as desired (and at least one).
pub async fn deployment_available(client: Client, namespace: &str, name: &str) -> Result<(bool, String)> {
    let api: Api<Deployment> = Api::namespaced(client, namespace);
    let Some(dep) = api.get_opt(name).await.with_context(|| format!("reading deployment {}/{}", namespace, name))? else {
        return Ok((false, format!("{}/{} not found", namespace, name)));
    };
    Ok(availability(&dep))
}

fn availability(dep: &Deployment) -> (bool, String) {
    let desired = dep.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let available = dep.status.as_ref().and_then(|s| s.available_replicas).unwrap_or(0);
    (available >= desired.max(1), format!("available {}/{}", available, desired))
}
