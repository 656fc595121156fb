//! addop kubehub – kubeconfig identity, per-cluster clients and version discovery

#![forbid(unsafe_code)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use kube::{
    api::Api,
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client, Config,
};
use serde_json::Value as Json;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("reading kubeconfig {path}: {reason}")]
    Unreadable { path: String, reason: String },
    #[error("kubeconfig {path} contains no cluster")]
    NoCluster { path: String },
    #[error("kubeconfig {path} contains more than one cluster ({count})")]
    MultipleClusters { path: String, count: usize },
}

/// Name of the single cluster a kubeconfig points at.
pub fn cluster_name_from_kubeconfig(path: &Path) -> Result<String, IdentityError> {
    let shown = path.display().to_string();
    let kc = Kubeconfig::read_from(path).map_err(|e| IdentityError::Unreadable { path: shown.clone(), reason: e.to_string() })?;
    match kc.clusters.as_slice() {
        [] => Err(IdentityError::NoCluster { path: shown }),
        [one] => Ok(one.name.clone()),
        many => Err(IdentityError::MultipleClusters { path: shown, count: many.len() }),
    }
}

/// Build a client bound to the kubeconfig's current context.
pub async fn client_from_kubeconfig(path: &Path) -> Result<Client> {
    let kc = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
    let config = Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
        .await
        .with_context(|| format!("loading kubeconfig {}", path.display()))?;
    let client = Client::try_from(config).with_context(|| format!("creating client for {}", path.display()))?;
    debug!(kubeconfig = %path.display(), "kube client ready");
    Ok(client)
}

/// Split a `group/version/Kind` (or `version/Kind`) key.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() }),
        [group, version, kind] => Ok(GroupVersionKind { group: (*group).to_string(), version: (*version).to_string(), kind: (*kind).to_string() }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

/// Dynamic API for a known kind; `namespace = None` addresses cluster-scoped kinds.
pub fn dynamic_api(client: Client, gvk_key: &str, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
    let gvk = parse_gvk_key(gvk_key)?;
    let ar = ApiResource::from_gvk(&gvk);
    Ok(match namespace {
        Some(ns) => Api::namespaced_with(client, ns, &ar),
        None => Api::all_with(client, &ar),
    })
}

pub const CLUSTER_VERSION_GVK: &str = "config.openshift.io/v1/ClusterVersion";

/// `major.minor` of an OpenShift `ClusterVersion` object.
///
/// Prefers `status.desired.version`; falls back to the newest completed
/// history entry.
pub fn major_minor_from_cluster_version(obj: &Json) -> Result<String> {
    let status = obj.get("status").ok_or_else(|| anyhow!("ClusterVersion has no status"))?;
    let desired = status.get("desired").and_then(|d| d.get("version")).and_then(|v| v.as_str());
    let completed = || {
        status
            .get("history")
            .and_then(|h| h.as_array())
            .and_then(|h| h.iter().find(|e| e.get("state").and_then(|s| s.as_str()) == Some("Completed")))
            .and_then(|e| e.get("version"))
            .and_then(|v| v.as_str())
    };
    let full = desired.filter(|v| !v.is_empty()).or_else(completed).ok_or_else(|| anyhow!("ClusterVersion reports no version"))?;
    let mut parts = full.split('.');
    match (parts.next(), parts.next()) {
        (Some(major), Some(minor)) if !major.is_empty() && !minor.is_empty() => Ok(format!("{}.{}", major, minor)),
        _ => Err(anyhow!("unexpected cluster version {:?}", full)),
    }
}

/// Query the platform version (`major.minor`) of the cluster behind `client`.
pub async fn cluster_version(client: Client) -> Result<String> {
    let api = dynamic_api(client, CLUSTER_VERSION_GVK, None)?;
    let obj = api.get("version").await.context("reading ClusterVersion/version")?;
    let raw = serde_json::to_value(&obj).context("serializing ClusterVersion")?;
    major_minor_from_cluster_version(&raw)
}

/// Cluster identity and version lookups the action builder depends on.
#[async_trait::async_trait]
pub trait ClusterInspector: Send + Sync {
    /// Cluster name behind a credentials locator; fails on ambiguous kubeconfigs.
    async fn cluster_name(&self, kubeconfig: &Path) -> Result<String>;
    /// Platform `major.minor` version.
    async fn version(&self, kubeconfig: &Path) -> Result<String>;
}

/// Kube-backed inspector.
#[derive(Debug, Default, Clone, Copy)]
pub struct KubeInspector;

#[async_trait::async_trait]
impl ClusterInspector for KubeInspector {
    async fn cluster_name(&self, kubeconfig: &Path) -> Result<String> {
        Ok(cluster_name_from_kubeconfig(kubeconfig)?)
    }

    async fn version(&self, kubeconfig: &Path) -> Result<String> {
        let client = client_from_kubeconfig(kubeconfig).await?;
        let v = cluster_version(client).await?;
        info!(kubeconfig = %kubeconfig.display(), version = %v, "cluster version");
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn kubeconfig(clusters: &[&str]) -> tempfile::NamedTempFile {
        let mut y = String::from("apiVersion: v1\nkind: Config\nclusters:\n");
        for c in clusters {
            y.push_str(&format!("- name: {c}\n  cluster:\n    server: https://api.{c}.example.com:6443\n"));
        }
        y.push_str("contexts: []\nusers: []\n");
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(y.as_bytes()).unwrap();
        f
    }

    #[test]
    fn single_cluster_kubeconfig_names_the_cluster() {
        let f = kubeconfig(&["prod-1"]);
        assert_eq!(cluster_name_from_kubeconfig(f.path()).unwrap(), "prod-1");
    }

    #[test]
    fn multi_cluster_kubeconfig_is_rejected() {
        let f = kubeconfig(&["a", "b"]);
        let err = cluster_name_from_kubeconfig(f.path()).unwrap_err();
        assert!(matches!(err, IdentityError::MultipleClusters { count: 2, .. }), "err={:?}", err);
    }

    #[test]
    fn missing_kubeconfig_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let err = cluster_name_from_kubeconfig(&dir.path().join("kc")).unwrap_err();
        assert!(matches!(err, IdentityError::Unreadable { .. }));
    }

    #[test]
    fn version_prefers_desired_then_history() {
        let desired = serde_json::json!({"status": {"desired": {"version": "4.15.3"}, "history": []}});
        assert_eq!(major_minor_from_cluster_version(&desired).unwrap(), "4.15");

        let history = serde_json::json!({"status": {"history": [
            {"state": "Partial", "version": "4.16.0"},
            {"state": "Completed", "version": "4.14.9"}
        ]}});
        assert_eq!(major_minor_from_cluster_version(&history).unwrap(), "4.14");

        let empty = serde_json::json!({"status": {}});
        assert!(major_minor_from_cluster_version(&empty).is_err());
        let odd = serde_json::json!({"status": {"desired": {"version": "4"}}});
        assert!(major_minor_from_cluster_version(&odd).is_err());
    }

    #[test]
    fn parse_gvk_key_variants() {
        let g = parse_gvk_key("operators.coreos.com/v1alpha1/Subscription").unwrap();
        assert_eq!((g.group.as_str(), g.version.as_str(), g.kind.as_str()), ("operators.coreos.com", "v1alpha1", "Subscription"));
        let core = parse_gvk_key("v1/Namespace").unwrap();
        assert_eq!(core.group, "");
        assert!(parse_gvk_key("a/b/c/d").is_err());
    }
}
