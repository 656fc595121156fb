//! Operator install/uninstall through OLM (Subscription + OperatorGroup + optional CatalogSource).

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use addop_kubehub::{client_from_kubeconfig, dynamic_api};
use k8s_openapi::{api::core::v1::Secret, ByteString};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    core::DynamicObject,
    Client,
};
use serde_json::{json, Value as Json};
use tracing::{debug, info, warn};

use crate::{poll_until, OperatorInstall, OperatorOps, OperatorUninstall};

pub const MARKETPLACE_NAMESPACE: &str = "openshift-marketplace";
pub const GLOBAL_OPERATORS_NAMESPACE: &str = "openshift-operators";
pub const BREW_REGISTRY: &str = "brew.registry.redhat.io";
const PULL_SECRET_NAMESPACE: &str = "openshift-config";
const PULL_SECRET_NAME: &str = "pull-secret";
const DOCKER_CONFIG_KEY: &str = ".dockerconfigjson";
const FIELD_MANAGER: &str = "addop";

const NAMESPACE_GVK: &str = "v1/Namespace";
const OPERATOR_GROUP_GVK: &str = "operators.coreos.com/v1/OperatorGroup";
const SUBSCRIPTION_GVK: &str = "operators.coreos.com/v1alpha1/Subscription";
const CATALOG_SOURCE_GVK: &str = "operators.coreos.com/v1alpha1/CatalogSource";
const CSV_GVK: &str = "operators.coreos.com/v1alpha1/ClusterServiceVersion";

/// Operator namespace defaults to the operator name.
pub fn operator_namespace(name: &str, namespace: Option<&str>) -> String {
    namespace.filter(|n| !n.is_empty()).unwrap_or(name).to_string()
}

pub fn iib_catalog_name(operator: &str) -> String { format!("iib-catalog-{}", operator) }

pub fn source_image_catalog_name(operator: &str) -> String { format!("{}-catalog", operator) }

pub fn namespace_manifest(ns: &str) -> Json {
    json!({ "apiVersion": "v1", "kind": "Namespace", "metadata": { "name": ns } })
}

pub fn operator_group_manifest(name: &str, ns: &str, target_namespaces: &[String]) -> Json {
    let mut spec = json!({});
    if !target_namespaces.is_empty() {
        spec["targetNamespaces"] = json!(target_namespaces);
    }
    json!({
        "apiVersion": "operators.coreos.com/v1",
        "kind": "OperatorGroup",
        "metadata": { "name": name, "namespace": ns },
        "spec": spec,
    })
}

pub fn catalog_source_manifest(name: &str, image: &str) -> Json {
    json!({
        "apiVersion": "operators.coreos.com/v1alpha1",
        "kind": "CatalogSource",
        "metadata": { "name": name, "namespace": MARKETPLACE_NAMESPACE },
        "spec": { "sourceType": "grpc", "image": image, "displayName": name, "publisher": FIELD_MANAGER },
    })
}

pub fn subscription_manifest(name: &str, ns: &str, channel: &str, source: &str) -> Json {
    json!({
        "apiVersion": "operators.coreos.com/v1alpha1",
        "kind": "Subscription",
        "metadata": { "name": name, "namespace": ns },
        "spec": {
            "name": name,
            "channel": channel,
            "source": source,
            "sourceNamespace": MARKETPLACE_NAMESPACE,
            "installPlanApproval": "Automatic",
        },
    })
}

/// Add (or replace) `registry` credentials in a `.dockerconfigjson` payload.
pub fn merge_registry_auth(dockerconfig: &[u8], registry: &str, auth: &str) -> Result<Vec<u8>> {
    let mut v: Json = if dockerconfig.is_empty() { json!({}) } else { serde_json::from_slice(dockerconfig).context("parsing .dockerconfigjson")? };
    let root = v.as_object_mut().ok_or_else(|| anyhow!(".dockerconfigjson is not an object"))?;
    let auths = root.entry("auths").or_insert_with(|| json!({})).as_object_mut().ok_or_else(|| anyhow!(".dockerconfigjson auths is not an object"))?;
    auths.insert(registry.to_string(), json!({ "auth": auth }));
    Ok(serde_json::to_vec(&v)?)
}

fn status_str<'a>(obj: &'a DynamicObject, field: &str) -> Option<&'a str> {
    obj.data.get("status").and_then(|s| s.get(field)).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
}

async fn apply(client: Client, gvk_key: &str, namespace: Option<&str>, manifest: &Json) -> Result<()> {
    let name = manifest
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("manifest missing metadata.name"))?;
    let api = dynamic_api(client, gvk_key, namespace)?;
    let pp = PatchParams::apply(FIELD_MANAGER).force();
    api.patch(name, &pp, &Patch::Apply(manifest)).await.with_context(|| format!("applying {} {}", gvk_key, name))?;
    debug!(gvk = %gvk_key, name = %name, ns = ?namespace, "applied");
    Ok(())
}

async fn delete_if_present(api: &Api<DynamicObject>, what: &str, name: &str) -> Result<bool> {
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => {
            debug!(what = %what, name = %name, "deleted");
            Ok(true)
        }
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
        Err(e) => Err(e).with_context(|| format!("deleting {} {}", what, name)),
    }
}

/// OLM-backed operator lifecycle.
#[derive(Debug, Clone)]
pub struct OlmOperators {
    poll_interval: Duration,
}

impl Default for OlmOperators {
    fn default() -> Self { Self::new() }
}

impl OlmOperators {
    pub fn new() -> Self { Self { poll_interval: Duration::from_secs(10) } }

    async fn ensure_brew_pull_secret(&self, client: Client, token: &str) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(client, PULL_SECRET_NAMESPACE);
        let mut secret = api.get(PULL_SECRET_NAME).await.context("reading cluster pull secret")?;
        let data = secret.data.get_or_insert_with(Default::default);
        let current = data.get(DOCKER_CONFIG_KEY).map(|b| b.0.clone()).unwrap_or_default();
        let merged = merge_registry_auth(&current, BREW_REGISTRY, token)?;
        if merged == current {
            return Ok(());
        }
        data.insert(DOCKER_CONFIG_KEY.to_string(), ByteString(merged));
        api.replace(PULL_SECRET_NAME, &PostParams::default(), &secret).await.context("updating cluster pull secret")?;
        info!(registry = %BREW_REGISTRY, "cluster pull secret updated");
        Ok(())
    }

    async fn wait_for_csv(&self, client: Client, name: &str, ns: &str, timeout: Duration) -> Result<String> {
        let subs = dynamic_api(client.clone(), SUBSCRIPTION_GVK, Some(ns))?;
        let csvs = dynamic_api(client, CSV_GVK, Some(ns))?;
        let (subs, csvs) = (&subs, &csvs);
        let what = format!("operator {} CSV in {}", name, ns);
        poll_until(&what, timeout, self.poll_interval, move || succeeded_csv(subs, csvs, name)).await
    }
}

/// Installed CSV name once it reports `Succeeded`; errors out on `Failed`.
async fn succeeded_csv(subs: &Api<DynamicObject>, csvs: &Api<DynamicObject>, name: &str) -> Result<Option<String>> {
    let Some(sub) = subs.get_opt(name).await? else { return Ok(None) };
    let Some(csv_name) = status_str(&sub, "installedCSV").map(str::to_string) else { return Ok(None) };
    let Some(csv) = csvs.get_opt(&csv_name).await? else { return Ok(None) };
    match status_str(&csv, "phase") {
        Some("Succeeded") => Ok(Some(csv_name)),
        Some("Failed") => {
            let reason = status_str(&csv, "message").unwrap_or("no message");
            Err(anyhow!("CSV {} failed: {}", csv_name, reason))
        }
        phase => {
            debug!(csv = %csv_name, phase = ?phase, "waiting for CSV");
            Ok(None)
        }
    }
}

async fn absent(api: &Api<DynamicObject>, name: &str) -> Result<Option<()>> {
    Ok(api.get_opt(name).await?.is_none().then_some(()))
}

#[async_trait::async_trait]
impl OperatorOps for OlmOperators {
    async fn install(&self, req: &OperatorInstall) -> Result<()> {
        let client = client_from_kubeconfig(&req.kubeconfig).await?;
        let ns = operator_namespace(&req.name, req.namespace.as_deref());
        info!(operator = %req.name, ns = %ns, channel = %req.channel, iib = ?req.override_image, "installing operator");

        let catalog = match (&req.override_image, &req.source_image) {
            (Some(image), _) => {
                if let Some(token) = &req.brew_token {
                    self.ensure_brew_pull_secret(client.clone(), token).await?;
                } else {
                    warn!(operator = %req.name, "override image without brew token; pull may fail");
                }
                Some((iib_catalog_name(&req.name), image))
            }
            (None, Some(image)) => Some((source_image_catalog_name(&req.name), image)),
            (None, None) => None,
        };
        let source = match catalog {
            Some((catalog_name, image)) => {
                apply(client.clone(), CATALOG_SOURCE_GVK, Some(MARKETPLACE_NAMESPACE), &catalog_source_manifest(&catalog_name, image)).await?;
                catalog_name
            }
            None => req.source.clone(),
        };

        if ns != GLOBAL_OPERATORS_NAMESPACE {
            apply(client.clone(), NAMESPACE_GVK, None, &namespace_manifest(&ns)).await?;
            apply(client.clone(), OPERATOR_GROUP_GVK, Some(&ns), &operator_group_manifest(&req.name, &ns, &req.target_namespaces)).await?;
        }
        apply(client.clone(), SUBSCRIPTION_GVK, Some(&ns), &subscription_manifest(&req.name, &ns, &req.channel, &source)).await?;

        let csv = self.wait_for_csv(client, &req.name, &ns, req.timeout).await?;
        info!(operator = %req.name, csv = %csv, "operator installed");
        Ok(())
    }

    async fn uninstall(&self, req: &OperatorUninstall) -> Result<()> {
        let client = client_from_kubeconfig(&req.kubeconfig).await?;
        let ns = operator_namespace(&req.name, req.namespace.as_deref());
        info!(operator = %req.name, ns = %ns, "uninstalling operator");

        let subs = dynamic_api(client.clone(), SUBSCRIPTION_GVK, Some(&ns))?;
        let installed_csv = subs.get_opt(&req.name).await?.as_ref().and_then(|s| status_str(s, "installedCSV").map(str::to_string));
        delete_if_present(&subs, "Subscription", &req.name).await?;
        if let Some(csv) = installed_csv {
            let csvs = dynamic_api(client.clone(), CSV_GVK, Some(&ns))?;
            delete_if_present(&csvs, "ClusterServiceVersion", &csv).await?;
        }
        let catalogs = dynamic_api(client.clone(), CATALOG_SOURCE_GVK, Some(MARKETPLACE_NAMESPACE))?;
        for catalog in [iib_catalog_name(&req.name), source_image_catalog_name(&req.name)] {
            delete_if_present(&catalogs, "CatalogSource", &catalog).await?;
        }

        if ns != GLOBAL_OPERATORS_NAMESPACE {
            let groups = dynamic_api(client.clone(), OPERATOR_GROUP_GVK, Some(&ns))?;
            delete_if_present(&groups, "OperatorGroup", &req.name).await?;
            let namespaces = dynamic_api(client, NAMESPACE_GVK, None)?;
            if delete_if_present(&namespaces, "Namespace", &ns).await? {
                let (namespaces, ns_ref) = (&namespaces, ns.as_str());
                poll_until(&format!("namespace {} removal", ns), req.timeout, self.poll_interval, move || absent(namespaces, ns_ref)).await?;
            }
        }
        info!(operator = %req.name, "operator uninstalled");
        Ok(())
    }
}
