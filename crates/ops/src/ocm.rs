//! Managed add-on install/uninstall through the OCM clusters_mgmt API (or the ROSA CLI).

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use addop_core::OcmEnv;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value as Json};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::tools::run_tool;
use crate::{poll_until, AddonInstall, AddonOps, AddonUninstall};

pub const DEFAULT_SSO_ENDPOINT: &str = "https://sso.redhat.com/auth/realms/redhat-external/protocol/openid-connect/token";
const SSO_CLIENT_ID: &str = "cloud-services";
const BREW_TOKEN_PARAM: &str = "brew-token";

pub fn api_host(env: OcmEnv) -> &'static str {
    match env {
        OcmEnv::Stage => "https://api.stage.openshift.com",
        OcmEnv::Production => "https://api.openshift.com",
    }
}

fn rosa_env(env: OcmEnv) -> &'static str {
    match env {
        OcmEnv::Stage => "staging",
        OcmEnv::Production => "production",
    }
}

/// Request body for `POST /clusters/{id}/addons`.
pub fn addon_install_body(name: &str, parameters: &[(String, String)], extra_credentials: Option<&str>) -> Json {
    let mut items: Vec<Json> = parameters.iter().map(|(k, v)| json!({ "id": k, "value": v })).collect();
    if let Some(token) = extra_credentials {
        items.push(json!({ "id": BREW_TOKEN_PARAM, "value": token }));
    }
    json!({ "addon": { "id": name }, "parameters": { "items": items } })
}

/// `rosa install addon` arguments; parameters become `--<id> <value>` flags.
pub fn rosa_install_args(cluster: &str, name: &str, parameters: &[(String, String)]) -> Vec<String> {
    let mut args = vec!["install".to_string(), "addon".to_string(), name.to_string(), format!("--cluster={}", cluster), "--yes".to_string()];
    for (k, v) in parameters {
        args.push(format!("--{}", k));
        args.push(v.clone());
    }
    args
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ClusterList {
    #[serde(default)]
    items: Vec<ClusterItem>,
}

#[derive(Debug, Deserialize)]
struct ClusterItem {
    id: String,
}

/// OCM-backed add-on lifecycle.
pub struct OcmAddons {
    http: reqwest::Client,
    offline_token: String,
    sso_endpoint: String,
    poll_interval: Duration,
    access: Mutex<Option<(String, Instant)>>,
}

impl OcmAddons {
    pub fn new(offline_token: impl Into<String>, sso_endpoint: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(Duration::from_secs(60)).build().context("building OCM http client")?;
        Ok(Self {
            http,
            offline_token: offline_token.into(),
            sso_endpoint: sso_endpoint.into(),
            poll_interval: Duration::from_secs(15),
            access: Mutex::new(None),
        })
    }

    /// Access token from the SSO endpoint, cached until shortly before expiry.
    async fn access_token(&self) -> Result<String> {
        let mut guard = self.access.lock().await;
        if let Some((token, until)) = guard.as_ref() {
            if Instant::now() < *until {
                return Ok(token.clone());
            }
        }
        let resp = self
            .http
            .post(&self.sso_endpoint)
            .form(&[("grant_type", "refresh_token"), ("client_id", SSO_CLIENT_ID), ("refresh_token", self.offline_token.as_str())])
            .send()
            .await
            .context("requesting OCM access token")?
            .error_for_status()
            .context("OCM token exchange rejected")?;
        let tr: TokenResponse = resp.json().await.context("decoding OCM token response")?;
        let ttl = tr.expires_in.unwrap_or(300).saturating_sub(60).max(30);
        *guard = Some((tr.access_token.clone(), Instant::now() + Duration::from_secs(ttl)));
        debug!(ttl_secs = ttl, "OCM access token refreshed");
        Ok(tr.access_token)
    }

    async fn find_cluster_id(&self, env: OcmEnv, cluster: &str) -> Result<Option<String>> {
        let url = format!("{}/api/clusters_mgmt/v1/clusters", api_host(env));
        let token = self.access_token().await?;
        let list: ClusterList = self
            .http
            .get(&url)
            .bearer_auth(token)
            .query(&[("search", format!("name = '{}'", cluster))])
            .send()
            .await
            .with_context(|| format!("looking up cluster {}", cluster))?
            .error_for_status()?
            .json()
            .await
            .context("decoding cluster list")?;
        Ok(list.items.into_iter().next().map(|c| c.id))
    }

    async fn cluster_id(&self, env: OcmEnv, cluster: &str) -> Result<String> {
        self.find_cluster_id(env, cluster).await?.ok_or_else(|| anyhow!("cluster {} not found in OCM {}", cluster, env))
    }

    fn addon_url(env: OcmEnv, cluster_id: &str, addon: &str) -> String {
        format!("{}/api/clusters_mgmt/v1/clusters/{}/addons/{}", api_host(env), cluster_id, addon)
    }

    /// Current addon state, `None` once the addon is gone.
    async fn addon_state(&self, env: OcmEnv, cluster_id: &str, addon: &str) -> Result<Option<String>> {
        let token = self.access_token().await?;
        let resp = self.http.get(Self::addon_url(env, cluster_id, addon)).bearer_auth(token).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: Json = resp.error_for_status()?.json().await?;
        Ok(Some(body.get("state").and_then(|s| s.as_str()).unwrap_or("unknown").to_string()))
    }

    async fn ready_state(&self, env: OcmEnv, cluster_id: &str, addon: &str) -> Result<Option<()>> {
        match self.addon_state(env, cluster_id, addon).await?.as_deref() {
            Some("ready") => Ok(Some(())),
            Some("failed") => Err(anyhow!("addon {} reported state failed", addon)),
            other => {
                debug!(addon = %addon, state = ?other, "waiting for addon");
                Ok(None)
            }
        }
    }

    async fn gone_state(&self, env: OcmEnv, cluster_id: &str, addon: &str) -> Result<Option<()>> {
        Ok(self.addon_state(env, cluster_id, addon).await?.is_none().then_some(()))
    }

    async fn rosa_login(&self, env: OcmEnv) -> Result<()> {
        let args = vec!["login".to_string(), format!("--env={}", rosa_env(env)), format!("--token={}", self.offline_token)];
        run_tool("rosa", &args, &[]).await.map(|_| ())
    }
}

#[async_trait::async_trait]
impl AddonOps for OcmAddons {
    async fn cluster_exists(&self, cluster_name: &str, env: OcmEnv) -> Result<bool> {
        Ok(self.find_cluster_id(env, cluster_name).await?.is_some())
    }

    async fn install(&self, req: &AddonInstall) -> Result<()> {
        info!(addon = %req.name, cluster = %req.cluster_name, env = %req.ocm_env, rosa = req.rosa, "installing addon");
        let cluster_id = self.cluster_id(req.ocm_env, &req.cluster_name).await?;
        if req.rosa {
            self.rosa_login(req.ocm_env).await?;
            run_tool("rosa", &rosa_install_args(&req.cluster_name, &req.name, &req.parameters), &[]).await?;
        } else {
            let url = format!("{}/api/clusters_mgmt/v1/clusters/{}/addons", api_host(req.ocm_env), cluster_id);
            let body = addon_install_body(&req.name, &req.parameters, req.extra_credentials.as_deref());
            let token = self.access_token().await?;
            let resp = self.http.post(&url).bearer_auth(token).json(&body).send().await.with_context(|| format!("installing addon {}", req.name))?;
            if !resp.status().is_success() {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                return Err(anyhow!("OCM rejected addon {} install ({}): {}", req.name, status, text));
            }
        }
        if req.wait {
            let what = format!("addon {} ready on {}", req.name, req.cluster_name);
            let (env, id, name) = (req.ocm_env, cluster_id.as_str(), req.name.as_str());
            poll_until(&what, req.wait_timeout, self.poll_interval, move || self.ready_state(env, id, name)).await?;
        }
        info!(addon = %req.name, cluster = %req.cluster_name, "addon installed");
        Ok(())
    }

    async fn uninstall(&self, req: &AddonUninstall) -> Result<()> {
        info!(addon = %req.name, cluster = %req.cluster_name, env = %req.ocm_env, rosa = req.rosa, "uninstalling addon");
        let cluster_id = self.cluster_id(req.ocm_env, &req.cluster_name).await?;
        if req.rosa {
            self.rosa_login(req.ocm_env).await?;
            let args = vec!["uninstall".to_string(), "addon".to_string(), req.name.clone(), format!("--cluster={}", req.cluster_name), "--yes".to_string()];
            run_tool("rosa", &args, &[]).await?;
        } else {
            let token = self.access_token().await?;
            let resp = self
                .http
                .delete(Self::addon_url(req.ocm_env, &cluster_id, &req.name))
                .bearer_auth(token)
                .send()
                .await
                .with_context(|| format!("uninstalling addon {}", req.name))?;
            if resp.status() != StatusCode::NOT_FOUND && !resp.status().is_success() {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                return Err(anyhow!("OCM rejected addon {} uninstall ({}): {}", req.name, status, text));
            }
        }
        if req.wait {
            let what = format!("addon {} removal from {}", req.name, req.cluster_name);
            let (env, id, name) = (req.ocm_env, cluster_id.as_str(), req.name.as_str());
            poll_until(&what, req.wait_timeout, self.poll_interval, move || self.gone_state(env, id, name)).await?;
        }
        info!(addon = %req.name, cluster = %req.cluster_name, "addon uninstalled");
        Ok(())
    }
}
