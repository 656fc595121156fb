//! addop ops: the imperative side of a run.
//! Operators go through OLM on the target cluster, add-ons through OCM (or the
//! ROSA CLI), diagnostics and table downloads through external tools.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use addop_core::OcmEnv;
use serde::{Deserialize, Serialize};

pub mod ocm;
pub mod olm;
pub mod tools;

pub use ocm::OcmAddons;
pub use olm::OlmOperators;
pub use tools::{AwsCli, MustGather};

/// Fully resolved operator install request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperatorInstall {
    pub kubeconfig: PathBuf,
    pub name: String,
    pub namespace: Option<String>,
    pub timeout: Duration,
    pub channel: String,
    pub source: String,
    pub override_image: Option<String>,
    pub source_image: Option<String>,
    pub target_namespaces: Vec<String>,
    /// Pull credentials for brew-hosted override images.
    pub brew_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperatorUninstall {
    pub kubeconfig: PathBuf,
    pub name: String,
    pub namespace: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddonInstall {
    pub cluster_name: String,
    pub name: String,
    pub ocm_env: OcmEnv,
    pub rosa: bool,
    pub wait: bool,
    pub wait_timeout: Duration,
    pub parameters: Vec<(String, String)>,
    /// Extra credentials some add-ons need on stage (brew token).
    pub extra_credentials: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddonUninstall {
    pub cluster_name: String,
    pub name: String,
    pub ocm_env: OcmEnv,
    pub rosa: bool,
    pub wait: bool,
    pub wait_timeout: Duration,
}

/// Operator lifecycle on a cluster reachable through a kubeconfig.
#[async_trait::async_trait]
pub trait OperatorOps: Send + Sync {
    async fn install(&self, req: &OperatorInstall) -> Result<()>;
    async fn uninstall(&self, req: &OperatorUninstall) -> Result<()>;
}

/// Managed add-on lifecycle on a named cluster.
#[async_trait::async_trait]
pub trait AddonOps: Send + Sync {
    /// Whether `cluster_name` is known to OCM in `env`.
    async fn cluster_exists(&self, cluster_name: &str, env: OcmEnv) -> Result<bool>;
    async fn install(&self, req: &AddonInstall) -> Result<()>;
    async fn uninstall(&self, req: &AddonUninstall) -> Result<()>;
}

/// Collects a diagnostic bundle for the cluster behind `kubeconfig` into `target_dir`.
#[async_trait::async_trait]
pub trait DiagnosticCollector: Send + Sync {
    async fn collect(&self, target_dir: &Path, kubeconfig: &Path) -> Result<()>;
}

/// Shared poll loop: call `check` every `interval` until it yields `Some`, or fail after `timeout`.
pub(crate) async fn poll_until<T, F, Fut>(what: &str, timeout: Duration, interval: Duration, mut check: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<Option<T>>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(v) = check().await? {
            return Ok(v);
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("timed out after {}s waiting for {}", timeout.as_secs(), what);
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn poll_until_returns_first_ready_value() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let v = poll_until("ready", Duration::from_secs(60), Duration::from_secs(5), move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(if n >= 2 { Some(n) } else { None })
        })
        .await
        .unwrap();
        assert_eq!(v, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_until_times_out() {
        let err = poll_until::<(), _, _>("csv", Duration::from_secs(10), Duration::from_secs(3), || async { Ok::<_, anyhow::Error>(None) })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out after 10s waiting for csv"), "err={}", err);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_until_propagates_check_errors() {
        let err = poll_until::<(), _, _>("addon", Duration::from_secs(10), Duration::from_secs(1), || async { Err(anyhow::anyhow!("addon failed")) })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "addon failed");
    }
}
