//! Turn validated product descriptors into bound actions.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use addop_core::{AddonSpec, DurationError, OcmEnv, OperatorSpec, ProductDescriptor, RunMode, DEFAULT_CHANNEL, DEFAULT_SOURCE};
use addop_iib::{IndexImageError, IndexImageResolver, ObjectStore, TableSource};
use addop_kubehub::ClusterInspector;
use addop_ops::{AddonInstall, AddonOps, AddonUninstall, OperatorInstall, OperatorOps, OperatorUninstall};
use tracing::{debug, info, warn};

use crate::action::{AddonAction, AddonCall, DiagnosticsContext, OperatorAction, OperatorCall, ProductAction};

/// Run-scoped settings. Nothing in the builder reads the process environment.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub mode: RunMode,
    pub must_gather_dir: Option<PathBuf>,
    pub index_image_source: Option<TableSource>,
    /// CI build job the index image table is keyed by.
    pub job_name: Option<String>,
    pub brew_token: Option<String>,
}

impl RunConfig {
    pub fn new(mode: RunMode) -> Self {
        Self { mode, must_gather_dir: None, index_image_source: None, job_name: None, brew_token: None }
    }
}

/// Collaborators the bound actions call into.
#[derive(Clone)]
pub struct Backends {
    pub operators: Arc<dyn OperatorOps>,
    pub addons: Arc<dyn AddonOps>,
    pub inspector: Arc<dyn ClusterInspector>,
    pub object_store: Arc<dyn ObjectStore>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("operator {product}: kubeconfig is missing")]
    MissingCredentials { product: String },
    #[error("addon {product}: cluster-name is missing")]
    MissingClusterName { product: String },
    #[error("{product}: {source}")]
    Duration { product: String, source: DurationError },
    #[error("operator {product}: {source}")]
    IndexImage { product: String, source: IndexImageError },
    #[error("{product}: cluster lookup failed: {reason}")]
    Cluster { product: String, reason: String },
    #[error("addon {product}: cluster {cluster} does not exist in OCM {env}")]
    UnknownCluster { product: String, cluster: String, env: OcmEnv },
    #[error("addon {product}: {reason}")]
    InvalidOcmEnv { product: String, reason: String },
}

pub struct ActionBuilder {
    config: RunConfig,
    backends: Backends,
    resolver: Option<IndexImageResolver>,
}

impl ActionBuilder {
    pub fn new(config: &RunConfig, backends: Backends) -> Self {
        // Uninstalls never need override images.
        let resolver = match (&config.index_image_source, config.mode) {
            (Some(source), RunMode::Install) => Some(IndexImageResolver::new(source.clone(), backends.object_store.clone())),
            _ => None,
        };
        Self { config: config.clone(), backends, resolver }
    }

    /// All-or-nothing: the first descriptor that cannot be bound aborts the build.
    pub async fn build(&self, descriptors: Vec<ProductDescriptor>) -> Result<Vec<Arc<dyn ProductAction>>, BuildError> {
        let (addons, operators): (Vec<_>, Vec<_>) = descriptors.into_iter().partition(|d| matches!(d, ProductDescriptor::Addon(_)));
        let mut actions: Vec<Arc<dyn ProductAction>> = Vec::with_capacity(addons.len() + operators.len());
        for d in addons.into_iter().chain(operators) {
            let timeout = d.timeout_seconds().map_err(|source| BuildError::Duration { product: d.name().to_string(), source })?;
            let timeout = Duration::from_secs(timeout);
            let action: Arc<dyn ProductAction> = match d {
                ProductDescriptor::Addon(spec) => Arc::new(self.addon_action(spec, timeout).await?),
                ProductDescriptor::Operator(spec) => Arc::new(self.operator_action(spec, timeout).await?),
            };
            info!(kind = %action.kind(), product = %action.name(), cluster = %action.cluster(), mode = %self.config.mode, "action prepared");
            actions.push(action);
        }
        Ok(actions)
    }

    fn diagnostics_for(&self, cluster_name: &str, kubeconfig: Option<&Path>) -> Option<DiagnosticsContext> {
        if !self.config.mode.is_install() {
            return None;
        }
        let root = self.config.must_gather_dir.as_ref()?;
        kubeconfig.map(|kc| DiagnosticsContext { target_root: root.clone(), cluster_name: cluster_name.to_string(), kubeconfig: kc.to_path_buf() })
    }

    async fn addon_action(&self, spec: AddonSpec, timeout: Duration) -> Result<AddonAction, BuildError> {
        let cluster_name = spec
            .cluster_name
            .clone()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| BuildError::MissingClusterName { product: spec.name.clone() })?;
        let ocm_env = match spec.ocm_env.as_deref() {
            Some(raw) => raw.parse::<OcmEnv>().map_err(|reason| BuildError::InvalidOcmEnv { product: spec.name.clone(), reason })?,
            None => OcmEnv::default(),
        };
        let exists = self
            .backends
            .addons
            .cluster_exists(&cluster_name, ocm_env)
            .await
            .map_err(|e| BuildError::Cluster { product: spec.name.clone(), reason: format!("{:#}", e) })?;
        if !exists {
            return Err(BuildError::UnknownCluster { product: spec.name, cluster: cluster_name, env: ocm_env });
        }
        let diagnostics = self.diagnostics_for(&cluster_name, spec.kubeconfig.as_deref());
        let call = match self.config.mode {
            RunMode::Install => AddonCall::Install(AddonInstall {
                parameters: spec.install_parameters(),
                cluster_name,
                name: spec.name,
                ocm_env,
                rosa: spec.rosa,
                wait: true,
                wait_timeout: timeout,
                extra_credentials: self.config.brew_token.clone(),
            }),
            RunMode::Uninstall => AddonCall::Uninstall(AddonUninstall {
                cluster_name,
                name: spec.name,
                ocm_env,
                rosa: spec.rosa,
                wait: true,
                wait_timeout: timeout,
            }),
        };
        Ok(AddonAction { call, diagnostics, backend: self.backends.addons.clone() })
    }

    async fn operator_action(&self, spec: OperatorSpec, timeout: Duration) -> Result<OperatorAction, BuildError> {
        let kubeconfig = spec.kubeconfig.clone().ok_or_else(|| BuildError::MissingCredentials { product: spec.name.clone() })?;
        let cluster = self
            .backends
            .inspector
            .cluster_name(&kubeconfig)
            .await
            .map_err(|e| BuildError::Cluster { product: spec.name.clone(), reason: format!("{:#}", e) })?;
        let diagnostics = self.diagnostics_for(&cluster, Some(kubeconfig.as_path()));
        let call = match self.config.mode {
            RunMode::Install => {
                let override_image = self.override_image(&spec, &kubeconfig).await?;
                OperatorCall::Install(OperatorInstall {
                    kubeconfig,
                    channel: spec.channel.unwrap_or_else(|| DEFAULT_CHANNEL.to_string()),
                    source: spec.source.unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
                    name: spec.name,
                    namespace: spec.namespace,
                    timeout,
                    override_image,
                    source_image: spec.source_image,
                    target_namespaces: spec.target_namespaces,
                    brew_token: self.config.brew_token.clone(),
                })
            }
            RunMode::Uninstall => OperatorCall::Uninstall(OperatorUninstall { kubeconfig, name: spec.name, namespace: spec.namespace, timeout }),
        };
        Ok(OperatorAction { cluster, call, diagnostics, backend: self.backends.operators.clone() })
    }

    /// Explicit `iib` wins; otherwise the table decides when a source and a job name are both known.
    async fn override_image(&self, spec: &OperatorSpec, kubeconfig: &Path) -> Result<Option<String>, BuildError> {
        if let Some(explicit) = spec.iib.as_ref().filter(|i| !i.is_empty()) {
            debug!(product = %spec.name, image = %explicit, "explicit override image");
            return Ok(Some(explicit.clone()));
        }
        let Some(resolver) = self.resolver.as_ref() else { return Ok(None) };
        let Some(job) = self.config.job_name.as_deref().filter(|j| !j.is_empty()) else {
            warn!(product = %spec.name, source = %resolver.source(), "index image source configured but no build job name; skipping lookup");
            return Ok(None);
        };
        let version = self
            .backends
            .inspector
            .version(kubeconfig)
            .await
            .map_err(|e| BuildError::Cluster { product: spec.name.clone(), reason: format!("{:#}", e) })?;
        resolver.resolve(&version, job, &spec.name).await.map_err(|source| BuildError::IndexImage { product: spec.name.clone(), source })
    }
}
