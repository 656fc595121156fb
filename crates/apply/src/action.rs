//! Bound install/uninstall operations, one per product.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use addop_core::ProductKind;
use addop_ops::{AddonInstall, AddonOps, AddonUninstall, OperatorInstall, OperatorOps, OperatorUninstall};

/// What a failed action needs for diagnostic collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticsContext {
    /// Run-level diagnostics directory; bundles land under `must-gather/<cluster>/`.
    pub target_root: PathBuf,
    pub cluster_name: String,
    pub kubeconfig: PathBuf,
}

/// One executable unit of a run. Immutable once built.
#[async_trait::async_trait]
pub trait ProductAction: Send + Sync {
    fn kind(&self) -> ProductKind;
    fn name(&self) -> &str;
    fn cluster(&self) -> &str;
    /// Present only when diagnostics should be captured on failure.
    fn diagnostics(&self) -> Option<&DiagnosticsContext>;
    async fn execute(&self) -> Result<()>;
}

pub enum OperatorCall {
    Install(OperatorInstall),
    Uninstall(OperatorUninstall),
}

pub struct OperatorAction {
    pub(crate) cluster: String,
    pub(crate) call: OperatorCall,
    pub(crate) diagnostics: Option<DiagnosticsContext>,
    pub(crate) backend: Arc<dyn OperatorOps>,
}

#[async_trait::async_trait]
impl ProductAction for OperatorAction {
    fn kind(&self) -> ProductKind { ProductKind::Operator }

    fn name(&self) -> &str {
        match &self.call {
            OperatorCall::Install(r) => &r.name,
            OperatorCall::Uninstall(r) => &r.name,
        }
    }

    fn cluster(&self) -> &str { &self.cluster }

    fn diagnostics(&self) -> Option<&DiagnosticsContext> { self.diagnostics.as_ref() }

    async fn execute(&self) -> Result<()> {
        match &self.call {
            OperatorCall::Install(r) => self.backend.install(r).await,
            OperatorCall::Uninstall(r) => self.backend.uninstall(r).await,
        }
    }
}

pub enum AddonCall {
    Install(AddonInstall),
    Uninstall(AddonUninstall),
}

pub struct AddonAction {
    pub(crate) call: AddonCall,
    pub(crate) diagnostics: Option<DiagnosticsContext>,
    pub(crate) backend: Arc<dyn AddonOps>,
}

#[async_trait::async_trait]
impl ProductAction for AddonAction {
    fn kind(&self) -> ProductKind { ProductKind::Addon }

    fn name(&self) -> &str {
        match &self.call {
            AddonCall::Install(r) => &r.name,
            AddonCall::Uninstall(r) => &r.name,
        }
    }

    fn cluster(&self) -> &str {
        match &self.call {
            AddonCall::Install(r) => &r.cluster_name,
            AddonCall::Uninstall(r) => &r.cluster_name,
        }
    }

    fn diagnostics(&self) -> Option<&DiagnosticsContext> { self.diagnostics.as_ref() }

    async fn execute(&self) -> Result<()> {
        match &self.call {
            AddonCall::Install(r) => self.backend.install(r).await,
            AddonCall::Uninstall(r) => self.backend.uninstall(r).await,
        }
    }
}
