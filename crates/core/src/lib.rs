//! addop core types: product descriptors, run mode and defaults.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod duration;

pub use duration::{parse_duration, DurationError, ADDON_TIMEOUT, OPERATOR_TIMEOUT};

pub const DEFAULT_CHANNEL: &str = "stable";
pub const DEFAULT_SOURCE: &str = "redhat-operators";

/// Addon keys that configure the product itself rather than the addon.
pub const RESERVED_ADDON_KEYS: &[&str] = &["name", "timeout", "rosa", "ocm-env", "cluster-name", "kubeconfig", "brew-token"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProductKind {
    Operator,
    Addon,
}

impl ProductKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductKind::Operator => "operator",
            ProductKind::Addon => "addon",
        }
    }
}

impl fmt::Display for ProductKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Whether a run installs or uninstalls its products.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Install,
    Uninstall,
}

impl RunMode {
    pub const SUPPORTED: &'static [&'static str] = &["install", "uninstall"];

    pub fn is_install(&self) -> bool { matches!(self, RunMode::Install) }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Install => "install",
            RunMode::Uninstall => "uninstall",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "install" => Ok(RunMode::Install),
            "uninstall" => Ok(RunMode::Uninstall),
            other => Err(format!("unsupported action {:?}; supported: {:?}", other, RunMode::SUPPORTED)),
        }
    }
}

/// OCM environment an addon is managed through.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OcmEnv {
    #[default]
    Stage,
    Production,
}

impl OcmEnv {
    pub const SUPPORTED: &'static [&'static str] = &["stage", "production"];

    pub fn as_str(&self) -> &'static str {
        match self {
            OcmEnv::Stage => "stage",
            OcmEnv::Production => "production",
        }
    }
}

impl fmt::Display for OcmEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for OcmEnv {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "stage" => Ok(OcmEnv::Stage),
            "production" => Ok(OcmEnv::Production),
            other => Err(format!("unsupported ocm env {:?}; supported: {:?}", other, OcmEnv::SUPPORTED)),
        }
    }
}

/// A scalar taken from user input (CLI `k=v` pairs or YAML).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(b) => write!(f, "{}", b),
            Scalar::Int(i) => write!(f, "{}", i),
            Scalar::Float(x) => write!(f, "{}", x),
            Scalar::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self { Scalar::Str(s.to_string()) }
}

/// Operator to install or uninstall through OLM.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct OperatorSpec {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    /// Credentials locator for the target cluster.
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,
    #[serde(default)]
    pub timeout: Option<Scalar>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    /// Explicit override (index) image; wins over any resolved one.
    #[serde(default)]
    pub iib: Option<String>,
    #[serde(default)]
    pub source_image: Option<String>,
    #[serde(default)]
    pub target_namespaces: Vec<String>,
}

/// Addon to install or uninstall on a managed cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct AddonSpec {
    pub name: String,
    #[serde(default)]
    pub cluster_name: Option<String>,
    /// Only used to collect diagnostics when the addon fails.
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,
    #[serde(default)]
    pub timeout: Option<Scalar>,
    #[serde(default)]
    pub ocm_env: Option<String>,
    #[serde(default)]
    pub rosa: bool,
    /// Everything else the user passed; addon parameters on install.
    #[serde(flatten)]
    pub parameters: BTreeMap<String, Scalar>,
}

impl AddonSpec {
    /// Addon parameters with reserved keys filtered out.
    pub fn install_parameters(&self) -> Vec<(String, String)> {
        self.parameters
            .iter()
            .filter(|(k, _)| !RESERVED_ADDON_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.to_string()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProductDescriptor {
    Operator(OperatorSpec),
    Addon(AddonSpec),
}

impl ProductDescriptor {
    pub fn kind(&self) -> ProductKind {
        match self {
            ProductDescriptor::Operator(_) => ProductKind::Operator,
            ProductDescriptor::Addon(_) => ProductKind::Addon,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ProductDescriptor::Operator(o) => &o.name,
            ProductDescriptor::Addon(a) => &a.name,
        }
    }

    /// Raw timeout or the kind default, converted to seconds.
    pub fn timeout_seconds(&self) -> Result<u64, DurationError> {
        let (raw, default) = match self {
            ProductDescriptor::Operator(o) => (o.timeout.as_ref(), OPERATOR_TIMEOUT),
            ProductDescriptor::Addon(a) => (a.timeout.as_ref(), ADDON_TIMEOUT),
        };
        match raw {
            Some(v) => parse_duration(&v.to_string()),
            None => parse_duration(default),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addon_yaml_collects_unknown_keys_as_parameters() {
        let y = "name: managed-odh\ncluster-name: c1\nrosa: true\ntimeout: 60\nnotification-email: me@example.com\nreplicas: 3\n";
        let a: AddonSpec = serde_yaml::from_str(y).unwrap();
        assert_eq!(a.name, "managed-odh");
        assert_eq!(a.cluster_name.as_deref(), Some("c1"));
        assert!(a.rosa);
        assert_eq!(a.timeout, Some(Scalar::Int(60)));
        assert_eq!(
            a.install_parameters(),
            vec![("notification-email".to_string(), "me@example.com".to_string()), ("replicas".to_string(), "3".to_string())]
        );
    }

    #[test]
    fn install_parameters_skip_reserved_keys() {
        let mut a = AddonSpec { name: "x".into(), ..Default::default() };
        a.parameters.insert("brew-token".into(), "secret".into());
        a.parameters.insert("p1".into(), Scalar::Bool(false));
        assert_eq!(a.install_parameters(), vec![("p1".to_string(), "false".to_string())]);
    }

    #[test]
    fn timeouts_default_per_kind() {
        let op = ProductDescriptor::Operator(OperatorSpec { name: "o".into(), ..Default::default() });
        let ad = ProductDescriptor::Addon(AddonSpec { name: "a".into(), ..Default::default() });
        assert_eq!(op.timeout_seconds(), Ok(3600));
        assert_eq!(ad.timeout_seconds(), Ok(1800));

        let custom = ProductDescriptor::Operator(OperatorSpec { name: "o".into(), timeout: Some("30m".into()), ..Default::default() });
        assert_eq!(custom.timeout_seconds(), Ok(1800));
        let bad = ProductDescriptor::Addon(AddonSpec { name: "a".into(), timeout: Some("soon".into()), ..Default::default() });
        assert!(bad.timeout_seconds().is_err());
    }

    #[test]
    fn run_mode_and_env_parse() {
        assert_eq!("install".parse::<RunMode>(), Ok(RunMode::Install));
        assert_eq!("uninstall".parse::<RunMode>(), Ok(RunMode::Uninstall));
        assert!("upgrade".parse::<RunMode>().is_err());
        assert_eq!("production".parse::<OcmEnv>(), Ok(OcmEnv::Production));
        assert!("dev".parse::<OcmEnv>().unwrap_err().contains("dev"));
        assert_eq!(OcmEnv::default(), OcmEnv::Stage);
    }
}
