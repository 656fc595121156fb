//! User input: `name=x;k=v` product strings, the YAML config file, and the
//! checks that run before anything touches a cluster.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use addop_core::{AddonSpec, OcmEnv, OperatorSpec, ProductDescriptor, RunMode};
use addop_iib::TableSource;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};

pub const MANAGED_ODH: &str = "managed-odh";

#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("'action' must be provided, supported actions: {0:?}")]
    MissingAction(&'static [&'static str]),
    #[error("{0}")]
    UnsupportedAction(String),
    #[error("at least one '--operator' or '--addon' must be provided")]
    NoProducts,
    #[error("'--ocm-token' is required for addon installation")]
    MissingOcmToken,
    #[error("addons {0:?}: cluster-name is missing; add it to the addon or pass '--cluster-name'")]
    MissingClusterName(Vec<String>),
    #[error("addons {0:?} have an unsupported ocm-env; supported: {supported:?}", supported = OcmEnv::SUPPORTED)]
    InvalidOcmEnv(Vec<String>),
    #[error("managed-odh addon on stage requires '--brew-token'")]
    MissingOdhBrewToken,
    #[error("operators {0:?}: kubeconfig is missing; add it to the operator or pass '--kubeconfig'")]
    MissingKubeconfig(Vec<String>),
    #[error("operators {0:?}: kubeconfig file does not exist")]
    KubeconfigNotFound(Vec<String>),
    #[error("operators {0:?} install from an index image; '--brew-token' must be provided")]
    MissingIibBrewToken(Vec<String>),
    #[error("'--local-operators-latest-iib-path' and '--s3-bucket-operators-latest-iib-path' are mutually exclusive")]
    ConflictingIibSources,
    #[error("'--aws-region' is required with '--s3-bucket-operators-latest-iib-path'")]
    MissingAwsRegion,
    #[error(transparent)]
    IibSource(#[from] addop_iib::IndexImageError),
    #[error("invalid product {input:?}: {reason}")]
    Product { input: String, reason: String },
    #[error("reading config file {path}: {reason}")]
    ConfigFile { path: String, reason: String },
}

/// Split `name=x;k=v;…` into a YAML mapping. `rosa` becomes a bool and
/// `target-namespaces` a list; everything else stays a string.
pub fn parse_product_kv(input: &str) -> Result<Mapping, InputError> {
    let mut map = Mapping::new();
    for pair in input.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let (k, v) = pair
            .split_once('=')
            .ok_or_else(|| InputError::Product { input: input.to_string(), reason: format!("expected key=value, got {:?}", pair) })?;
        let (k, v) = (k.trim(), v.trim());
        let value = match k {
            "rosa" => Value::Bool(v.eq_ignore_ascii_case("true")),
            "target-namespaces" => Value::Sequence(v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(|s| Value::String(s.to_string())).collect()),
            _ => Value::String(v.to_string()),
        };
        map.insert(Value::String(k.to_string()), value);
    }
    if !map.contains_key("name") {
        return Err(InputError::Product { input: input.to_string(), reason: "missing name".to_string() });
    }
    Ok(map)
}

pub fn parse_operator(input: &str) -> Result<OperatorSpec, InputError> {
    let map = parse_product_kv(input)?;
    serde_yaml::from_value(Value::Mapping(map)).map_err(|e| InputError::Product { input: input.to_string(), reason: e.to_string() })
}

pub fn parse_addon(input: &str) -> Result<AddonSpec, InputError> {
    let map = parse_product_kv(input)?;
    serde_yaml::from_value(Value::Mapping(map)).map_err(|e| InputError::Product { input: input.to_string(), reason: e.to_string() })
}

/// YAML config file. Present keys override the command line.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub action: Option<String>,
    pub operators: Option<Vec<OperatorSpec>>,
    pub addons: Option<Vec<AddonSpec>>,
    pub endpoint: Option<String>,
    pub ocm_token: Option<String>,
    pub brew_token: Option<String>,
    pub cluster_name: Option<String>,
    pub kubeconfig: Option<PathBuf>,
    pub parallel: Option<bool>,
    pub workers: Option<usize>,
    pub must_gather_output_dir: Option<PathBuf>,
    pub debug: Option<bool>,
    pub local_operators_latest_iib_path: Option<PathBuf>,
    pub s3_bucket_operators_latest_iib_path: Option<String>,
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub aws_region: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, InputError> {
        let err = |reason: String| InputError::ConfigFile { path: path.display().to_string(), reason };
        let raw = std::fs::read_to_string(path).map_err(|e| err(e.to_string()))?;
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&raw).map_err(|e| err(e.to_string()))
    }
}

/// Everything a run needs, after merging flags, env and the config file.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub action: Option<String>,
    pub operators: Vec<OperatorSpec>,
    pub addons: Vec<AddonSpec>,
    pub endpoint: String,
    pub ocm_token: Option<String>,
    pub brew_token: Option<String>,
    pub cluster_name: Option<String>,
    pub kubeconfig: Option<PathBuf>,
    pub parallel: bool,
    pub workers: Option<usize>,
    pub must_gather_output_dir: Option<PathBuf>,
    pub debug: bool,
    pub local_operators_latest_iib_path: Option<PathBuf>,
    pub s3_bucket_operators_latest_iib_path: Option<String>,
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub aws_region: Option<String>,
    pub job_name: Option<String>,
}

fn non_empty(v: Option<String>) -> Option<String> { v.filter(|s| !s.trim().is_empty()) }

impl Settings {
    pub fn merge_file(&mut self, file: FileConfig) {
        macro_rules! take {
            ($($field:ident),*) => { $( if let Some(v) = file.$field { self.$field = Some(v); } )* };
        }
        take!(action, ocm_token, brew_token, cluster_name, kubeconfig, workers, must_gather_output_dir, local_operators_latest_iib_path, s3_bucket_operators_latest_iib_path, aws_access_key_id, aws_secret_access_key, aws_region);
        if let Some(v) = file.endpoint {
            self.endpoint = v;
        }
        if let Some(v) = file.parallel {
            self.parallel = v;
        }
        if let Some(v) = file.debug {
            self.debug = v;
        }
        if let Some(ops) = file.operators {
            self.operators = ops;
        }
        if let Some(addons) = file.addons {
            self.addons = addons;
        }
    }

    /// Fill per-product gaps from the global `--cluster-name` / `--kubeconfig`.
    pub fn apply_globals(&mut self) {
        self.brew_token = non_empty(self.brew_token.take());
        self.ocm_token = non_empty(self.ocm_token.take());
        for op in &mut self.operators {
            if op.kubeconfig.is_none() {
                op.kubeconfig = self.kubeconfig.clone();
            }
        }
        for addon in &mut self.addons {
            if non_empty(addon.cluster_name.clone()).is_none() {
                addon.cluster_name = self.cluster_name.clone();
                if addon.kubeconfig.is_none() {
                    addon.kubeconfig = self.kubeconfig.clone();
                }
            }
        }
    }

    /// Checks that run before any action is built. Returns the run mode.
    pub fn validate(&self) -> Result<RunMode, InputError> {
        if !self.addons.is_empty() && self.ocm_token.is_none() {
            return Err(InputError::MissingOcmToken);
        }
        let mode = match self.action.as_deref() {
            None | Some("") => return Err(InputError::MissingAction(RunMode::SUPPORTED)),
            Some(a) => a.parse::<RunMode>().map_err(InputError::UnsupportedAction)?,
        };
        if self.operators.is_empty() && self.addons.is_empty() {
            return Err(InputError::NoProducts);
        }
        self.validate_operators()?;
        self.validate_addons()?;
        self.index_image_source()?;
        Ok(mode)
    }

    fn validate_operators(&self) -> Result<(), InputError> {
        let names = |f: fn(&OperatorSpec) -> bool| self.operators.iter().filter(|&o| f(o)).map(|o| o.name.clone()).collect::<Vec<_>>();
        let missing = names(|o| o.kubeconfig.is_none());
        if !missing.is_empty() {
            return Err(InputError::MissingKubeconfig(missing));
        }
        let not_found = names(|o| o.kubeconfig.as_ref().map(|p| !p.is_file()).unwrap_or(false));
        if !not_found.is_empty() {
            return Err(InputError::KubeconfigNotFound(not_found));
        }
        if self.brew_token.is_none() {
            let iib = names(|o| o.iib.as_deref().map(|i| !i.is_empty()).unwrap_or(false));
            if !iib.is_empty() {
                return Err(InputError::MissingIibBrewToken(iib));
            }
        }
        Ok(())
    }

    fn validate_addons(&self) -> Result<(), InputError> {
        let missing: Vec<_> = self.addons.iter().filter(|a| non_empty(a.cluster_name.clone()).is_none()).map(|a| a.name.clone()).collect();
        if !missing.is_empty() {
            return Err(InputError::MissingClusterName(missing));
        }
        let bad_env: Vec<_> = self
            .addons
            .iter()
            .filter(|a| a.ocm_env.as_deref().map(|e| e.parse::<OcmEnv>().is_err()).unwrap_or(false))
            .map(|a| a.name.clone())
            .collect();
        if !bad_env.is_empty() {
            return Err(InputError::InvalidOcmEnv(bad_env));
        }
        let odh_on_stage = self.addons.iter().any(|a| a.name == MANAGED_ODH && a.ocm_env.as_deref().unwrap_or(OcmEnv::Stage.as_str()) == OcmEnv::Stage.as_str());
        if odh_on_stage && self.brew_token.is_none() {
            return Err(InputError::MissingOdhBrewToken);
        }
        Ok(())
    }

    /// At most one table source; S3 needs a region.
    pub fn index_image_source(&self) -> Result<Option<TableSource>, InputError> {
        match (&self.local_operators_latest_iib_path, non_empty(self.s3_bucket_operators_latest_iib_path.clone())) {
            (Some(_), Some(_)) => Err(InputError::ConflictingIibSources),
            (Some(local), None) => Ok(Some(TableSource::Local(local.clone()))),
            (None, Some(s3)) => {
                let region = non_empty(self.aws_region.clone()).ok_or(InputError::MissingAwsRegion)?;
                Ok(Some(TableSource::from_s3_path(&s3, Some(region))?))
            }
            (None, None) => Ok(None),
        }
    }

    /// Add-ons first, then operators.
    pub fn descriptors(&self) -> Vec<ProductDescriptor> {
        self.addons.iter().cloned().map(ProductDescriptor::Addon).chain(self.operators.iter().cloned().map(ProductDescriptor::Operator)).collect()
    }
}

/// Product names grouped by kind, for logs.
pub fn product_names(settings: &Settings) -> BTreeMap<&'static str, Vec<String>> {
    let mut out = BTreeMap::new();
    if !settings.addons.is_empty() {
        out.insert("addons", settings.addons.iter().map(|a| a.name.clone()).collect());
    }
    if !settings.operators.is_empty() {
        out.insert("operators", settings.operators.iter().map(|o| o.name.clone()).collect());
    }
    out
}
