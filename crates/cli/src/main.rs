use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use addop_apply::{ActionBuilder, Backends, DiagnosticCapture, Engine, ExecutionMode, RunConfig};
use addop_kubehub::KubeInspector;
use addop_ops::{ocm::DEFAULT_SSO_ENDPOINT, AwsCli, MustGather, OcmAddons, OlmOperators};
use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tracing::{error, info};

mod input;

use input::{product_names, FileConfig, Settings};

/// Install or uninstall OpenShift operators and managed add-ons.
#[derive(Parser, Debug)]
#[command(name = "addopctl", version, about)]
struct Cli {
    /// Action to perform: install | uninstall
    #[arg(short = 'a', long = "action")]
    action: Option<String>,

    /// Operator, as 'name=op1;namespace=ns;channel=stable;source=redhat-operators;target-namespaces=ns1,ns2;source-image=img;iib=img;timeout=60m;kubeconfig=path'
    #[arg(short = 'o', long = "operator", action = ArgAction::Append)]
    operator: Vec<String>,

    /// Addon, as 'name=addon1;param1=1;rosa=true;ocm-env=stage;cluster-name=c;timeout=30m'
    #[arg(long = "addon", action = ArgAction::Append)]
    addon: Vec<String>,

    /// SSO token endpoint
    #[arg(short = 'e', long = "endpoint", default_value = DEFAULT_SSO_ENDPOINT)]
    endpoint: String,

    #[arg(short = 't', long = "ocm-token", env = "OCM_TOKEN", hide_env_values = true)]
    ocm_token: Option<String>,

    /// Needed for index-image operator installs and managed-odh on stage
    #[arg(long = "brew-token", env = "BREW_TOKEN", hide_env_values = true)]
    brew_token: Option<String>,

    /// Default cluster for add-ons that do not name one
    #[arg(short = 'c', long = "cluster-name")]
    cluster_name: Option<String>,

    /// Default kubeconfig for operators that do not name one
    #[arg(long = "kubeconfig")]
    kubeconfig: Option<PathBuf>,

    /// YAML file; any key present overrides the command line
    #[arg(long = "yaml-config-file")]
    yaml_config_file: Option<PathBuf>,

    /// Run products concurrently
    #[arg(short = 'p', long = "parallel", action = ArgAction::SetTrue)]
    parallel: bool,

    /// Parallel worker bound (default: one per product)
    #[arg(long = "workers")]
    workers: Option<usize>,

    /// Collect must-gather here when an install fails
    #[arg(long = "must-gather-output-dir")]
    must_gather_output_dir: Option<PathBuf>,

    #[arg(long = "debug", action = ArgAction::SetTrue)]
    debug: bool,

    /// Local operators latest-IIB JSON file
    #[arg(long = "local-operators-latest-iib-path")]
    local_operators_latest_iib_path: Option<PathBuf>,

    /// Operators latest-IIB JSON in S3, as bucket/key
    #[arg(long = "s3-bucket-operators-latest-iib-path")]
    s3_bucket_operators_latest_iib_path: Option<String>,

    #[arg(long = "aws-access-key-id", env = "AWS_ACCESS_KEY_ID", hide_env_values = true)]
    aws_access_key_id: Option<String>,

    #[arg(long = "aws-secret-access-key", env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    aws_secret_access_key: Option<String>,

    #[arg(long = "aws-region")]
    aws_region: Option<String>,

    /// CI build job keying the IIB table (default: $PARENT_JOB_NAME, then $JOB_NAME)
    #[arg(long = "job-name")]
    job_name: Option<String>,
}

impl Cli {
    fn into_settings(self) -> Result<Settings> {
        let operators = self.operator.iter().map(|o| input::parse_operator(o)).collect::<Result<Vec<_>, _>>()?;
        let addons = self.addon.iter().map(|a| input::parse_addon(a)).collect::<Result<Vec<_>, _>>()?;
        let job_name = self.job_name.or_else(|| std::env::var("PARENT_JOB_NAME").or_else(|_| std::env::var("JOB_NAME")).ok());
        let mut settings = Settings {
            action: self.action,
            operators,
            addons,
            endpoint: self.endpoint,
            ocm_token: self.ocm_token,
            brew_token: self.brew_token,
            cluster_name: self.cluster_name,
            kubeconfig: self.kubeconfig,
            parallel: self.parallel,
            workers: self.workers,
            must_gather_output_dir: self.must_gather_output_dir,
            debug: self.debug,
            local_operators_latest_iib_path: self.local_operators_latest_iib_path,
            s3_bucket_operators_latest_iib_path: self.s3_bucket_operators_latest_iib_path,
            aws_access_key_id: self.aws_access_key_id,
            aws_secret_access_key: self.aws_secret_access_key,
            aws_region: self.aws_region,
            job_name: job_name.filter(|j| !j.is_empty()),
        };
        if let Some(path) = self.yaml_config_file.as_deref() {
            settings.merge_file(FileConfig::load(path)?);
        }
        settings.apply_globals();
        Ok(settings)
    }
}

fn init_tracing(debug: bool) {
    let env = std::env::var("ADDOP_LOG").unwrap_or_else(|_| if debug { "debug" } else { "info" }.to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("ADDOP_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid ADDOP_METRICS_ADDR; expected host:port");
        }
    }
}

async fn run(settings: Settings) -> Result<()> {
    let mode = settings.validate()?;
    let index_image_source = settings.index_image_source()?;
    info!(mode = %mode, products = ?product_names(&settings), parallel = settings.parallel, "user input verified");

    let config = RunConfig {
        mode,
        must_gather_dir: settings.must_gather_output_dir.clone(),
        index_image_source,
        job_name: settings.job_name.clone(),
        brew_token: settings.brew_token.clone(),
    };
    let backends = Backends {
        operators: Arc::new(OlmOperators::new()),
        addons: Arc::new(OcmAddons::new(settings.ocm_token.clone().unwrap_or_default(), settings.endpoint.clone())?),
        inspector: Arc::new(KubeInspector),
        object_store: Arc::new(AwsCli { access_key_id: settings.aws_access_key_id.clone(), secret_access_key: settings.aws_secret_access_key.clone() }),
    };
    let actions = ActionBuilder::new(&config, backends).build(settings.descriptors()).await.context("preparing products")?;

    let exec_mode = ExecutionMode::select(settings.parallel, actions.len());
    let mut engine = Engine::new(DiagnosticCapture::new(Arc::new(MustGather::default())));
    if let Some(n) = settings.workers {
        engine = engine.with_workers(n);
    }
    let report = engine.run(mode, exec_mode, actions).await;
    let report = report.into_result()?;
    info!(summary = %report.summary(), "all products done");
    Ok(())
}

#[tokio::main]
async fn main() {
    let start = Instant::now();
    let settings = match Cli::parse().into_settings() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("addopctl: {:#}", e);
            std::process::exit(1);
        }
    };
    init_tracing(settings.debug);
    init_metrics();

    let result = run(settings).await;
    info!(elapsed_secs = start.elapsed().as_secs(), "total execution time");
    if let Err(e) = result {
        error!(error = %format!("{:#}", e), "run failed");
        std::process::exit(1);
    }
}
