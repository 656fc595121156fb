//! External tools: `oc adm must-gather` for diagnostics and `aws s3 cp` for table downloads.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{anyhow, Context, Result};
use tokio::process::Command;
use tracing::{debug, info};

use crate::DiagnosticCollector;

/// Run `program args…` to completion and return its stdout.
///
/// A missing binary and a non-zero exit are both errors; the latter carries stderr.
pub async fn run_tool(program: &str, args: &[String], envs: &[(&str, &str)]) -> Result<String> {
    debug!(program, argc = args.len(), "running tool");
    let mut cmd = Command::new(program);
    cmd.args(args).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped()).kill_on_drop(true);
    for (k, v) in envs {
        cmd.env(k, v);
    }
    let out = match cmd.output().await {
        Ok(o) => o,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(anyhow!("{} not found on PATH", program)),
        Err(e) => return Err(e).with_context(|| format!("spawning {}", program)),
    };
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        return Err(anyhow!("{} exited with {}: {}", program, out.status, stderr.trim()));
    }
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

/// `oc adm must-gather` into a target directory.
#[derive(Debug, Clone)]
pub struct MustGather {
    oc: String,
}

impl Default for MustGather {
    fn default() -> Self {
        Self { oc: "oc".to_string() }
    }
}

impl MustGather {
    pub fn args(target_dir: &Path, kubeconfig: &Path) -> Vec<String> {
        vec![
            "adm".to_string(),
            "must-gather".to_string(),
            format!("--dest-dir={}", target_dir.display()),
            format!("--kubeconfig={}", kubeconfig.display()),
        ]
    }
}

#[async_trait::async_trait]
impl DiagnosticCollector for MustGather {
    async fn collect(&self, target_dir: &Path, kubeconfig: &Path) -> Result<()> {
        info!(dir = %target_dir.display(), kubeconfig = %kubeconfig.display(), "collecting must-gather");
        run_tool(&self.oc, &Self::args(target_dir, kubeconfig), &[]).await.map(|_| ())
    }
}

/// Object store backed by the `aws` CLI.
#[derive(Clone, Default)]
pub struct AwsCli {
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

impl std::fmt::Debug for AwsCli {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCli").field("access_key_id", &self.access_key_id.as_ref().map(|_| "<set>")).finish()
    }
}

impl AwsCli {
    pub fn copy_args(bucket: &str, key: &str, region: Option<&str>, dest: &Path) -> Vec<String> {
        let mut args = vec!["s3".to_string(), "cp".to_string(), format!("s3://{}/{}", bucket, key), dest.display().to_string()];
        if let Some(r) = region {
            args.push("--region".to_string());
            args.push(r.to_string());
        }
        args
    }
}

#[async_trait::async_trait]
impl addop_iib::ObjectStore for AwsCli {
    async fn download(&self, bucket: &str, key: &str, region: Option<&str>) -> Result<PathBuf> {
        let dest = std::env::temp_dir().join(format!("addop-iib-{}.json", uuid::Uuid::new_v4()));
        let mut envs: Vec<(&str, &str)> = Vec::new();
        if let Some(id) = self.access_key_id.as_deref() {
            envs.push(("AWS_ACCESS_KEY_ID", id));
        }
        if let Some(secret) = self.secret_access_key.as_deref() {
            envs.push(("AWS_SECRET_ACCESS_KEY", secret));
        }
        run_tool("aws", &Self::copy_args(bucket, key, region, &dest), &envs).await.with_context(|| format!("downloading s3://{}/{}", bucket, key))?;
        info!(bucket, key, dest = %dest.display(), "index image table downloaded");
        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_binary_reports_path_lookup() {
        let err = run_tool("addop-definitely-not-installed", &[], &[]).await.unwrap_err();
        assert!(err.to_string().contains("not found on PATH"), "err={}", err);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_tool_carries_stderr() {
        let args = vec!["-c".to_string(), "echo boom >&2; exit 3".to_string()];
        let err = run_tool("sh", &args, &[]).await.unwrap_err();
        assert!(err.to_string().contains("boom"), "err={}", err);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tool_env_is_passed_through() {
        let args = vec!["-c".to_string(), "printf %s \"$ADDOP_PROBE\"".to_string()];
        let out = run_tool("sh", &args, &[("ADDOP_PROBE", "hello")]).await.unwrap();
        assert_eq!(out, "hello");
    }

    #[test]
    fn must_gather_targets_dir_and_kubeconfig() {
        let args = MustGather::args(Path::new("/tmp/mg/op-c1"), Path::new("/kc"));
        assert_eq!(args, vec!["adm", "must-gather", "--dest-dir=/tmp/mg/op-c1", "--kubeconfig=/kc"]);
    }

    #[test]
    fn s3_copy_args_include_region_when_given() {
        let args = AwsCli::copy_args("bkt", "iib/table.json", Some("us-east-1"), Path::new("/tmp/t.json"));
        assert_eq!(args, vec!["s3", "cp", "s3://bkt/iib/table.json", "/tmp/t.json", "--region", "us-east-1"]);
        assert_eq!(AwsCli::copy_args("b", "k", None, Path::new("/x")).len(), 4);
    }
}
