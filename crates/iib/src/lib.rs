//! addop index images: which operators get an override (IIB) image for a
//! given cluster version and CI build job.
//!
//! The table is published by the CI trigger job as JSON keyed by
//! `v<major>.<minor>`, then by job name:
//!
//! ```json
//! { "v4.15": { "4_15_job": { "operators": { "operator-1": { "iib": "img", "new-iib": true } } } } }
//! ```

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum IndexImageError {
    #[error("index image source {source_desc} unavailable: {reason}")]
    SourceUnavailable { source_desc: String, reason: String },
    #[error("index image table from {source_desc} is malformed: {reason}")]
    MalformedTable { source_desc: String, reason: String },
    #[error("missing {version} / {job} in index image table")]
    UnknownVersionOrJob { version: String, job: String },
    #[error("invalid index image source: {0}")]
    InvalidSource(String),
}

/// One operator's entry under a build job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperatorEntry {
    /// Absent for operators the CI job did not build.
    #[serde(rename = "iib", default, skip_serializing_if = "Option::is_none")]
    pub override_image: Option<String>,
    /// Set when the CI trigger produced a fresh image for this job.
    #[serde(rename = "new-iib", alias = "triggered", default)]
    pub eligible: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobEntry {
    #[serde(default)]
    pub operators: BTreeMap<String, OperatorEntry>,
}

/// Versioned override-image table. Read-only after load.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct IndexImageTable {
    versions: BTreeMap<String, BTreeMap<String, JobEntry>>,
}

/// `4.15` and `v4.15` both map to the table key `v4.15`.
pub fn version_key(version: &str) -> String {
    let v = version.trim();
    if v.starts_with('v') { v.to_string() } else { format!("v{}", v) }
}

impl IndexImageTable {
    pub fn parse(raw: &str, source_desc: &str) -> Result<Self, IndexImageError> {
        serde_json::from_str(raw).map_err(|e| IndexImageError::MalformedTable { source_desc: source_desc.to_string(), reason: e.to_string() })
    }

    pub fn versions(&self) -> impl Iterator<Item = &str> { self.versions.keys().map(String::as_str) }

    /// Override image for `operator` on cluster `version` (`major.minor`) and CI `job`.
    ///
    /// A missing version/job pair is an error: the table is stale or the run
    /// is misconfigured. A missing or non-eligible operator is `None`.
    pub fn resolve(&self, version: &str, job: &str, operator: &str) -> Result<Option<String>, IndexImageError> {
        let job_entry = self
            .versions
            .get(&version_key(version))
            .and_then(|jobs| jobs.get(job))
            .ok_or_else(|| IndexImageError::UnknownVersionOrJob { version: version.to_string(), job: job.to_string() })?;
        Ok(job_entry.operators.get(operator).filter(|e| e.eligible).and_then(|e| e.override_image.clone()))
    }
}

/// Where the table comes from. Exactly one source is configured per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableSource {
    Local(PathBuf),
    ObjectStore { bucket: String, key: String, region: Option<String> },
}

impl TableSource {
    /// Parse `bucket/path/to/table.json` (an optional `s3://` prefix is accepted).
    pub fn from_s3_path(path: &str, region: Option<String>) -> Result<Self, IndexImageError> {
        let trimmed = path.trim().trim_start_matches("s3://");
        match trimmed.split_once('/') {
            Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
                Ok(TableSource::ObjectStore { bucket: bucket.to_string(), key: key.to_string(), region })
            }
            _ => Err(IndexImageError::InvalidSource(format!("{:?}: expect <bucket>/<key>", path))),
        }
    }
}

impl fmt::Display for TableSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableSource::Local(p) => write!(f, "{}", p.display()),
            TableSource::ObjectStore { bucket, key, .. } => write!(f, "s3://{}/{}", bucket, key),
        }
    }
}

/// Object storage download: fetch `bucket/key` into a local file and return its path.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn download(&self, bucket: &str, key: &str, region: Option<&str>) -> anyhow::Result<PathBuf>;
}

async fn read_source(path: &Path, source_desc: &str) -> Result<String, IndexImageError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| IndexImageError::SourceUnavailable { source_desc: source_desc.to_string(), reason: e.to_string() })
}

/// Fetch and parse the table. One blocking read per call.
pub async fn load_table(source: &TableSource, store: &dyn ObjectStore) -> Result<IndexImageTable, IndexImageError> {
    let desc = source.to_string();
    let raw = match source {
        TableSource::Local(path) => read_source(path, &desc).await?,
        TableSource::ObjectStore { bucket, key, region } => {
            let local = store
                .download(bucket, key, region.as_deref())
                .await
                .map_err(|e| IndexImageError::SourceUnavailable { source_desc: desc.clone(), reason: format!("{:#}", e) })?;
            let raw = read_source(&local, &desc).await;
            if let Err(e) = tokio::fs::remove_file(&local).await {
                debug!(path = %local.display(), error = %e, "failed to remove downloaded table");
            }
            raw?
        }
    };
    let table = IndexImageTable::parse(&raw, &desc)?;
    info!(source = %desc, versions = table.versions.len(), "index image table loaded");
    Ok(table)
}

/// Run-scoped resolver: loads the table lazily, at most once, and answers
/// per-operator lookups from the cached copy.
pub struct IndexImageResolver {
    source: TableSource,
    store: Arc<dyn ObjectStore>,
    table: OnceCell<Arc<IndexImageTable>>,
}

impl IndexImageResolver {
    pub fn new(source: TableSource, store: Arc<dyn ObjectStore>) -> Self {
        Self { source, store, table: OnceCell::new() }
    }

    pub fn source(&self) -> &TableSource { &self.source }

    pub fn is_loaded(&self) -> bool { self.table.initialized() }

    pub async fn table(&self) -> Result<Arc<IndexImageTable>, IndexImageError> {
        self.table
            .get_or_try_init(|| async { load_table(&self.source, self.store.as_ref()).await.map(Arc::new) })
            .await
            .cloned()
    }

    pub async fn resolve(&self, version: &str, job: &str, operator: &str) -> Result<Option<String>, IndexImageError> {
        let table = self.table().await?;
        let resolved = table.resolve(version, job, operator)?;
        match &resolved {
            Some(image) => info!(operator = %operator, version = %version, job = %job, image = %image, "override image resolved"),
            None => warn!(operator = %operator, version = %version, job = %job, "no eligible override image; using catalog default"),
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(eligible: bool) -> IndexImageTable {
        let raw = serde_json::json!({
            "v4.15": {
                "4_15_job": {
                    "operators": { "operator-1": { "new-iib": eligible, "iib": "operator-1-iib" } },
                    "ci": "jenkins"
                }
            }
        });
        IndexImageTable::parse(&raw.to_string(), "inline").unwrap()
    }

    #[test]
    fn eligible_operator_resolves_to_image() {
        let t = sample(true);
        assert_eq!(t.resolve("4.15", "4_15_job", "operator-1").unwrap().as_deref(), Some("operator-1-iib"));
        assert_eq!(t.resolve("v4.15", "4_15_job", "operator-1").unwrap().as_deref(), Some("operator-1-iib"));
    }

    #[test]
    fn absent_or_ineligible_operator_is_none() {
        assert_eq!(sample(true).resolve("4.15", "4_15_job", "operator-2").unwrap(), None);
        assert_eq!(sample(false).resolve("4.15", "4_15_job", "operator-1").unwrap(), None);
    }

    #[test]
    fn unknown_job_or_version_is_an_error_naming_both() {
        let t = sample(true);
        let msg = t.resolve("4.15", "4_16_job", "operator-1").unwrap_err().to_string();
        assert!(msg.contains("4.15") && msg.contains("4_16_job"), "msg={}", msg);
        let err = t.resolve("1.2", "4_15_job", "operator-1").unwrap_err();
        assert!(matches!(err, IndexImageError::UnknownVersionOrJob { ref version, .. } if version == "1.2"));
    }

    #[test]
    fn triggered_alias_marks_eligibility() {
        let raw = r#"{"v4.14": {"job": {"operators": {"op": {"iib": "img", "triggered": true}}}}}"#;
        let t = IndexImageTable::parse(raw, "inline").unwrap();
        assert_eq!(t.resolve("4.14", "job", "op").unwrap().as_deref(), Some("img"));
    }

    #[test]
    fn entries_without_an_image_do_not_spoil_the_table() {
        let raw = r#"{"v4.15": {"job": {"operators": {
            "built": {"iib": "img", "new-iib": true},
            "skipped": {"new-iib": false},
            "flagged-but-empty": {"new-iib": true}
        }}}}"#;
        let t = IndexImageTable::parse(raw, "inline").unwrap();
        assert_eq!(t.resolve("4.15", "job", "built").unwrap().as_deref(), Some("img"));
        assert_eq!(t.resolve("4.15", "job", "skipped").unwrap(), None);
        assert_eq!(t.resolve("4.15", "job", "flagged-but-empty").unwrap(), None);
    }

    #[test]
    fn flat_shape_is_rejected_as_malformed() {
        let raw = r#"{"operator-1": "image"}"#;
        let err = IndexImageTable::parse(raw, "flat.json").unwrap_err();
        assert!(matches!(err, IndexImageError::MalformedTable { .. }));
        assert!(err.to_string().contains("flat.json"));
    }

    #[test]
    fn s3_paths_split_on_first_slash() {
        let s = TableSource::from_s3_path("s3://bucket/dir/latest.json", Some("us-east-1".into())).unwrap();
        assert_eq!(s, TableSource::ObjectStore { bucket: "bucket".into(), key: "dir/latest.json".into(), region: Some("us-east-1".into()) });
        assert_eq!(s.to_string(), "s3://bucket/dir/latest.json");
        assert!(TableSource::from_s3_path("bucket-only", None).is_err());
        assert!(TableSource::from_s3_path("/key", None).is_err());
    }
}
