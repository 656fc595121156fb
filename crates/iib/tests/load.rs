use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use addop_iib::{load_table, IndexImageError, IndexImageResolver, ObjectStore, TableSource};

const TABLE: &str = r#"{
  "v4.15": {
    "4_15_job": {
      "operators": {
        "operator-1": {"new-iib": true, "iib": "operator-1-iib"},
        "operator-2": {"new-iib": false, "iib": "operator-2-iib"}
      },
      "ci": "jenkins"
    }
  }
}"#;

/// Writes the table into a scratch dir on every download and counts calls.
struct FakeStore {
    dir: tempfile::TempDir,
    body: String,
    downloads: AtomicUsize,
}

impl FakeStore {
    fn new(body: &str) -> Arc<Self> {
        Arc::new(Self { dir: tempfile::tempdir().unwrap(), body: body.to_string(), downloads: AtomicUsize::new(0) })
    }
}

#[async_trait::async_trait]
impl ObjectStore for FakeStore {
    async fn download(&self, bucket: &str, key: &str, _region: Option<&str>) -> anyhow::Result<PathBuf> {
        let n = self.downloads.fetch_add(1, Ordering::SeqCst);
        let path = self.dir.path().join(format!("{}-{}-{}", bucket, key.replace('/', "_"), n));
        std::fs::write(&path, &self.body)?;
        Ok(path)
    }
}

struct FailingStore;

#[async_trait::async_trait]
impl ObjectStore for FailingStore {
    async fn download(&self, bucket: &str, key: &str, _region: Option<&str>) -> anyhow::Result<PathBuf> {
        anyhow::bail!("access denied for s3://{}/{}", bucket, key)
    }
}

#[tokio::test]
async fn local_file_loads_and_resolves() {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(TABLE.as_bytes()).unwrap();
    let table = load_table(&TableSource::Local(f.path().to_path_buf()), &FailingStore).await.unwrap();
    assert_eq!(table.resolve("4.15", "4_15_job", "operator-1").unwrap().as_deref(), Some("operator-1-iib"));
    assert_eq!(table.resolve("4.15", "4_15_job", "operator-2").unwrap(), None);
}

#[tokio::test]
async fn missing_local_file_is_source_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let err = load_table(&TableSource::Local(dir.path().join("nope.json")), &FailingStore).await.unwrap_err();
    assert!(matches!(err, IndexImageError::SourceUnavailable { .. }), "err={:?}", err);
}

#[tokio::test]
async fn unparseable_file_is_malformed() {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(b"not json").unwrap();
    let err = load_table(&TableSource::Local(f.path().to_path_buf()), &FailingStore).await.unwrap_err();
    assert!(matches!(err, IndexImageError::MalformedTable { .. }), "err={:?}", err);
}

#[tokio::test]
async fn object_store_download_is_read_then_removed() {
    let store = FakeStore::new(TABLE);
    let src = TableSource::from_s3_path("bucket/iib/latest.json", None).unwrap();
    let table = load_table(&src, store.as_ref()).await.unwrap();
    assert_eq!(table.versions().collect::<Vec<_>>(), vec!["v4.15"]);
    assert_eq!(std::fs::read_dir(store.dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn object_store_failure_is_source_unavailable() {
    let src = TableSource::from_s3_path("bucket/latest.json", Some("us-east-1".into())).unwrap();
    let err = load_table(&src, &FailingStore).await.unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("access denied"), "msg={}", msg);
}

#[tokio::test]
async fn resolver_loads_once_for_many_operators() {
    let store = FakeStore::new(TABLE);
    let src = TableSource::from_s3_path("bucket/latest.json", None).unwrap();
    let resolver = Arc::new(IndexImageResolver::new(src, store.clone()));
    assert!(!resolver.is_loaded());

    let mut handles = Vec::new();
    for op in ["operator-1", "operator-2", "operator-3", "operator-1"] {
        let r = resolver.clone();
        handles.push(tokio::spawn(async move { r.resolve("4.15", "4_15_job", op).await }));
    }
    let mut images = Vec::new();
    for h in handles { images.push(h.await.unwrap().unwrap()); }

    assert_eq!(images, vec![Some("operator-1-iib".to_string()), None, None, Some("operator-1-iib".to_string())]);
    assert_eq!(store.downloads.load(Ordering::SeqCst), 1);
    assert!(resolver.is_loaded());
}

#[tokio::test]
async fn resolver_surfaces_unknown_job() {
    let store = FakeStore::new(TABLE);
    let resolver = IndexImageResolver::new(TableSource::from_s3_path("b/k.json", None).unwrap(), store);
    let err = resolver.resolve("4.15", "4_16_job", "operator-1").await.unwrap_err();
    assert!(err.to_string().contains("4_16_job"));
}
