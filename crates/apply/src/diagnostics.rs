//! Best-effort diagnostic bundle collection for failed products.
//!
//! Capture never returns an error: whatever happens here is logged and the
//! caller keeps reporting the original action failure.
//!
//! Captures for the same cluster are serialised, and a cluster gets at most
//! one bundle per run: later failures on that cluster reuse it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use addop_ops::DiagnosticCollector;
use metrics::counter;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    Collected(PathBuf),
    MissingCredentials,
    Failed(String),
}

type DirSlot = Arc<tokio::sync::Mutex<Option<PathBuf>>>;

#[derive(Clone)]
pub struct DiagnosticCapture {
    collector: Arc<dyn DiagnosticCollector>,
    /// Per target dir: the bundle collected there this run, if any.
    slots: Arc<Mutex<HashMap<PathBuf, DirSlot>>>,
}

/// `<root>/must-gather/<cluster>`
pub fn capture_dir(target_root: &Path, cluster_name: &str) -> PathBuf {
    target_root.join("must-gather").join(cluster_name)
}

impl DiagnosticCapture {
    pub fn new(collector: Arc<dyn DiagnosticCollector>) -> Self {
        Self { collector, slots: Arc::default() }
    }

    fn slot(&self, dir: &Path) -> DirSlot {
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slots.entry(dir.to_path_buf()).or_default().clone()
    }

    pub async fn capture(&self, target_root: &Path, cluster_name: &str, kubeconfig: &Path) -> CaptureOutcome {
        match tokio::fs::metadata(kubeconfig).await {
            Ok(m) if m.is_file() => {}
            Ok(_) | Err(_) => {
                warn!(cluster = %cluster_name, kubeconfig = %kubeconfig.display(), "kubeconfig not readable; skipping diagnostics");
                counter!("addop_diagnostics_skipped_total", 1u64);
                return CaptureOutcome::MissingCredentials;
            }
        }

        let dir = capture_dir(target_root, cluster_name);
        let slot = self.slot(&dir);
        let mut collected = slot.lock().await;
        if let Some(existing) = collected.as_ref() {
            info!(cluster = %cluster_name, dir = %existing.display(), "diagnostics already collected for cluster; reusing");
            return CaptureOutcome::Collected(existing.clone());
        }

        let result = match tokio::fs::create_dir_all(&dir).await {
            Ok(()) => self.collector.collect(&dir, kubeconfig).await,
            Err(e) => Err(anyhow::Error::new(e).context(format!("creating {}", dir.display()))),
        };
        match result {
            Ok(()) => {
                info!(cluster = %cluster_name, dir = %dir.display(), "diagnostics collected");
                counter!("addop_diagnostics_collected_total", 1u64);
                *collected = Some(dir.clone());
                CaptureOutcome::Collected(dir)
            }
            Err(e) => {
                error!(cluster = %cluster_name, dir = %dir.display(), error = %format!("{:#}", e), "diagnostics collection failed");
                if let Err(rm) = tokio::fs::remove_dir_all(&dir).await {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        warn!(dir = %dir.display(), error = %rm, "failed to remove partial diagnostics");
                    }
                }
                counter!("addop_diagnostics_failed_total", 1u64);
                CaptureOutcome::Failed(format!("{:#}", e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    use std::sync::atomic::{AtomicUsize, Ordering};

    struct WritingCollector {
        fail: bool,
        calls: AtomicUsize,
    }

    impl WritingCollector {
        fn new(fail: bool) -> Self {
            Self { fail, calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait::async_trait]
    impl DiagnosticCollector for WritingCollector {
        async fn collect(&self, target_dir: &Path, _kubeconfig: &Path) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::fs::write(target_dir.join("bundle.txt"), b"partial").await?;
            if self.fail {
                anyhow::bail!("oc adm must-gather exited with 1");
            }
            Ok(())
        }
    }

    /// Succeeds on the first call only.
    struct FlakyCollector {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl DiagnosticCollector for FlakyCollector {
        async fn collect(&self, target_dir: &Path, _kubeconfig: &Path) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            tokio::fs::write(target_dir.join(format!("bundle-{}.txt", n)), b"data").await?;
            if n > 0 {
                anyhow::bail!("second must-gather failed");
            }
            Ok(())
        }
    }

    fn kubeconfig(dir: &Path) -> PathBuf {
        let p = dir.join("kubeconfig");
        std::fs::write(&p, "apiVersion: v1\nkind: Config\n").unwrap();
        p
    }

    #[tokio::test]
    async fn collected_bundle_lands_under_cluster_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let kc = kubeconfig(tmp.path());
        let cap = DiagnosticCapture::new(Arc::new(WritingCollector::new(false)));
        let out = cap.capture(tmp.path(), "c1", &kc).await;
        let expected = tmp.path().join("must-gather").join("c1");
        assert_eq!(out, CaptureOutcome::Collected(expected.clone()));
        assert!(expected.join("bundle.txt").exists());
    }

    #[tokio::test]
    async fn missing_kubeconfig_is_reported_not_raised() {
        let tmp = tempfile::tempdir().unwrap();
        let cap = DiagnosticCapture::new(Arc::new(WritingCollector::new(false)));
        let out = cap.capture(tmp.path(), "c1", &tmp.path().join("nope")).await;
        assert_eq!(out, CaptureOutcome::MissingCredentials);
        assert!(!tmp.path().join("must-gather").exists());
    }

    #[tokio::test]
    async fn failed_collection_removes_partial_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let kc = kubeconfig(tmp.path());
        let cap = DiagnosticCapture::new(Arc::new(WritingCollector::new(true)));
        let out = cap.capture(tmp.path(), "c1", &kc).await;
        assert!(matches!(out, CaptureOutcome::Failed(ref m) if m.contains("must-gather")), "out={:?}", out);
        assert!(!capture_dir(tmp.path(), "c1").exists());
    }

    #[tokio::test]
    async fn one_bundle_per_cluster_even_when_captures_overlap() {
        let tmp = tempfile::tempdir().unwrap();
        let kc = kubeconfig(tmp.path());
        let collector = Arc::new(FlakyCollector { calls: AtomicUsize::new(0) });
        let cap = DiagnosticCapture::new(collector.clone());
        let other = cap.clone();

        let (a, b) = tokio::join!(cap.capture(tmp.path(), "shared", &kc), other.capture(tmp.path(), "shared", &kc));
        let dir = capture_dir(tmp.path(), "shared");
        assert_eq!(a, CaptureOutcome::Collected(dir.clone()));
        assert_eq!(b, CaptureOutcome::Collected(dir.clone()));
        assert_eq!(collector.calls.load(Ordering::SeqCst), 1);
        assert!(dir.join("bundle-0.txt").exists());
    }

    #[tokio::test]
    async fn failed_capture_is_retried_by_the_next_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let kc = kubeconfig(tmp.path());
        let failing = Arc::new(WritingCollector::new(true));
        let cap = DiagnosticCapture::new(failing.clone());
        assert!(matches!(cap.capture(tmp.path(), "c1", &kc).await, CaptureOutcome::Failed(_)));
        assert!(matches!(cap.capture(tmp.path(), "c1", &kc).await, CaptureOutcome::Failed(_)));
        assert_eq!(failing.calls.load(Ordering::SeqCst), 2);
    }
}
