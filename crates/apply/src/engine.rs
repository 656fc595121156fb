//! Run bound actions sequentially (fail-fast) or in parallel (collect all), and
//! report per-action outcomes in input order.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use addop_core::{ProductKind, RunMode};
use futures::future::join_all;
use futures::FutureExt;
use metrics::{counter, histogram};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::action::ProductAction;
use crate::diagnostics::{CaptureOutcome, DiagnosticCapture};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Sequential,
    Parallel,
}

impl ExecutionMode {
    /// Parallelism only applies to runs with more than one action.
    pub fn select(parallel_requested: bool, action_count: usize) -> Self {
        if parallel_requested && action_count > 1 { ExecutionMode::Parallel } else { ExecutionMode::Sequential }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExecutionMode::Sequential => "sequential",
            ExecutionMode::Parallel => "parallel",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Succeeded,
    Failed(String),
    /// Not started because an earlier action failed (sequential mode).
    Skipped,
}

impl ActionOutcome {
    pub fn is_failed(&self) -> bool { matches!(self, ActionOutcome::Failed(_)) }
}

#[derive(Debug, Clone)]
pub struct ActionReport {
    pub index: usize,
    pub kind: ProductKind,
    pub name: String,
    pub cluster: String,
    pub outcome: ActionOutcome,
    pub elapsed: Duration,
    pub diagnostics: Option<CaptureOutcome>,
}

impl ActionReport {
    fn pending(index: usize, action: &dyn ProductAction, outcome: ActionOutcome) -> Self {
        Self {
            index,
            kind: action.kind(),
            name: action.name().to_string(),
            cluster: action.cluster().to_string(),
            outcome,
            elapsed: Duration::ZERO,
            diagnostics: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_mode: RunMode,
    pub exec_mode: ExecutionMode,
    /// One entry per action, in input order.
    pub results: Vec<ActionReport>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool { self.results.iter().all(|r| r.outcome == ActionOutcome::Succeeded) }

    pub fn failures(&self) -> Vec<&ActionReport> { self.results.iter().filter(|r| r.outcome.is_failed()).collect() }

    pub fn successes(&self) -> Vec<&ActionReport> { self.results.iter().filter(|r| r.outcome == ActionOutcome::Succeeded).collect() }

    pub fn skipped(&self) -> Vec<&ActionReport> { self.results.iter().filter(|r| r.outcome == ActionOutcome::Skipped).collect() }

    /// Succeeded and failed products named separately.
    pub fn summary(&self) -> String {
        let names = |rs: Vec<&ActionReport>| rs.iter().map(|r| format!("{} {}", r.kind, r.name)).collect::<Vec<_>>().join(", ");
        let mut out = format!("{} ({}): succeeded: [{}]", self.run_mode, self.exec_mode, names(self.successes()));
        let failed: Vec<String> = self
            .failures()
            .iter()
            .map(|r| match &r.outcome {
                ActionOutcome::Failed(e) => format!("{} {}: {}", r.kind, r.name, e),
                _ => format!("{} {}", r.kind, r.name),
            })
            .collect();
        if !failed.is_empty() {
            out.push_str(&format!("; failed: [{}]", failed.join("; ")));
        }
        let skipped = self.skipped();
        if !skipped.is_empty() {
            out.push_str(&format!("; skipped: [{}]", names(skipped)));
        }
        out
    }

    pub fn into_result(self) -> Result<RunReport, RunError> {
        if self.succeeded() { Ok(self) } else { Err(RunError::ActionsFailed(self)) }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("{}", .0.summary())]
    ActionsFailed(RunReport),
}

pub struct Engine {
    capture: DiagnosticCapture,
    workers: Option<usize>,
}

impl Engine {
    pub fn new(capture: DiagnosticCapture) -> Self {
        Self { capture, workers: None }
    }

    /// Bound the parallel pool. Defaults to one worker per action.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers.max(1));
        self
    }

    pub async fn run(&self, run_mode: RunMode, exec_mode: ExecutionMode, actions: Vec<Arc<dyn ProductAction>>) -> RunReport {
        info!(mode = %run_mode, exec = %exec_mode, actions = actions.len(), "run starting");
        let results = match exec_mode {
            ExecutionMode::Sequential => self.run_sequential(&actions).await,
            ExecutionMode::Parallel => self.run_parallel(&actions).await,
        };
        let report = RunReport { run_mode, exec_mode, results };
        if report.succeeded() {
            info!(summary = %report.summary(), "run finished");
        } else {
            error!(summary = %report.summary(), "run failed");
        }
        report
    }

    async fn run_sequential(&self, actions: &[Arc<dyn ProductAction>]) -> Vec<ActionReport> {
        let mut results = Vec::with_capacity(actions.len());
        let mut failed = false;
        for (index, action) in actions.iter().enumerate() {
            if failed {
                warn!(index, kind = %action.kind(), product = %action.name(), "skipped after earlier failure");
                results.push(ActionReport::pending(index, action.as_ref(), ActionOutcome::Skipped));
                continue;
            }
            let report = execute_one(index, action.clone(), &self.capture).await;
            failed = report.outcome.is_failed();
            results.push(report);
        }
        results
    }

    async fn run_parallel(&self, actions: &[Arc<dyn ProductAction>]) -> Vec<ActionReport> {
        let permits = Arc::new(Semaphore::new(self.workers.unwrap_or(actions.len()).max(1)));
        let handles = actions.iter().cloned().enumerate().map(|(index, action)| {
            let permits = permits.clone();
            let capture = self.capture.clone();
            tokio::spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                execute_one(index, action, &capture).await
            })
        });
        // join_all yields in submission order whatever the completion order.
        join_all(handles)
            .await
            .into_iter()
            .zip(actions)
            .enumerate()
            .map(|(index, (joined, action))| match joined {
                Ok(report) => report,
                Err(e) => {
                    error!(index, kind = %action.kind(), product = %action.name(), error = %e, "worker aborted");
                    counter!("addop_actions_failed_total", 1u64, "kind" => action.kind().as_str());
                    ActionReport::pending(index, action.as_ref(), ActionOutcome::Failed(format!("worker aborted: {}", e)))
                }
            })
            .collect()
    }
}

/// Execute one action; on failure, run its diagnostic capture before returning.
async fn execute_one(index: usize, action: Arc<dyn ProductAction>, capture: &DiagnosticCapture) -> ActionReport {
    let kind = action.kind();
    info!(index, kind = %kind, product = %action.name(), cluster = %action.cluster(), "action starting");
    counter!("addop_actions_total", 1u64, "kind" => kind.as_str());
    let t0 = Instant::now();
    let result = match AssertUnwindSafe(action.execute()).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(anyhow::anyhow!("action panicked: {}", panic_message(payload.as_ref()))),
    };
    let elapsed = t0.elapsed();
    histogram!("addop_action_latency_ms", elapsed.as_millis() as f64, "kind" => kind.as_str());

    let mut report = ActionReport::pending(index, action.as_ref(), ActionOutcome::Succeeded);
    report.elapsed = elapsed;
    match result {
        Ok(()) => info!(index, kind = %kind, product = %action.name(), elapsed_ms = elapsed.as_millis() as u64, "action succeeded"),
        Err(e) => {
            let msg = format!("{:#}", e);
            error!(index, kind = %kind, product = %action.name(), cluster = %action.cluster(), error = %msg, "action failed");
            counter!("addop_actions_failed_total", 1u64, "kind" => kind.as_str());
            if let Some(ctx) = action.diagnostics() {
                report.diagnostics = Some(capture.capture(&ctx.target_root, &ctx.cluster_name, &ctx.kubeconfig).await);
            }
            report.outcome = ActionOutcome::Failed(msg);
        }
    }
    report
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parallel_needs_more_than_one_action() {
        assert_eq!(ExecutionMode::select(true, 1), ExecutionMode::Sequential);
        assert_eq!(ExecutionMode::select(true, 0), ExecutionMode::Sequential);
        assert_eq!(ExecutionMode::select(false, 5), ExecutionMode::Sequential);
        assert_eq!(ExecutionMode::select(true, 2), ExecutionMode::Parallel);
    }

    fn report(name: &str, outcome: ActionOutcome) -> ActionReport {
        ActionReport {
            index: 0,
            kind: ProductKind::Operator,
            name: name.into(),
            cluster: "c1".into(),
            outcome,
            elapsed: Duration::ZERO,
            diagnostics: None,
        }
    }

    #[test]
    fn summary_separates_successes_from_failures() {
        let r = RunReport {
            run_mode: RunMode::Install,
            exec_mode: ExecutionMode::Sequential,
            results: vec![report("a", ActionOutcome::Succeeded), report("b", ActionOutcome::Failed("boom".into())), report("c", ActionOutcome::Skipped)],
        };
        let s = r.summary();
        assert!(s.contains("succeeded: [operator a]"), "{}", s);
        assert!(s.contains("failed: [operator b: boom]"), "{}", s);
        assert!(s.contains("skipped: [operator c]"), "{}", s);
        assert!(!r.succeeded());
        let err = r.into_result().unwrap_err();
        assert!(err.to_string().contains("operator b: boom"));
    }

    #[test]
    fn panic_payloads_become_messages() {
        let s: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(s.as_ref()), "boom");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned boom"));
        assert_eq!(panic_message(owned.as_ref()), "owned boom");
        let other: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(other.as_ref()), "unknown panic payload");
    }
}
