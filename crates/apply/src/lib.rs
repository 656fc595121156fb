//! addop apply: build actions from product descriptors and run them.

#![forbid(unsafe_code)]

pub mod action;
pub mod builder;
pub mod diagnostics;
pub mod engine;

pub use action::{AddonAction, DiagnosticsContext, OperatorAction, ProductAction};
pub use builder::{ActionBuilder, Backends, BuildError, RunConfig};
pub use diagnostics::{capture_dir, CaptureOutcome, DiagnosticCapture};
pub use engine::{ActionOutcome, ActionReport, Engine, ExecutionMode, RunError, RunReport};
