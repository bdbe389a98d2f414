//! Workload definitions and the machinery that executes them.
//!
//! A workload is a weighted state machine: named async state handlers, a
//! transition table over those names, shared `data`, and optional
//! `setup`/`teardown` hooks. [`WorkloadScheduler`] runs one
//! [`StateMachineRunner`] per worker thread against a [`Cluster`].

mod chooser;
mod cluster;
mod context;
mod definition;
mod error;
mod options;
mod retry;
pub mod runtime;
mod transitions;
mod workload;

pub use chooser::WeightedRandomChooser;
pub use cluster::{
    Cluster, ClusterKind, ServerError, ServerErrorKind, ServerHandle, TRANSIENT_TRANSACTION_LABEL,
};
pub use context::{HookContext, WorkloadContext};
pub use definition::{ConnectionMode, HookFuture, StateFuture, WorkloadBuilder, WorkloadDefinition};
pub use error::{AssertionFailure, ConfigError, FailureKind, RunError, WorkerFailure};
pub use options::{OptionsError, ResolvedOptions, RunOptions};
pub use retry::{DirtyFlags, Disposition, ErrorCategory, RetryMode, RetryPolicy};
pub use runtime::{
    connections::ConnectionCache,
    report::{RunReport, StopReason, WorkerReport, WorkerStop},
    runner::StateMachineRunner,
    scheduler::WorkloadScheduler,
};
pub use transitions::{Distribution, NextStates, TransitionTable};
pub use workload::Workload;

/// Error type returned by state handlers and lifecycle hooks.
pub type DynError = Box<dyn std::error::Error + Send + Sync + 'static>;
