use std::fmt;

use thiserror::Error;

use super::DynError;

/// A malformed workload definition. Detected before `setup` runs and never
/// retried.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("workload declares no states")]
    NoStates,
    #[error("no start state configured")]
    NoStartState,
    #[error("start state '{state}' is not a declared state")]
    MissingStartState { state: String },
    #[error("transition source '{state}' is not a declared state")]
    UndeclaredSource { state: String },
    #[error("transition '{from}' -> '{to}' targets an undeclared state")]
    UndeclaredTarget { from: String, to: String },
    #[error("transition '{from}' -> '{to}' has invalid weight {weight}")]
    InvalidWeight { from: String, to: String, weight: f64 },
    #[error("transition '{from}' -> '{to}' is listed more than once")]
    DuplicateTarget { from: String, to: String },
    #[error("terminal state '{state}' is not a declared state")]
    UndeclaredTerminal { state: String },
    #[error("terminal state '{state}' has outgoing transitions with positive weight")]
    TerminalWithTransitions { state: String },
    #[error("state '{state}' has no transitions and is not declared terminal")]
    MissingTransitions { state: String },
    #[error("state '{state}' has no outgoing transition with positive weight")]
    NoOutgoingWeight { state: String },
    #[error("state '{state}' is unreachable from start state '{start}'")]
    UnreachableState { state: String, start: String },
    #[error("state '{state}' has no handler")]
    UnknownState { state: String },
    #[error("cannot choose from a distribution with zero total weight over {states:?}")]
    ZeroWeightDistribution { states: Vec<String> },
    #[error("{field} must be non-zero")]
    ZeroValue { field: &'static str },
}

/// Raised by [`workload_assert!`](crate::workload_assert) inside a state
/// handler. Always fatal.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("assertion failed: {message}")]
pub struct AssertionFailure {
    pub message: String,
}

impl AssertionFailure {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Returns an [`AssertionFailure`] from the enclosing handler when the
/// condition does not hold.
#[macro_export]
macro_rules! workload_assert {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::scenario::AssertionFailure::new(format!($($arg)+)).into());
        }
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// The retry policy classified the error as fatal.
    Fatal,
    /// A retryable error kept recurring past the policy's bound.
    RetriesExhausted { retries: u32 },
    /// The state handler panicked.
    Panicked,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fatal => f.write_str("fatal error"),
            Self::RetriesExhausted { retries } => {
                write!(f, "retries exhausted after {retries} attempts")
            }
            Self::Panicked => f.write_str("panic"),
        }
    }
}

/// Failure of a single worker, with enough context to reproduce it.
#[derive(Debug, Error)]
#[error("worker {thread_id} failed in state '{state}' at iteration {iteration} ({kind}): {source}")]
pub struct WorkerFailure {
    pub thread_id: usize,
    pub state: String,
    pub iteration: u64,
    pub kind: FailureKind,
    #[source]
    pub source: DynError,
}

/// Errors surfaced by [`WorkloadScheduler::run`](super::WorkloadScheduler::run).
#[derive(Debug, Error)]
pub enum RunError {
    #[error("workload '{workload}' is misconfigured: {source}")]
    Config {
        workload: String,
        #[source]
        source: ConfigError,
    },
    #[error("workload '{workload}' could not connect to the cluster: {source}")]
    Connect {
        workload: String,
        #[source]
        source: DynError,
    },
    #[error("workload '{workload}' setup failed: {source}")]
    Setup {
        workload: String,
        #[source]
        source: DynError,
    },
    #[error("workload '{workload}' {failure}")]
    Worker {
        workload: String,
        #[source]
        failure: Box<WorkerFailure>,
        /// Failures of other workers, in the same order.
        additional_failures: Vec<WorkerFailure>,
    },
    #[error("workload '{workload}' teardown failed: {source}")]
    Teardown {
        workload: String,
        #[source]
        source: DynError,
    },
}

impl RunError {
    #[must_use]
    pub fn workload(&self) -> &str {
        match self {
            Self::Config { workload, .. }
            | Self::Connect { workload, .. }
            | Self::Setup { workload, .. }
            | Self::Worker { workload, .. }
            | Self::Teardown { workload, .. } => workload,
        }
    }

    /// The failing worker, if the run failed inside a state handler.
    #[must_use]
    pub fn worker_failure(&self) -> Option<&WorkerFailure> {
        match self {
            Self::Worker { failure, .. } => Some(failure),
            _ => None,
        }
    }
}
