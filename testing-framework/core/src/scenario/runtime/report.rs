use std::{collections::BTreeMap, time::Duration};

/// Why a run asked its workers to stop early.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The configured wall-clock duration elapsed.
    DurationElapsed,
    /// Another worker failed and the run cancels on the first fatal error.
    FatalError,
}

/// How a worker's state loop ended.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum WorkerStop {
    #[default]
    BudgetExhausted,
    TerminalState(String),
    StopRequested(StopReason),
}

/// Outcome of one worker that finished without a fatal error.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub thread_id: usize,
    pub seed: u64,
    pub iterations: u64,
    pub retries: u64,
    pub state_visits: BTreeMap<String, u64>,
    pub stop: WorkerStop,
}

impl WorkerReport {
    #[must_use]
    pub fn new(thread_id: usize, seed: u64) -> Self {
        Self {
            thread_id,
            seed,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn visits(&self, state: &str) -> u64 {
        self.state_visits.get(state).copied().unwrap_or_default()
    }
}

/// Summary of a successful (or skipped) workload run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunReport {
    pub workload: String,
    /// Set when the workload's skip predicate declined the cluster.
    pub skipped: Option<String>,
    pub seed: u64,
    pub thread_count: usize,
    /// Worker reports ordered by thread id.
    pub workers: Vec<WorkerReport>,
    pub stop_reason: Option<StopReason>,
    pub elapsed: Duration,
}

impl RunReport {
    #[must_use]
    pub fn skipped(workload: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            workload: workload.into(),
            skipped: Some(reason.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn is_skipped(&self) -> bool {
        self.skipped.is_some()
    }

    #[must_use]
    pub fn total_iterations(&self) -> u64 {
        self.workers.iter().map(|worker| worker.iterations).sum()
    }

    #[must_use]
    pub fn total_retries(&self) -> u64 {
        self.workers.iter().map(|worker| worker.retries).sum()
    }
}
