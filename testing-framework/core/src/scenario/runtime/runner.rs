use std::{panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt as _;
use rand::{SeedableRng as _, rngs::StdRng};
use tokio::time::sleep;
use tracing::{debug, warn};

use super::{
    panic_message,
    report::{WorkerReport, WorkerStop},
};
use crate::scenario::{
    DynError, ServerHandle, WeightedRandomChooser, WorkloadDefinition,
    context::{RunShared, WorkloadContext},
    error::{ConfigError, FailureKind, WorkerFailure},
    retry::{Disposition, RetryMode},
    transitions::NextStates,
};

/// Per-worker state loop. Starts at the workload's start state, runs the
/// current state's handler, then picks the next state from the transition
/// table with a seeded random source, until the iteration budget runs out,
/// a terminal state finishes, or the run requests a stop.
pub struct StateMachineRunner<D> {
    definition: WorkloadDefinition<D>,
    run: Arc<RunShared<D>>,
    server: Arc<dyn ServerHandle>,
    thread_id: usize,
    seed: u64,
    rng: StdRng,
    consecutive_retries: u32,
}

impl<D: Send + Sync + 'static> StateMachineRunner<D> {
    pub(crate) fn new(
        definition: WorkloadDefinition<D>,
        run: Arc<RunShared<D>>,
        server: Arc<dyn ServerHandle>,
        thread_id: usize,
        seed: u64,
    ) -> Self {
        Self {
            definition,
            run,
            server,
            thread_id,
            seed,
            rng: StdRng::seed_from_u64(seed),
            consecutive_retries: 0,
        }
    }

    #[must_use]
    pub const fn thread_id(&self) -> usize {
        self.thread_id
    }

    /// Drives the state loop to completion. A fatal error stops this worker
    /// only; siblings are unaffected unless the run cancels on fatal errors.
    pub async fn run(mut self) -> Result<WorkerReport, WorkerFailure> {
        let mut report = WorkerReport::new(self.thread_id, self.seed);
        let mut current: Arc<str> = Arc::from(self.definition.start_state());

        debug!(
            workload = self.run.workload.as_str(),
            thread_id = self.thread_id,
            seed = self.seed,
            start_state = &*current,
            "worker starting"
        );

        loop {
            if let Some(reason) = self.run.stop.reason() {
                report.stop = WorkerStop::StopRequested(reason);
                break;
            }

            let iteration = report.iterations;
            self.execute_state(&current, iteration, &mut report).await?;
            report.iterations += 1;
            *report.state_visits.entry(current.to_string()).or_default() += 1;

            let next = self
                .definition
                .transition_table()
                .next_state_distribution(&current)
                .map_err(|source| self.config_failure(&current, iteration, source))?;

            let distribution = match next {
                NextStates::Terminal => {
                    report.stop = WorkerStop::TerminalState(current.to_string());
                    break;
                }
                NextStates::Distribution(distribution) => distribution,
            };

            if report.iterations >= self.run.iterations {
                report.stop = WorkerStop::BudgetExhausted;
                break;
            }

            let chosen = WeightedRandomChooser::choose(distribution, &mut self.rng)
                .map_err(|source| self.config_failure(&current, iteration, source))?;
            debug!(
                thread_id = self.thread_id,
                from = &*current,
                to = chosen,
                "state transition"
            );
            current = Arc::from(chosen);
        }

        debug!(
            workload = self.run.workload.as_str(),
            thread_id = self.thread_id,
            iterations = report.iterations,
            retries = report.retries,
            stop = ?report.stop,
            "worker finished"
        );
        Ok(report)
    }

    /// Runs one state, applying the retry policy to handler errors. Returns
    /// once the state succeeded, or a retryable failure was absorbed in
    /// [`RetryMode::Advance`].
    async fn execute_state(
        &mut self,
        state: &Arc<str>,
        iteration: u64,
        report: &mut WorkerReport,
    ) -> Result<(), WorkerFailure> {
        let handler = self
            .definition
            .handler(state)
            .cloned()
            .ok_or_else(|| {
                self.config_failure(
                    state,
                    iteration,
                    ConfigError::UnknownState {
                        state: state.to_string(),
                    },
                )
            })?;
        let policy = &self.run.retry_policy;

        loop {
            let ctx = WorkloadContext::new(
                Arc::clone(&self.run),
                Arc::clone(&self.server),
                self.thread_id,
                Arc::clone(state),
                iteration,
            );
            let outcome = AssertUnwindSafe(async { handler(ctx).await })
                .catch_unwind()
                .await;

            let error = match outcome {
                Ok(Ok(())) => {
                    self.consecutive_retries = 0;
                    return Ok(());
                }
                Ok(Err(error)) => error,
                Err(panic) => {
                    let message = format!("state handler panicked: {}", panic_message(panic));
                    return Err(self.failure(state, iteration, FailureKind::Panicked, message.into()));
                }
            };

            match policy.classify(&error) {
                Disposition::Fatal => {
                    return Err(self.failure(state, iteration, FailureKind::Fatal, error));
                }
                Disposition::Retryable if self.consecutive_retries >= policy.retry_limit() => {
                    let kind = FailureKind::RetriesExhausted {
                        retries: self.consecutive_retries,
                    };
                    return Err(self.failure(state, iteration, kind, error));
                }
                Disposition::Retryable => {
                    self.consecutive_retries += 1;
                    report.retries += 1;
                    warn!(
                        workload = self.run.workload.as_str(),
                        thread_id = self.thread_id,
                        state = &**state,
                        attempt = self.consecutive_retries,
                        error = %error,
                        "retryable error in state handler"
                    );

                    let backoff = policy.retry_backoff();
                    if !backoff.is_zero() {
                        sleep(backoff).await;
                    }
                    if policy.retry_mode() == RetryMode::Advance {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn failure(
        &self,
        state: &str,
        iteration: u64,
        kind: FailureKind,
        source: DynError,
    ) -> WorkerFailure {
        WorkerFailure {
            thread_id: self.thread_id,
            state: state.to_owned(),
            iteration,
            kind,
            source,
        }
    }

    fn config_failure(&self, state: &str, iteration: u64, source: ConfigError) -> WorkerFailure {
        self.failure(state, iteration, FailureKind::Fatal, source.into())
    }
}
