use std::{
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::Duration,
};

use futures::{FutureExt as _, future::join_all};
use tokio::{
    runtime::Handle,
    task::{Id, JoinError, JoinSet},
    time::{Instant, sleep},
};
use tracing::{debug, error, info, warn};

use super::{
    panic_message,
    report::{RunReport, StopReason, WorkerReport},
    runner::StateMachineRunner,
    StopSignal,
};
use crate::scenario::{
    Cluster, DynError, ServerHandle, Workload, WorkloadDefinition,
    context::{HookContext, RunShared},
    definition::{ConnectionMode, HookFn},
    error::{FailureKind, RunError, WorkerFailure},
    options::{ResolvedOptions, RunOptions},
};

/// Result of one worker task, stamped when the worker finished.
struct WorkerOutcome {
    thread_id: usize,
    detected_at: Instant,
    result: Result<WorkerReport, WorkerFailure>,
}

/// A worker failure together with the keys used to pick the one reported.
struct DetectedFailure {
    detected_at: Instant,
    thread_id: usize,
    sequence: u64,
    failure: WorkerFailure,
}

struct Connections {
    hooks: Arc<dyn ServerHandle>,
    workers: Vec<Arc<dyn ServerHandle>>,
}

/// Runs workload definitions against a cluster: `setup` once, then
/// `thread_count` concurrent [`StateMachineRunner`]s sharing the workload's
/// data, then `teardown` once, whatever happened in between.
#[derive(Clone)]
pub struct WorkloadScheduler {
    cluster: Arc<dyn Cluster>,
}

impl WorkloadScheduler {
    #[must_use]
    pub fn new(cluster: Arc<dyn Cluster>) -> Self {
        Self { cluster }
    }

    #[must_use]
    pub fn cluster(&self) -> Arc<dyn Cluster> {
        Arc::clone(&self.cluster)
    }

    /// Executes one workload run and reports success, or the first fatal
    /// worker error ordered by detection time, then worker index.
    pub async fn run<D>(
        &self,
        definition: &WorkloadDefinition<D>,
        options: &RunOptions,
    ) -> Result<RunReport, RunError>
    where
        D: Send + Sync + 'static,
    {
        let workload = definition.name().to_owned();
        let resolved = options
            .clone()
            .with_env_overrides()
            .resolve(definition)
            .map_err(|source| RunError::Config {
                workload: workload.clone(),
                source,
            })?;

        if let Some(reason) = definition.skip_reason(self.cluster.as_ref()) {
            info!(workload = workload.as_str(), reason = reason.as_str(), "skipping workload");
            return Ok(RunReport::skipped(workload, reason));
        }

        let connections = self
            .connect(definition.connection_mode(), resolved.thread_count)
            .await
            .map_err(|source| RunError::Connect {
                workload: workload.clone(),
                source,
            })?;

        let data = Arc::new(definition.make_data());
        let hook_ctx = HookContext::new(
            Arc::clone(&data),
            Arc::clone(&connections.hooks),
            &resolved.target,
            Arc::clone(&self.cluster),
            resolved.thread_count,
            resolved.iterations,
        );
        let mut teardown = TeardownGuard::new(workload.clone(), definition.teardown_hook(), hook_ctx.clone());

        info!(
            workload = workload.as_str(),
            threads = resolved.thread_count,
            iterations = resolved.iterations,
            seed = resolved.seed,
            target = resolved.target.as_str(),
            duration_secs = resolved.duration.map(|d| d.as_secs()),
            "starting workload"
        );
        let started = Instant::now();

        if let Some(setup) = definition.setup_hook() {
            if let Err(source) = call_hook(&setup, hook_ctx, "setup").await {
                error!(workload = workload.as_str(), error = %source, "workload setup failed");
                if let Err(teardown_err) = teardown.run().await {
                    warn!(workload = workload.as_str(), error = %teardown_err, "teardown after failed setup also failed");
                }
                return Err(RunError::Setup { workload, source });
            }
        }

        let stop = StopSignal::default();
        let run = Arc::new(RunShared {
            workload: workload.clone(),
            data,
            target: resolved.target.clone(),
            thread_count: resolved.thread_count,
            iterations: resolved.iterations,
            connection_cache: definition
                .passes_connection_cache()
                .then(|| self.cluster.connection_cache())
                .flatten(),
            retry_policy: definition.retry_policy().clone(),
            stop: stop.clone(),
        });

        let timer = resolved.duration.map(|duration| spawn_stop_timer(&stop, duration));
        let (reports, failures) = drive_workers(definition, &run, connections.workers, &resolved).await;
        if let Some(timer) = timer {
            timer.abort();
        }

        let teardown_result = teardown.run().await;
        let elapsed = started.elapsed();

        if let Some((first, additional_failures)) = first_failure(failures) {
            if let Err(teardown_err) = teardown_result {
                warn!(workload = workload.as_str(), error = %teardown_err, "teardown failed after worker failure");
            }
            error!(
                workload = workload.as_str(),
                thread_id = first.thread_id,
                state = first.state.as_str(),
                iteration = first.iteration,
                kind = %first.kind,
                error = %first.source,
                additional_failures = additional_failures.len(),
                "workload failed"
            );
            return Err(RunError::Worker {
                workload,
                failure: Box::new(first),
                additional_failures,
            });
        }

        teardown_result.map_err(|source| RunError::Teardown {
            workload: workload.clone(),
            source,
        })?;

        let report = RunReport {
            workload,
            skipped: None,
            seed: resolved.seed,
            thread_count: resolved.thread_count,
            workers: reports,
            stop_reason: stop.reason(),
            elapsed,
        };
        info!(
            workload = report.workload.as_str(),
            iterations = report.total_iterations(),
            retries = report.total_retries(),
            elapsed_ms = elapsed.as_millis(),
            "workload finished"
        );
        Ok(report)
    }

    /// Runs workloads one after another, stopping at the first failure.
    pub async fn run_serially(
        &self,
        workloads: &[Arc<dyn Workload>],
        options: &RunOptions,
    ) -> Result<Vec<RunReport>, RunError> {
        let mut reports = Vec::with_capacity(workloads.len());
        for workload in workloads {
            debug!(workload = workload.name(), "running workload serially");
            reports.push(workload.execute(self, options).await?);
        }
        Ok(reports)
    }

    /// Runs workloads concurrently against the same cluster. Every workload
    /// runs to completion; the first error in list order is returned.
    pub async fn run_in_parallel(
        &self,
        workloads: &[Arc<dyn Workload>],
        options: &RunOptions,
    ) -> Result<Vec<RunReport>, RunError> {
        info!(workloads = workloads.len(), "running workloads in parallel");
        let outcomes = join_all(
            workloads
                .iter()
                .map(|workload| workload.execute(self, options)),
        )
        .await;
        outcomes.into_iter().collect()
    }

    async fn connect(&self, mode: ConnectionMode, thread_count: usize) -> Result<Connections, DynError> {
        let hooks = self.cluster.connect().await?;
        let workers = match mode {
            ConnectionMode::Shared => std::iter::repeat_with(|| Arc::clone(&hooks))
                .take(thread_count)
                .collect(),
            ConnectionMode::PerWorker => {
                let mut workers = Vec::with_capacity(thread_count);
                for _ in 0..thread_count {
                    workers.push(self.cluster.connect().await?);
                }
                workers
            }
        };
        Ok(Connections { hooks, workers })
    }
}

/// Spawns every worker, then joins all of them. Failures do not abort
/// siblings; with `cancel_on_fatal` the first one raises the stop signal.
async fn drive_workers<D>(
    definition: &WorkloadDefinition<D>,
    run: &Arc<RunShared<D>>,
    connections: Vec<Arc<dyn ServerHandle>>,
    resolved: &ResolvedOptions,
) -> (Vec<WorkerReport>, Vec<DetectedFailure>)
where
    D: Send + Sync + 'static,
{
    let mut workers = JoinSet::new();
    let mut task_threads: HashMap<Id, usize> = HashMap::new();

    for (thread_id, server) in connections.into_iter().enumerate() {
        let seed = resolved.seed.wrapping_add(thread_id as u64);
        let runner = StateMachineRunner::new(
            definition.clone(),
            Arc::clone(run),
            server,
            thread_id,
            seed,
        );
        let stop = run.stop.clone();
        let cancel_on_fatal = resolved.cancel_on_fatal;

        let handle = workers.spawn(async move {
            let outcome = AssertUnwindSafe(runner.run()).catch_unwind().await;
            let result = outcome.unwrap_or_else(|panic| {
                Err(WorkerFailure {
                    thread_id,
                    state: "<runner>".to_owned(),
                    iteration: 0,
                    kind: FailureKind::Panicked,
                    source: format!("worker panicked: {}", panic_message(panic)).into(),
                })
            });
            if result.is_err() && cancel_on_fatal && stop.request(StopReason::FatalError) {
                debug!(thread_id, "first fatal error; asking remaining workers to stop");
            }
            WorkerOutcome {
                thread_id,
                detected_at: Instant::now(),
                result,
            }
        });
        task_threads.insert(handle.id(), thread_id);
    }

    let mut sequence = 0_u64;
    let mut reports = Vec::new();
    let mut failures = Vec::new();

    while let Some(joined) = workers.join_next().await {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(join_err) => join_error_outcome(join_err, &task_threads),
        };
        match outcome.result {
            Ok(report) => reports.push(report),
            Err(failure) => {
                warn!(
                    workload = run.workload.as_str(),
                    thread_id = outcome.thread_id,
                    error = %failure,
                    "worker failed"
                );
                failures.push(DetectedFailure {
                    detected_at: outcome.detected_at,
                    thread_id: outcome.thread_id,
                    sequence,
                    failure,
                });
                sequence += 1;
            }
        }
    }

    reports.sort_by_key(|report| report.thread_id);
    (reports, failures)
}

/// Converts an unexpected task failure into a worker outcome. Workers catch
/// their own panics, so this only sees runtime-level errors.
fn join_error_outcome(join_err: JoinError, task_threads: &HashMap<Id, usize>) -> WorkerOutcome {
    let thread_id = task_threads.get(&join_err.id()).copied().unwrap_or(usize::MAX);
    WorkerOutcome {
        thread_id,
        detected_at: Instant::now(),
        result: Err(WorkerFailure {
            thread_id,
            state: "<runner>".to_owned(),
            iteration: 0,
            kind: FailureKind::Fatal,
            source: format!("worker task failed: {join_err}").into(),
        }),
    }
}

/// Picks the failure to report: earliest detection, then lowest worker
/// index, then join order. Returns it followed by the others.
fn first_failure(mut failures: Vec<DetectedFailure>) -> Option<(WorkerFailure, Vec<WorkerFailure>)> {
    failures.sort_by_key(|f| (f.detected_at, f.thread_id, f.sequence));
    let mut ordered = failures.into_iter().map(|f| f.failure);
    let first = ordered.next()?;
    Some((first, ordered.collect()))
}

fn spawn_stop_timer(stop: &StopSignal, duration: Duration) -> tokio::task::JoinHandle<()> {
    let stop = stop.clone();
    tokio::spawn(async move {
        sleep(duration).await;
        if stop.request(StopReason::DurationElapsed) {
            info!(duration_secs = duration.as_secs(), "run duration elapsed; stopping workers");
        }
    })
}

async fn call_hook<D>(hook: &HookFn<D>, ctx: HookContext<D>, name: &str) -> Result<(), DynError> {
    debug!(hook = name, "running lifecycle hook");
    AssertUnwindSafe(hook(ctx))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(format!("{name} panicked: {}", panic_message(panic)).into()))
}

/// Runs `teardown` exactly once. If the run is abandoned (its future dropped)
/// while the guard is still armed, teardown is spawned on the current runtime.
struct TeardownGuard<D: Send + Sync + 'static> {
    workload: String,
    hook: Option<HookFn<D>>,
    ctx: HookContext<D>,
}

impl<D: Send + Sync + 'static> TeardownGuard<D> {
    fn new(workload: String, hook: Option<HookFn<D>>, ctx: HookContext<D>) -> Self {
        Self { workload, hook, ctx }
    }

    async fn run(&mut self) -> Result<(), DynError> {
        match self.hook.take() {
            Some(hook) => call_hook(&hook, self.ctx.clone(), "teardown").await,
            None => Ok(()),
        }
    }
}

impl<D: Send + Sync + 'static> Drop for TeardownGuard<D> {
    fn drop(&mut self) {
        let Some(hook) = self.hook.take() else {
            return;
        };
        warn!(workload = self.workload.as_str(), "run abandoned before teardown; spawning teardown");
        let ctx = self.ctx.clone();
        let workload = self.workload.clone();
        if let Ok(handle) = Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = call_hook(&hook, ctx, "teardown").await {
                    warn!(workload = workload.as_str(), error = %err, "abandoned-run teardown failed");
                }
            });
        } else {
            warn!(workload = workload.as_str(), "no runtime available; teardown skipped");
        }
    }
}
