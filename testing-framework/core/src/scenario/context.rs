use std::sync::Arc;

use serde_json::Value;

use super::{
    cluster::{Cluster, ServerError, ServerHandle},
    retry::RetryPolicy,
    runtime::{StopSignal, connections::ConnectionCache},
};

/// State shared by every worker of one run.
pub(crate) struct RunShared<D> {
    pub(crate) workload: String,
    pub(crate) data: Arc<D>,
    pub(crate) target: String,
    pub(crate) thread_count: usize,
    pub(crate) iterations: u64,
    pub(crate) connection_cache: Option<ConnectionCache>,
    pub(crate) retry_policy: RetryPolicy,
    pub(crate) stop: StopSignal,
}

/// Handle passed to every state handler invocation.
///
/// `data` is shared by all workers of the run and is handed out without any
/// locking: the harness never serialises access to it. Fields that several
/// workers mutate must carry their own synchronisation (atomics, mutexes,
/// latches), otherwise the workload is racing itself rather than the server.
pub struct WorkloadContext<D> {
    run: Arc<RunShared<D>>,
    server: Arc<dyn ServerHandle>,
    thread_id: usize,
    state: Arc<str>,
    iteration: u64,
}

impl<D> Clone for WorkloadContext<D> {
    fn clone(&self) -> Self {
        Self {
            run: Arc::clone(&self.run),
            server: Arc::clone(&self.server),
            thread_id: self.thread_id,
            state: Arc::clone(&self.state),
            iteration: self.iteration,
        }
    }
}

impl<D> WorkloadContext<D> {
    pub(crate) fn new(
        run: Arc<RunShared<D>>,
        server: Arc<dyn ServerHandle>,
        thread_id: usize,
        state: Arc<str>,
        iteration: u64,
    ) -> Self {
        Self {
            run,
            server,
            thread_id,
            state,
            iteration,
        }
    }

    #[must_use]
    pub fn data(&self) -> &D {
        &self.run.data
    }

    /// Owned handle to the shared data, for moving into spawned helpers.
    #[must_use]
    pub fn shared_data(&self) -> Arc<D> {
        Arc::clone(&self.run.data)
    }

    /// Zero-based worker index, stable for the whole run.
    #[must_use]
    pub const fn thread_id(&self) -> usize {
        self.thread_id
    }

    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.run.thread_count
    }

    /// Per-worker iteration budget.
    #[must_use]
    pub fn iterations(&self) -> u64 {
        self.run.iterations
    }

    /// Zero-based index of the iteration currently executing.
    #[must_use]
    pub const fn iteration(&self) -> u64 {
        self.iteration
    }

    #[must_use]
    pub fn state(&self) -> &str {
        &self.state
    }

    #[must_use]
    pub fn workload(&self) -> &str {
        &self.run.workload
    }

    /// Collection (or other namespace) the workload targets.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.run.target
    }

    #[must_use]
    pub fn server(&self) -> &Arc<dyn ServerHandle> {
        &self.server
    }

    #[must_use]
    pub fn connection_cache(&self) -> Option<&ConnectionCache> {
        self.run.connection_cache.as_ref()
    }

    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.run.retry_policy
    }

    /// True once the run asked workers to stop at their next iteration
    /// boundary. Long handlers may poll it to finish early.
    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.run.stop.is_requested()
    }

    pub async fn run_command(&self, database: &str, command: Value) -> Result<Value, ServerError> {
        self.server.run_command(database, command).await
    }
}

/// Handle passed to `setup` and `teardown`.
pub struct HookContext<D> {
    data: Arc<D>,
    server: Arc<dyn ServerHandle>,
    target: Arc<str>,
    cluster: Arc<dyn Cluster>,
    thread_count: usize,
    iterations: u64,
}

impl<D> Clone for HookContext<D> {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
            server: Arc::clone(&self.server),
            target: Arc::clone(&self.target),
            cluster: Arc::clone(&self.cluster),
            thread_count: self.thread_count,
            iterations: self.iterations,
        }
    }
}

impl<D> HookContext<D> {
    pub(crate) fn new(
        data: Arc<D>,
        server: Arc<dyn ServerHandle>,
        target: &str,
        cluster: Arc<dyn Cluster>,
        thread_count: usize,
        iterations: u64,
    ) -> Self {
        Self {
            data,
            server,
            target: Arc::from(target),
            cluster,
            thread_count,
            iterations,
        }
    }

    #[must_use]
    pub fn data(&self) -> &D {
        &self.data
    }

    #[must_use]
    pub fn shared_data(&self) -> Arc<D> {
        Arc::clone(&self.data)
    }

    #[must_use]
    pub fn server(&self) -> &Arc<dyn ServerHandle> {
        &self.server
    }

    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    #[must_use]
    pub fn cluster(&self) -> &Arc<dyn Cluster> {
        &self.cluster
    }

    #[must_use]
    pub const fn thread_count(&self) -> usize {
        self.thread_count
    }

    #[must_use]
    pub const fn iterations(&self) -> u64 {
        self.iterations
    }

    pub async fn run_command(&self, database: &str, command: Value) -> Result<Value, ServerError> {
        self.server.run_command(database, command).await
    }
}
