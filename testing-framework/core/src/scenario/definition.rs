use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use futures::{FutureExt as _, future::BoxFuture};
use tracing::debug;

use super::{
    DynError,
    cluster::Cluster,
    context::{HookContext, WorkloadContext},
    error::ConfigError,
    retry::RetryPolicy,
    transitions::{Distribution, TransitionTable},
};

const DEFAULT_THREAD_COUNT: usize = 1;
const DEFAULT_ITERATIONS: u64 = 10;

pub type StateFuture = BoxFuture<'static, Result<(), DynError>>;
pub type HookFuture = BoxFuture<'static, Result<(), DynError>>;

pub(crate) type StateFn<D> = Arc<dyn Fn(WorkloadContext<D>) -> StateFuture + Send + Sync>;
pub(crate) type HookFn<D> = Arc<dyn Fn(HookContext<D>) -> HookFuture + Send + Sync>;
type DataFactory<D> = Arc<dyn Fn() -> D + Send + Sync>;
type SkipFn = Arc<dyn Fn(&dyn Cluster) -> Option<String> + Send + Sync>;

/// How workers obtain their server connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Every worker and both hooks use one connection.
    #[default]
    Shared,
    /// Each worker opens its own connection; hooks use a separate one.
    PerWorker,
}

/// Builder used by workload authors to describe a workload.
pub struct WorkloadBuilder<D> {
    name: String,
    data: DataFactory<D>,
    states: BTreeMap<String, StateFn<D>>,
    transitions: BTreeMap<String, Distribution>,
    terminal_states: BTreeSet<String>,
    start_state: Option<String>,
    setup: Option<HookFn<D>>,
    teardown: Option<HookFn<D>>,
    skip: Option<SkipFn>,
    thread_count: usize,
    iterations: u64,
    retry_policy: RetryPolicy,
    connection_mode: ConnectionMode,
    pass_connection_cache: bool,
}

impl<D> Clone for WorkloadBuilder<D> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            data: Arc::clone(&self.data),
            states: self.states.clone(),
            transitions: self.transitions.clone(),
            terminal_states: self.terminal_states.clone(),
            start_state: self.start_state.clone(),
            setup: self.setup.clone(),
            teardown: self.teardown.clone(),
            skip: self.skip.clone(),
            thread_count: self.thread_count,
            iterations: self.iterations,
            retry_policy: self.retry_policy.clone(),
            connection_mode: self.connection_mode,
            pass_connection_cache: self.pass_connection_cache,
        }
    }
}

impl<D: Send + Sync + 'static> WorkloadBuilder<D> {
    /// Start a workload whose shared data is produced fresh for every run by
    /// `data`.
    #[must_use]
    pub fn new(name: impl Into<String>, data: impl Fn() -> D + Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            data: Arc::new(data),
            states: BTreeMap::new(),
            transitions: BTreeMap::new(),
            terminal_states: BTreeSet::new(),
            start_state: None,
            setup: None,
            teardown: None,
            skip: None,
            thread_count: DEFAULT_THREAD_COUNT,
            iterations: DEFAULT_ITERATIONS,
            retry_policy: RetryPolicy::default(),
            connection_mode: ConnectionMode::default(),
            pass_connection_cache: false,
        }
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Replace the shared data factory.
    #[must_use]
    pub fn data(mut self, data: impl Fn() -> D + Send + Sync + 'static) -> Self {
        self.data = Arc::new(data);
        self
    }

    /// Declare (or replace) a state and its handler.
    #[must_use]
    pub fn state<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(WorkloadContext<D>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DynError>> + Send + 'static,
    {
        self.states
            .insert(name.into(), Arc::new(move |ctx| handler(ctx).boxed()));
        self
    }

    /// Remove a state and its transition row.
    #[must_use]
    pub fn without_state(mut self, name: &str) -> Self {
        self.states.remove(name);
        self.transitions.remove(name);
        self.terminal_states.remove(name);
        self
    }

    /// Set the row of next-state weights for `from`, replacing any previous
    /// row.
    #[must_use]
    pub fn transitions<I, S>(mut self, from: impl Into<String>, targets: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        self.transitions
            .insert(from.into(), Distribution::new(targets));
        self
    }

    #[must_use]
    pub fn start_state(mut self, name: impl Into<String>) -> Self {
        self.start_state = Some(name.into());
        self
    }

    /// Mark a state as an intended end of the state machine: a worker that
    /// finishes it stops cleanly.
    #[must_use]
    pub fn terminal_state(mut self, name: impl Into<String>) -> Self {
        self.terminal_states.insert(name.into());
        self
    }

    #[must_use]
    pub fn setup<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(HookContext<D>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DynError>> + Send + 'static,
    {
        self.setup = Some(Arc::new(move |ctx| hook(ctx).boxed()));
        self
    }

    #[must_use]
    pub fn teardown<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(HookContext<D>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DynError>> + Send + 'static,
    {
        self.teardown = Some(Arc::new(move |ctx| hook(ctx).boxed()));
        self
    }

    /// Run `hook` after the existing setup, if any.
    #[must_use]
    pub fn chain_setup<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(HookContext<D>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DynError>> + Send + 'static,
    {
        let hook = Arc::new(hook);
        let chained: HookFn<D> = match self.setup.take() {
            Some(base) => Arc::new(move |ctx: HookContext<D>| {
                let base = Arc::clone(&base);
                let hook = Arc::clone(&hook);
                async move {
                    base(ctx.clone()).await?;
                    hook(ctx).await
                }
                .boxed()
            }),
            None => Arc::new(move |ctx| hook(ctx).boxed()),
        };
        self.setup = Some(chained);
        self
    }

    /// Run `hook` before the existing teardown, if any. The existing
    /// teardown still runs when `hook` fails; the first error is returned.
    #[must_use]
    pub fn chain_teardown<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(HookContext<D>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DynError>> + Send + 'static,
    {
        let hook = Arc::new(hook);
        let chained: HookFn<D> = match self.teardown.take() {
            Some(base) => Arc::new(move |ctx: HookContext<D>| {
                let base = Arc::clone(&base);
                let hook = Arc::clone(&hook);
                async move {
                    let first = hook(ctx.clone()).await;
                    let second = base(ctx).await;
                    first.and(second)
                }
                .boxed()
            }),
            None => Arc::new(move |ctx| hook(ctx).boxed()),
        };
        self.teardown = Some(chained);
        self
    }

    /// Skip the whole workload on clusters it does not support. The
    /// predicate returns the reason for skipping.
    #[must_use]
    pub fn skip<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&dyn Cluster) -> Option<String> + Send + Sync + 'static,
    {
        self.skip = Some(Arc::new(predicate));
        self
    }

    #[must_use]
    pub const fn thread_count(mut self, thread_count: usize) -> Self {
        self.thread_count = thread_count;
        self
    }

    #[must_use]
    pub const fn iterations(mut self, iterations: u64) -> Self {
        self.iterations = iterations;
        self
    }

    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Transform the current retry policy.
    #[must_use]
    pub fn map_retry_policy(mut self, f: impl FnOnce(RetryPolicy) -> RetryPolicy) -> Self {
        self.retry_policy = f(self.retry_policy);
        self
    }

    #[must_use]
    pub const fn connection_mode(mut self, mode: ConnectionMode) -> Self {
        self.connection_mode = mode;
        self
    }

    /// Hand the cluster's connection cache to state handlers.
    #[must_use]
    pub const fn pass_connection_cache(mut self, pass: bool) -> Self {
        self.pass_connection_cache = pass;
        self
    }

    /// Validate and freeze the workload.
    pub fn build(self) -> Result<WorkloadDefinition<D>, ConfigError> {
        if self.thread_count == 0 {
            return Err(ConfigError::ZeroValue {
                field: "thread_count",
            });
        }
        if self.iterations == 0 {
            return Err(ConfigError::ZeroValue {
                field: "iterations",
            });
        }
        if self.states.is_empty() {
            return Err(ConfigError::NoStates);
        }
        let start = self.start_state.clone().ok_or(ConfigError::NoStartState)?;

        let declared: BTreeSet<String> = self.states.keys().cloned().collect();
        let table = TransitionTable::new(
            &declared,
            self.transitions.clone(),
            self.terminal_states.clone(),
            &start,
        )?;

        debug!(
            workload = self.name.as_str(),
            states = declared.len(),
            start_state = start.as_str(),
            "workload definition validated"
        );

        Ok(WorkloadDefinition {
            inner: Arc::new(DefinitionInner {
                builder: self,
                start_state: start,
                table,
            }),
        })
    }
}

struct DefinitionInner<D> {
    builder: WorkloadBuilder<D>,
    start_state: String,
    table: TransitionTable,
}

/// Immutable, validated workload. Cheap to clone and reusable across runs;
/// every run gets fresh shared data from the factory.
pub struct WorkloadDefinition<D> {
    inner: Arc<DefinitionInner<D>>,
}

impl<D> Clone for WorkloadDefinition<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Send + Sync + 'static> WorkloadDefinition<D> {
    /// Derive a new workload from this one: `mutator` receives a builder
    /// pre-populated with every part of the base and may override any of
    /// them. The base is left untouched.
    pub fn extend(
        &self,
        mutator: impl FnOnce(WorkloadBuilder<D>) -> WorkloadBuilder<D>,
    ) -> Result<Self, ConfigError> {
        mutator(self.to_builder()).build()
    }

    #[must_use]
    pub fn to_builder(&self) -> WorkloadBuilder<D> {
        self.inner.builder.clone()
    }
}

impl<D> WorkloadDefinition<D> {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.builder.name
    }

    #[must_use]
    pub fn start_state(&self) -> &str {
        &self.inner.start_state
    }

    #[must_use]
    pub fn transition_table(&self) -> &TransitionTable {
        &self.inner.table
    }

    #[must_use]
    pub fn state_names(&self) -> impl Iterator<Item = &str> {
        self.inner.builder.states.keys().map(String::as_str)
    }

    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.inner.builder.thread_count
    }

    #[must_use]
    pub fn iterations(&self) -> u64 {
        self.inner.builder.iterations
    }

    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.builder.retry_policy
    }

    #[must_use]
    pub fn connection_mode(&self) -> ConnectionMode {
        self.inner.builder.connection_mode
    }

    #[must_use]
    pub fn passes_connection_cache(&self) -> bool {
        self.inner.builder.pass_connection_cache
    }

    pub(crate) fn handler(&self, state: &str) -> Option<&StateFn<D>> {
        self.inner.builder.states.get(state)
    }

    pub(crate) fn setup_hook(&self) -> Option<HookFn<D>> {
        self.inner.builder.setup.clone()
    }

    pub(crate) fn teardown_hook(&self) -> Option<HookFn<D>> {
        self.inner.builder.teardown.clone()
    }

    pub(crate) fn make_data(&self) -> D {
        (self.inner.builder.data)()
    }

    pub(crate) fn skip_reason(&self, cluster: &dyn Cluster) -> Option<String> {
        self.inner
            .builder
            .skip
            .as_ref()
            .and_then(|predicate| predicate(cluster))
    }
}
