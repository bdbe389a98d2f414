use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use fsm_framework_core::{
    scenario::{
        ClusterKind, ConfigError, ConnectionMode, DynError, FailureKind, HookContext, RunError,
        RunOptions, ServerError, StopReason, WorkerStop, WorkloadBuilder, WorkloadContext,
        WorkloadScheduler,
    },
    workload_assert,
};
use fsm_framework_workflows::WorkloadBuilderExt as _;
use serde_json::json;
use tests_workflows::{MemoryCluster, init_tracing};
use tokio::time::sleep;

#[derive(Clone, Default)]
struct Journal {
    visits: Arc<Mutex<Vec<(usize, String)>>>,
    setups: Arc<AtomicUsize>,
    teardowns: Arc<AtomicUsize>,
    attempts: Arc<AtomicU64>,
}

impl Journal {
    fn path(&self, thread_id: usize) -> Vec<String> {
        self.visits
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == thread_id)
            .map(|(_, state)| state.clone())
            .collect()
    }
}

async fn visit(ctx: WorkloadContext<Journal>) -> Result<(), DynError> {
    ctx.data()
        .visits
        .lock()
        .unwrap()
        .push((ctx.thread_id(), ctx.state().to_owned()));
    Ok(())
}

async fn ping(ctx: WorkloadContext<Journal>) -> Result<(), DynError> {
    ctx.data().attempts.fetch_add(1, Ordering::SeqCst);
    ctx.run_command("admin", json!({ "ping": 1 }))
        .await
        .and_then(ServerError::check_reply)?;
    visit(ctx).await
}

async fn napping_visit(ctx: WorkloadContext<Journal>) -> Result<(), DynError> {
    sleep(Duration::from_millis(2)).await;
    visit(ctx).await
}

async fn trip_on_thread_three(ctx: WorkloadContext<Journal>) -> Result<(), DynError> {
    workload_assert!(ctx.thread_id() != 3, "thread {} tripped", ctx.thread_id());
    visit(ctx).await
}

async fn count_setup(ctx: HookContext<Journal>) -> Result<(), DynError> {
    ctx.data().setups.fetch_add(1, Ordering::SeqCst);
    Ok(())
}

async fn count_teardown(ctx: HookContext<Journal>) -> Result<(), DynError> {
    ctx.data().teardowns.fetch_add(1, Ordering::SeqCst);
    Ok(())
}

fn alternating(journal: &Journal) -> WorkloadBuilder<Journal> {
    let journal = journal.clone();
    WorkloadBuilder::new("alternating", move || journal.clone())
        .state("a", visit)
        .state("b", visit)
        .transitions("a", [("b", 1.0)])
        .transitions("b", [("a", 1.0)])
        .start_state("a")
        .setup(count_setup)
        .teardown(count_teardown)
}

fn scheduler(cluster: &Arc<MemoryCluster>) -> WorkloadScheduler {
    WorkloadScheduler::new(cluster.clone())
}

#[tokio::test(flavor = "multi_thread")]
async fn certain_transitions_visit_states_in_order() -> Result<()> {
    init_tracing();
    let cluster = MemoryCluster::default().into_shared();
    let journal = Journal::default();
    let definition = alternating(&journal).iterations(4).build()?;

    scheduler(&cluster)
        .run(&definition, &RunOptions::new().thread_count(1))
        .await?;

    assert_eq!(journal.path(0), ["a", "b", "a", "b"]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn five_workers_share_one_setup() -> Result<()> {
    init_tracing();
    let cluster = MemoryCluster::default().into_shared();
    let journal = Journal::default();
    let definition = alternating(&journal).thread_count(5).iterations(10).build()?;

    let report = scheduler(&cluster).run(&definition, &RunOptions::new()).await?;

    assert_eq!(journal.setups.load(Ordering::SeqCst), 1);
    assert_eq!(journal.teardowns.load(Ordering::SeqCst), 1);
    assert_eq!(report.workers.len(), 5);
    for thread_id in 0..5 {
        assert_eq!(journal.path(thread_id).len(), 10);
    }
    assert_eq!(cluster.connects(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn one_fatal_worker_fails_the_run() -> Result<()> {
    init_tracing();
    let cluster = MemoryCluster::default().into_shared();
    let journal = Journal::default();
    let definition = alternating(&journal)
        .state("b", trip_on_thread_three)
        .thread_count(5)
        .iterations(6)
        .build()?;

    let err = scheduler(&cluster)
        .run(&definition, &RunOptions::new())
        .await
        .unwrap_err();

    let RunError::Worker {
        failure,
        additional_failures,
        ..
    } = &err
    else {
        panic!("expected a worker failure, got {err}");
    };
    assert_eq!(failure.thread_id, 3);
    assert_eq!(failure.state, "b");
    assert_eq!(failure.kind, FailureKind::Fatal);
    assert!(additional_failures.is_empty());
    assert_eq!(journal.teardowns.load(Ordering::SeqCst), 1);
    assert_eq!(journal.path(0).len(), 6);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn retryable_errors_are_bounded() -> Result<()> {
    init_tracing();
    let cluster = MemoryCluster::default().into_shared();
    for _ in 0..10 {
        cluster.fail_next(
            "ping",
            ServerError::command(11601, "Interrupted", "operation was interrupted"),
        );
    }
    let journal = Journal::default();
    let definition = alternating(&journal)
        .state("a", ping)
        .tolerate_killed_sessions()
        .map_retry_policy(|policy| policy.max_retries(3))
        .build()?;

    let err = scheduler(&cluster)
        .run(&definition, &RunOptions::new().thread_count(1))
        .await
        .unwrap_err();

    let failure = err.worker_failure().expect("worker failure");
    assert_eq!(failure.kind, FailureKind::RetriesExhausted { retries: 3 });
    assert_eq!(journal.attempts.load(Ordering::SeqCst), 4);
    assert_eq!(journal.teardowns.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn retried_state_recovers() -> Result<()> {
    init_tracing();
    let cluster = MemoryCluster::default().into_shared();
    cluster.fail_next("ping", ServerError::network("connection reset"));
    cluster.fail_next(
        "ping",
        ServerError::command(10107, "NotWritablePrimary", "not primary"),
    );
    let journal = Journal::default();
    let definition = alternating(&journal)
        .state("a", ping)
        .tolerate_stepdowns()
        .iterations(4)
        .build()?;

    let report = scheduler(&cluster)
        .run(&definition, &RunOptions::new().thread_count(1))
        .await?;

    assert_eq!(report.total_retries(), 2);
    assert_eq!(journal.path(0), ["a", "b", "a", "b"]);
    assert_eq!(journal.attempts.load(Ordering::SeqCst), 4);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn advance_mode_moves_past_interrupted_state() -> Result<()> {
    init_tracing();
    let cluster = MemoryCluster::default().into_shared();
    cluster.fail_next(
        "ping",
        ServerError::command(11601, "Interrupted", "operation was interrupted"),
    );
    let journal = Journal::default();
    let definition = alternating(&journal)
        .state("a", ping)
        .tolerate_killed_sessions()
        .advance_on_retryable_error()
        .iterations(4)
        .build()?;

    let report = scheduler(&cluster)
        .run(&definition, &RunOptions::new().thread_count(1))
        .await?;

    assert_eq!(report.total_retries(), 1);
    assert_eq!(journal.path(0), ["b", "a", "b"]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn same_seed_reproduces_every_path() -> Result<()> {
    init_tracing();

    async fn paths(seed: u64) -> Result<Vec<Vec<String>>> {
        let cluster = MemoryCluster::default().into_shared();
        let journal = Journal::default();
        let source = journal.clone();
        let definition = WorkloadBuilder::new("branching", move || source.clone())
            .state("read", visit)
            .state("write", visit)
            .state("scan", visit)
            .transitions("read", [("read", 0.2), ("write", 0.5), ("scan", 0.3)])
            .transitions("write", [("read", 0.7), ("scan", 0.3)])
            .transitions("scan", [("read", 0.5), ("write", 0.5)])
            .start_state("read")
            .thread_count(4)
            .iterations(50)
            .build()?;

        scheduler(&cluster)
            .run(&definition, &RunOptions::new().seed(seed))
            .await?;
        Ok((0..4).map(|thread_id| journal.path(thread_id)).collect())
    }

    let first = paths(0xF5A1).await?;
    assert_eq!(first, paths(0xF5A1).await?);
    assert_ne!(first[0], first[1], "workers draw from independent sources");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn duration_bounds_a_long_run() -> Result<()> {
    init_tracing();
    let cluster = MemoryCluster::default().into_shared();
    let journal = Journal::default();
    let definition = alternating(&journal)
        .state("a", napping_visit)
        .state("b", napping_visit)
        .thread_count(3)
        .iterations(u64::MAX)
        .build()?;

    let report = scheduler(&cluster)
        .run(
            &definition,
            &RunOptions::new().duration(Duration::from_millis(150)),
        )
        .await?;

    assert_eq!(report.stop_reason, Some(StopReason::DurationElapsed));
    assert!(report.total_iterations() > 0);
    assert_eq!(journal.teardowns.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn terminal_state_ends_worker() -> Result<()> {
    init_tracing();
    let cluster = MemoryCluster::default().into_shared();
    let journal = Journal::default();
    let definition = alternating(&journal)
        .state("done", visit)
        .transitions("b", [("done", 1.0)])
        .terminal_state("done")
        .iterations(100)
        .build()?;

    let report = scheduler(&cluster)
        .run(&definition, &RunOptions::new().thread_count(2))
        .await?;

    for worker in &report.workers {
        assert_eq!(worker.stop, WorkerStop::TerminalState("done".to_owned()));
        assert_eq!(worker.iterations, 3);
    }
    assert_eq!(journal.path(1), ["a", "b", "done"]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn skip_predicate_sees_cluster_kind() -> Result<()> {
    init_tracing();
    let journal = Journal::default();
    let definition = alternating(&journal)
        .skip(|cluster| {
            (cluster.kind() != ClusterKind::Sharded).then(|| "requires a sharded cluster".to_owned())
        })
        .build()?;

    let standalone = MemoryCluster::default().into_shared();
    let report = scheduler(&standalone)
        .run(&definition, &RunOptions::new())
        .await?;
    assert_eq!(report.skipped.as_deref(), Some("requires a sharded cluster"));
    assert_eq!(journal.setups.load(Ordering::SeqCst), 0);

    let sharded = MemoryCluster::new(ClusterKind::Sharded).into_shared();
    let report = scheduler(&sharded)
        .run(&definition, &RunOptions::new())
        .await?;
    assert!(!report.is_skipped());
    assert_eq!(journal.setups.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn per_worker_connections_are_opened_up_front() -> Result<()> {
    init_tracing();
    let cluster = MemoryCluster::default().into_shared();
    let journal = Journal::default();
    let definition = alternating(&journal)
        .connection_mode(ConnectionMode::PerWorker)
        .build()?;

    scheduler(&cluster)
        .run(&definition, &RunOptions::new().thread_count(6))
        .await?;

    assert_eq!(cluster.connects(), 7);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn connection_cache_reaches_handlers_on_request() -> Result<()> {
    init_tracing();

    async fn ping_routers(ctx: WorkloadContext<Journal>) -> Result<(), DynError> {
        let cache = ctx.connection_cache().ok_or("no connection cache")?;
        let router = cache.random("routers").ok_or("no routers")?;
        router
            .run_command("admin", json!({ "ping": 1 }))
            .await
            .and_then(ServerError::check_reply)?;
        visit(ctx).await
    }

    let cluster = MemoryCluster::default()
        .with_connection_groups(["routers", "shards"])
        .into_shared();
    let journal = Journal::default();
    let definition = alternating(&journal).state("a", ping_routers).iterations(4);

    let without_cache = definition.clone().build()?;
    let err = scheduler(&cluster)
        .run(&without_cache, &RunOptions::new().thread_count(1))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no connection cache"));

    let with_cache = definition.pass_connection_cache(true).build()?;
    scheduler(&cluster)
        .run(&with_cache, &RunOptions::new().thread_count(1))
        .await?;
    assert_eq!(cluster.command_count("ping"), 2);
    Ok(())
}

#[test]
fn malformed_definitions_are_rejected() {
    let journal = Journal::default();

    let unreachable = alternating(&journal)
        .state("island", visit)
        .transitions("island", [("a", 1.0)])
        .build()
        .err();
    assert!(matches!(
        unreachable,
        Some(ConfigError::UnreachableState { ref state, .. }) if state == "island"
    ));

    let dead_end = alternating(&journal)
        .transitions("b", [("a", 0.0)])
        .build()
        .err();
    assert!(matches!(dead_end, Some(ConfigError::NoOutgoingWeight { .. })));

    let dangling = alternating(&journal)
        .transitions("b", [("c", 1.0)])
        .build()
        .err();
    assert!(matches!(dangling, Some(ConfigError::UndeclaredTarget { .. })));

    let negative = alternating(&journal)
        .transitions("a", [("b", -1.0)])
        .build()
        .err();
    assert!(matches!(negative, Some(ConfigError::InvalidWeight { .. })));

    let missing_start = alternating(&journal).start_state("z").build().err();
    assert!(matches!(
        missing_start,
        Some(ConfigError::MissingStartState { .. })
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn setup_failure_skips_workers_but_tears_down() -> Result<()> {
    init_tracing();

    async fn refuse(_ctx: HookContext<Journal>) -> Result<(), DynError> {
        Err("fixture unavailable".into())
    }

    let cluster = MemoryCluster::default().into_shared();
    let journal = Journal::default();
    let definition = alternating(&journal).setup(refuse).build()?;

    let err = scheduler(&cluster)
        .run(&definition, &RunOptions::new())
        .await
        .unwrap_err();

    assert!(matches!(err, RunError::Setup { .. }));
    assert!(journal.visits.lock().unwrap().is_empty());
    assert_eq!(journal.teardowns.load(Ordering::SeqCst), 1);
    Ok(())
}
