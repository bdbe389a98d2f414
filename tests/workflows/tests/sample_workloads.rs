use std::sync::Arc;

use anyhow::Result;
use fsm_framework_core::scenario::{RunOptions, Workload, WorkloadScheduler};
use fsm_framework_workflows::{
    ChaosConfig, Fault, FaultInjectingCluster, FaultTiming,
    workloads::{insert_count, kill_sessions},
};
use tests_workflows::{MemoryCluster, init_tracing};

const SEED: u64 = 20_240_917;

#[tokio::test(flavor = "multi_thread")]
async fn kill_sessions_on_a_quiet_cluster() -> Result<()> {
    init_tracing();
    let cluster = MemoryCluster::default().into_shared();
    let scheduler = WorkloadScheduler::new(cluster.clone());

    let report = scheduler
        .run(&kill_sessions::workload()?, &RunOptions::new().seed(SEED))
        .await?;

    assert_eq!(report.total_retries(), 0);
    assert_eq!(report.total_iterations(), 4 * 50);
    assert!(cluster.command_count("killAllSessions") > 0);
    assert_eq!(cluster.document_count(kill_sessions::NAME), None, "teardown drops the collection");
    Ok(())
}

/// Faults land after the insert was applied, so some acknowledged counts
/// lag the collection; the teardown bounds must still hold.
#[tokio::test(flavor = "multi_thread")]
async fn kill_sessions_tolerates_interrupted_writes() -> Result<()> {
    init_tracing();
    let memory = MemoryCluster::default().into_shared();
    let chaos = ChaosConfig::new(0.2, vec![Fault::KillSession, Fault::Network])?
        .timing(FaultTiming::AfterApply)
        .seed(SEED);
    let cluster = Arc::new(FaultInjectingCluster::new(memory.clone(), chaos).spare_first(1));
    let definition = kill_sessions::builder()
        .connection_mode(fsm_framework_core::scenario::ConnectionMode::PerWorker)
        .map_retry_policy(|policy| policy.max_retries(50))
        .build()?;

    let report = WorkloadScheduler::new(cluster)
        .run(&definition, &RunOptions::new().seed(SEED))
        .await?;

    assert!(report.total_retries() > 0);
    assert_eq!(memory.document_count(kill_sessions::NAME), None);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn insert_count_waits_for_every_worker() -> Result<()> {
    init_tracing();
    let cluster = MemoryCluster::default().into_shared();

    let report = WorkloadScheduler::new(cluster.clone())
        .run(&insert_count::workload()?, &RunOptions::new().seed(SEED))
        .await?;

    assert_eq!(report.workers.len(), 5);
    for worker in &report.workers {
        assert_eq!(worker.visits("first_insert"), 1);
        assert_eq!(worker.visits("barrier"), 1);
    }
    assert!(cluster.command_count("insert") >= 5);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn workloads_compose_serially_and_in_parallel() -> Result<()> {
    init_tracing();
    let cluster = MemoryCluster::default().into_shared();
    let scheduler = WorkloadScheduler::new(cluster.clone());
    let workloads: Vec<Arc<dyn Workload>> = vec![
        Arc::new(kill_sessions::workload()?),
        Arc::new(insert_count::workload()?),
    ];
    let options = RunOptions::new().seed(SEED);

    let serial = scheduler.run_serially(&workloads, &options).await?;
    assert_eq!(
        serial.iter().map(|r| r.workload.as_str()).collect::<Vec<_>>(),
        [kill_sessions::NAME, insert_count::NAME]
    );

    let parallel = scheduler.run_in_parallel(&workloads, &options).await?;
    assert_eq!(parallel.len(), 2);
    assert!(parallel.iter().all(|report| !report.is_skipped()));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn extended_workload_keeps_base_untouched() -> Result<()> {
    init_tracing();
    let base = insert_count::workload()?;
    let wider = base.extend(|builder| builder.name("insert_count_wide").thread_count(8))?;
    assert_eq!(base.thread_count(), 5);
    assert_eq!(wider.thread_count(), 8);

    let cluster = MemoryCluster::default().into_shared();
    let report = WorkloadScheduler::new(cluster)
        .run(&wider, &RunOptions::new().iterations(6))
        .await?;

    assert_eq!(report.workload, "insert_count_wide");
    assert_eq!(report.workers.len(), 8);
    Ok(())
}
