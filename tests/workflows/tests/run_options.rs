use std::{env, io::Write as _, time::Duration};

use anyhow::Result;
use fsm_framework_core::scenario::{RunOptions, WorkloadScheduler};
use fsm_framework_workflows::workloads::insert_count;
use serial_test::serial;
use tempfile::NamedTempFile;
use tests_workflows::{MemoryCluster, init_tracing};

fn set_var(key: &str, value: &str) {
    // SAFETY: every test touching the environment runs under `#[serial]`.
    unsafe {
        env::set_var(key, value);
    }
}

fn remove_var(key: &str) {
    // SAFETY: see `set_var`.
    unsafe {
        env::remove_var(key);
    }
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn environment_overrides_definition_defaults() -> Result<()> {
    init_tracing();
    set_var("FSM_THREAD_COUNT", "2");
    set_var("FSM_ITERATIONS", "3");
    set_var("FSM_SEED", "77");

    let cluster = MemoryCluster::default().into_shared();
    let outcome = WorkloadScheduler::new(cluster)
        .run(&insert_count::workload()?, &RunOptions::new().thread_count(9))
        .await;

    remove_var("FSM_THREAD_COUNT");
    remove_var("FSM_ITERATIONS");
    remove_var("FSM_SEED");

    let report = outcome?;
    assert_eq!(report.thread_count, 2);
    assert_eq!(report.seed, 77);
    assert!(report.workers.iter().all(|worker| worker.iterations == 3));
    Ok(())
}

#[test]
#[serial]
fn options_load_from_config_path() -> Result<()> {
    let mut file = NamedTempFile::new()?;
    writeln!(file, "iterations: 40\nduration: 5\ncancel_on_fatal: true")?;

    set_var("FSM_CONFIG_PATH", &file.path().to_string_lossy());
    set_var("FSM_ITERATIONS", "11");
    let options = RunOptions::from_env();
    remove_var("FSM_CONFIG_PATH");
    remove_var("FSM_ITERATIONS");

    let options = options?;
    assert_eq!(options.iterations, Some(11));
    assert_eq!(options.duration, Some(Duration::from_secs(5)));
    assert!(options.cancel_on_fatal);
    Ok(())
}
