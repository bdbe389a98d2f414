use std::env;

#[must_use]
pub fn slow_test_env() -> bool {
    env::var("SLOW_TEST_ENV").is_ok_and(|s| s == "true")
}

#[must_use]
pub fn debug_tracing() -> bool {
    env::var("FSM_TESTS_TRACING").is_ok_and(|val| val.eq_ignore_ascii_case("true"))
}

#[must_use]
pub fn rust_log() -> Option<String> {
    env::var("RUST_LOG").ok()
}

/// Overrides the worker count of every workload run.
#[must_use]
pub fn fsm_thread_count() -> Option<usize> {
    parse_var("FSM_THREAD_COUNT")
}

/// Overrides the per-worker iteration budget of every workload run.
#[must_use]
pub fn fsm_iterations() -> Option<u64> {
    parse_var("FSM_ITERATIONS")
}

/// Base seed for worker random sources; worker `n` uses `seed + n`.
#[must_use]
pub fn fsm_seed() -> Option<u64> {
    parse_var("FSM_SEED")
}

#[must_use]
pub fn fsm_run_duration_secs() -> Option<u64> {
    parse_var("FSM_RUN_DURATION_SECS")
}

#[must_use]
pub fn fsm_config_path() -> Option<String> {
    env::var("FSM_CONFIG_PATH").ok()
}

fn parse_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}
