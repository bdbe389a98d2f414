//! Inserts documents while sessions are being killed underneath them.
//!
//! An insert interrupted by a killed session or a dropped connection may or
//! may not have been applied, so the workload keeps two counters: inserts the
//! server acknowledged, and inserts whose outcome is unknown. At the end the
//! collection must hold at least every acknowledged insert and at most the
//! acknowledged plus the unknown ones.

use std::sync::atomic::{AtomicU64, Ordering};

use fsm_framework_core::{
    scenario::{
        ConfigError, DirtyFlags, DynError, HookContext, WorkloadBuilder, WorkloadContext,
        WorkloadDefinition,
    },
    workload_assert,
};
use serde_json::json;
use tracing::{debug, info};

use super::commands::{
    count_documents, create_collection, drop_collection, insert_one, kill_all_sessions,
};
use crate::builder::WorkloadBuilderExt as _;

pub const NAME: &str = "kill_sessions";

/// Shared by every worker; plain atomics, no locks.
#[derive(Debug, Default)]
pub struct KillSessionsData {
    acknowledged: AtomicU64,
    uncertain: AtomicU64,
    kills: AtomicU64,
}

impl KillSessionsData {
    #[must_use]
    pub fn acknowledged(&self) -> u64 {
        self.acknowledged.load(Ordering::SeqCst)
    }

    /// Inserts that failed in a way that leaves their outcome unknown.
    #[must_use]
    pub fn uncertain(&self) -> u64 {
        self.uncertain.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn kills(&self) -> u64 {
        self.kills.load(Ordering::SeqCst)
    }
}

async fn setup(ctx: HookContext<KillSessionsData>) -> Result<(), DynError> {
    create_collection(ctx.server().as_ref(), ctx.target()).await
}

async fn insert(ctx: WorkloadContext<KillSessionsData>) -> Result<(), DynError> {
    let document = json!({ "tid": ctx.thread_id(), "iteration": ctx.iteration() });
    match insert_one(ctx.server().as_ref(), ctx.target(), document).await {
        Ok(()) => {
            ctx.data().acknowledged.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        Err(err) => {
            let flags = DirtyFlags {
                write_in_flight: true,
                in_transaction: false,
            };
            if ctx.retry_policy().should_count_as_dirty(&err, flags) {
                ctx.data().uncertain.fetch_add(1, Ordering::SeqCst);
            }
            Err(err)
        }
    }
}

async fn kill_sessions(ctx: WorkloadContext<KillSessionsData>) -> Result<(), DynError> {
    kill_all_sessions(ctx.server().as_ref()).await?;
    ctx.data().kills.fetch_add(1, Ordering::SeqCst);
    debug!(thread_id = ctx.thread_id(), "killed all sessions");
    Ok(())
}

/// Other workers keep inserting, so only the lower bound holds mid-run.
async fn verify(ctx: WorkloadContext<KillSessionsData>) -> Result<(), DynError> {
    let floor = ctx.data().acknowledged();
    let count = count_documents(ctx.server().as_ref(), ctx.target()).await?;
    workload_assert!(
        count >= floor,
        "collection '{}' holds {count} documents but {floor} inserts were acknowledged",
        ctx.target()
    );
    Ok(())
}

async fn teardown(ctx: HookContext<KillSessionsData>) -> Result<(), DynError> {
    let data = ctx.data();
    let count = count_documents(ctx.server().as_ref(), ctx.target()).await?;
    let (floor, ceiling) = (data.acknowledged(), data.acknowledged() + data.uncertain());
    info!(
        collection = ctx.target(),
        count,
        acknowledged = floor,
        uncertain = data.uncertain(),
        kills = data.kills(),
        "kill_sessions final count"
    );
    workload_assert!(
        (floor..=ceiling).contains(&count),
        "collection '{}' holds {count} documents, expected between {floor} and {ceiling}",
        ctx.target()
    );
    drop_collection(ctx.server().as_ref(), ctx.target()).await
}

/// Builder for the workload, for callers that want to extend it before
/// validation.
#[must_use]
pub fn builder() -> WorkloadBuilder<KillSessionsData> {
    WorkloadBuilder::new(NAME, KillSessionsData::default)
        .state("insert", insert)
        .state("kill_sessions", kill_sessions)
        .state("verify", verify)
        .start_state("insert")
        .transitions("insert", [("insert", 0.6), ("kill_sessions", 0.2), ("verify", 0.2)])
        .transitions("kill_sessions", [("insert", 1.0)])
        .transitions("verify", [("insert", 0.8), ("kill_sessions", 0.2)])
        .setup(setup)
        .teardown(teardown)
        .thread_count(4)
        .iterations(50)
        .tolerate_killed_sessions()
        .tolerate_network_errors()
}

pub fn workload() -> Result<WorkloadDefinition<KillSessionsData>, ConfigError> {
    builder().build()
}
