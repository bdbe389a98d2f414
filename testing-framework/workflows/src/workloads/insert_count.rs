//! Every worker inserts, then waits until all workers have inserted at least
//! once before it starts counting. After that, counts may only grow.

use std::{
    sync::{
        OnceLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use fsm_framework_core::{
    scenario::{
        ConfigError, DynError, HookContext, WorkloadBuilder, WorkloadContext, WorkloadDefinition,
    },
    workload_assert,
};
use serde_json::json;

use super::commands::{count_documents, create_collection, drop_collection, insert_one};
use crate::util::CountDownLatch;

pub const NAME: &str = "insert_count";

const BARRIER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
pub struct InsertCountData {
    inserted: AtomicU64,
    /// Created by `setup` once the worker count is known.
    first_inserts: OnceLock<CountDownLatch>,
}

impl InsertCountData {
    #[must_use]
    pub fn inserted(&self) -> u64 {
        self.inserted.load(Ordering::SeqCst)
    }

    fn latch(&self) -> Result<&CountDownLatch, DynError> {
        self.first_inserts
            .get()
            .ok_or_else(|| "insert_count latch missing; setup did not run".into())
    }
}

async fn setup(ctx: HookContext<InsertCountData>) -> Result<(), DynError> {
    ctx.data()
        .first_inserts
        .set(CountDownLatch::new(ctx.thread_count()))
        .map_err(|_| "insert_count latch initialised twice")?;
    create_collection(ctx.server().as_ref(), ctx.target()).await
}

async fn insert(ctx: &WorkloadContext<InsertCountData>) -> Result<(), DynError> {
    let document = json!({ "tid": ctx.thread_id(), "iteration": ctx.iteration() });
    insert_one(ctx.server().as_ref(), ctx.target(), document).await?;
    ctx.data().inserted.fetch_add(1, Ordering::SeqCst);
    Ok(())
}

async fn first_insert(ctx: WorkloadContext<InsertCountData>) -> Result<(), DynError> {
    insert(&ctx).await?;
    ctx.data().latch()?.count_down();
    Ok(())
}

async fn barrier(ctx: WorkloadContext<InsertCountData>) -> Result<(), DynError> {
    let latch = ctx.data().latch()?;
    workload_assert!(
        latch.wait_timeout(BARRIER_TIMEOUT).await,
        "{} workers still missing their first insert after {BARRIER_TIMEOUT:?}",
        latch.count()
    );
    Ok(())
}

async fn insert_more(ctx: WorkloadContext<InsertCountData>) -> Result<(), DynError> {
    insert(&ctx).await
}

async fn count(ctx: WorkloadContext<InsertCountData>) -> Result<(), DynError> {
    let floor = ctx.data().inserted();
    let count = count_documents(ctx.server().as_ref(), ctx.target()).await?;
    workload_assert!(
        count >= floor && count >= ctx.thread_count() as u64,
        "count {count} is below {floor} acknowledged inserts or {} first inserts",
        ctx.thread_count()
    );
    Ok(())
}

async fn teardown(ctx: HookContext<InsertCountData>) -> Result<(), DynError> {
    let count = count_documents(ctx.server().as_ref(), ctx.target()).await?;
    let inserted = ctx.data().inserted();
    workload_assert!(
        count == inserted,
        "collection '{}' holds {count} documents, {inserted} were inserted",
        ctx.target()
    );
    drop_collection(ctx.server().as_ref(), ctx.target()).await
}

#[must_use]
pub fn builder() -> WorkloadBuilder<InsertCountData> {
    WorkloadBuilder::new(NAME, InsertCountData::default)
        .state("first_insert", first_insert)
        .state("barrier", barrier)
        .state("insert", insert_more)
        .state("count", count)
        .start_state("first_insert")
        .transitions("first_insert", [("barrier", 1.0)])
        .transitions("barrier", [("insert", 0.7), ("count", 0.3)])
        .transitions("insert", [("insert", 0.7), ("count", 0.3)])
        .transitions("count", [("insert", 1.0)])
        .setup(setup)
        .teardown(teardown)
        .thread_count(5)
        .iterations(20)
}

pub fn workload() -> Result<WorkloadDefinition<InsertCountData>, ConfigError> {
    builder().build()
}
