use async_trait::async_trait;

use super::{
    RunError, RunOptions, WorkloadDefinition,
    runtime::{report::RunReport, scheduler::WorkloadScheduler},
};

/// Object-safe view of a workload, so definitions over different data types
/// can be scheduled together.
#[async_trait]
pub trait Workload: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(
        &self,
        scheduler: &WorkloadScheduler,
        options: &RunOptions,
    ) -> Result<RunReport, RunError>;
}

#[async_trait]
impl<D: Send + Sync + 'static> Workload for WorkloadDefinition<D> {
    fn name(&self) -> &str {
        WorkloadDefinition::name(self)
    }

    async fn execute(
        &self,
        scheduler: &WorkloadScheduler,
        options: &RunOptions,
    ) -> Result<RunReport, RunError> {
        scheduler.run(self, options).await
    }
}
