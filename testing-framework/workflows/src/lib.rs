pub mod builder;
pub mod util;
pub mod workloads;

pub use builder::WorkloadBuilderExt;
pub use util::CountDownLatch;
pub use workloads::chaos::{
    ChaosConfig, ChaosConfigError, Fault, FaultInjectingCluster, FaultInjectingServer, FaultTiming,
};
