use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use fsm_framework_core::scenario::{
    Cluster, ClusterKind, ConnectionCache, DynError, ServerError, ServerHandle,
    TRANSIENT_TRANSACTION_LABEL,
};
use rand::{Rng as _, SeedableRng as _, rngs::StdRng, seq::SliceRandom as _};
use serde_json::Value;
use tokio::time::sleep;
use tracing::debug;

/// Error a [`FaultInjectingServer`] substitutes for a real reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// The operation's session was killed (`Interrupted`).
    KillSession,
    /// The node stepped down mid-operation (`NotWritablePrimary`).
    Stepdown,
    /// A router used stale routing information (`StaleConfig`).
    StaleRouting,
    /// The connection dropped.
    Network,
    /// A transaction aborted with the transient label attached.
    TransientTransaction,
}

impl Fault {
    #[must_use]
    pub fn to_error(self) -> ServerError {
        match self {
            Self::KillSession => ServerError::command(11601, "Interrupted", "operation was interrupted"),
            Self::Stepdown => ServerError::command(10107, "NotWritablePrimary", "not primary"),
            Self::StaleRouting => ServerError::command(13388, "StaleConfig", "shard version mismatch"),
            Self::Network => ServerError::network("connection reset by peer"),
            Self::TransientTransaction => {
                ServerError::command(251, "NoSuchTransaction", "transaction was aborted")
                    .with_label(TRANSIENT_TRANSACTION_LABEL)
            }
        }
    }
}

/// Whether the injected error hides a command that already ran.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FaultTiming {
    /// The command never reaches the server.
    #[default]
    BeforeApply,
    /// The command runs, then the reply is replaced by the fault.
    AfterApply,
}

#[derive(Debug, thiserror::Error)]
pub enum ChaosConfigError {
    #[error("fault probability must be within [0, 1], got {value}")]
    InvalidProbability { value: f64 },
    #[error("no faults configured")]
    NoFaults,
}

/// Settings shared by every connection a [`FaultInjectingCluster`] hands out.
#[derive(Clone, Debug)]
pub struct ChaosConfig {
    probability: f64,
    faults: Vec<Fault>,
    timing: FaultTiming,
    min_delay: Duration,
    max_delay: Duration,
    seed: u64,
}

impl ChaosConfig {
    /// Injects one of `faults` into each command with the given probability.
    pub fn new(probability: f64, faults: Vec<Fault>) -> Result<Self, ChaosConfigError> {
        if !(0.0..=1.0).contains(&probability) {
            return Err(ChaosConfigError::InvalidProbability { value: probability });
        }
        if faults.is_empty() {
            return Err(ChaosConfigError::NoFaults);
        }
        Ok(Self {
            probability,
            faults,
            timing: FaultTiming::default(),
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            seed: 0,
        })
    }

    #[must_use]
    pub const fn timing(mut self, timing: FaultTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Sleep a random time within the bounds before each forwarded command.
    #[must_use]
    pub const fn delay(mut self, min_delay: Duration, max_delay: Duration) -> Self {
        self.min_delay = min_delay;
        self.max_delay = max_delay;
        self
    }

    #[must_use]
    pub const fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Wraps a connection and replaces some replies with server errors, so
/// workloads see the interruptions they must tolerate without a real
/// stepdown or migration.
pub struct FaultInjectingServer {
    inner: Arc<dyn ServerHandle>,
    config: ChaosConfig,
    rng: Mutex<StdRng>,
    injected: AtomicU64,
}

impl FaultInjectingServer {
    #[must_use]
    pub fn new(inner: Arc<dyn ServerHandle>, config: ChaosConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            inner,
            config,
            rng: Mutex::new(rng),
            injected: AtomicU64::new(0),
        }
    }

    /// Number of faults injected so far.
    #[must_use]
    pub fn injected(&self) -> u64 {
        self.injected.load(Ordering::Relaxed)
    }

    fn roll(&self) -> (Option<Fault>, Duration) {
        let mut rng = self
            .rng
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let fault = if rng.gen_bool(self.config.probability) {
            self.config.faults.choose(&mut *rng).copied()
        } else {
            None
        };
        (fault, self.random_delay(&mut *rng))
    }

    fn random_delay(&self, rng: &mut StdRng) -> Duration {
        let ChaosConfig {
            min_delay,
            max_delay,
            ..
        } = self.config;
        if max_delay <= min_delay {
            return min_delay;
        }
        let spread = (max_delay - min_delay).as_secs_f64();
        let offset = rng.gen_range(0.0..=spread);
        min_delay
            .checked_add(Duration::from_secs_f64(offset))
            .unwrap_or(max_delay)
    }

    fn inject(&self, fault: Fault, database: &str) -> ServerError {
        self.injected.fetch_add(1, Ordering::Relaxed);
        debug!(
            address = self.inner.address(),
            database,
            ?fault,
            timing = ?self.config.timing,
            "injecting fault"
        );
        fault.to_error()
    }
}

#[async_trait]
impl ServerHandle for FaultInjectingServer {
    fn address(&self) -> &str {
        self.inner.address()
    }

    async fn run_command(&self, database: &str, command: Value) -> Result<Value, ServerError> {
        let (fault, delay) = self.roll();
        if !delay.is_zero() {
            sleep(delay).await;
        }

        match (fault, self.config.timing) {
            (Some(fault), FaultTiming::BeforeApply) => Err(self.inject(fault, database)),
            (Some(fault), FaultTiming::AfterApply) => {
                self.inner.run_command(database, command).await?;
                Err(self.inject(fault, database))
            }
            (None, _) => self.inner.run_command(database, command).await,
        }
    }
}

/// Cluster wrapper whose connections inject faults. Every connection gets
/// its own random source derived from the configured seed.
pub struct FaultInjectingCluster {
    inner: Arc<dyn Cluster>,
    config: ChaosConfig,
    spared: u64,
    connections: AtomicU64,
}

impl FaultInjectingCluster {
    #[must_use]
    pub fn new(inner: Arc<dyn Cluster>, config: ChaosConfig) -> Self {
        Self {
            inner,
            config,
            spared: 0,
            connections: AtomicU64::new(0),
        }
    }

    /// Leave the first `count` connections untouched. The scheduler opens the
    /// hook connection first, so `spare_first(1)` with per-worker
    /// connections keeps `setup` and `teardown` fault free.
    #[must_use]
    pub const fn spare_first(mut self, count: u64) -> Self {
        self.spared = count;
        self
    }
}

#[async_trait]
impl Cluster for FaultInjectingCluster {
    fn kind(&self) -> ClusterKind {
        self.inner.kind()
    }

    async fn connect(&self) -> Result<Arc<dyn ServerHandle>, DynError> {
        let inner = self.inner.connect().await?;
        let index = self.connections.fetch_add(1, Ordering::Relaxed);
        if index < self.spared {
            return Ok(inner);
        }
        let config = self.config.clone().seed(self.config.seed.wrapping_add(index));
        Ok(Arc::new(FaultInjectingServer::new(inner, config)))
    }

    fn connection_cache(&self) -> Option<ConnectionCache> {
        self.inner.connection_cache()
    }
}
