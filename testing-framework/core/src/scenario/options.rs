use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use fsm_framework_env as tf_env;
use serde::Deserialize;
use serde_with::{DurationSeconds, serde_as};
use thiserror::Error;

use super::{WorkloadDefinition, error::ConfigError};
use crate::adjust_timeout;

/// Per-run overrides of a workload's defaults. Every field left unset falls
/// back to what the definition declares.
///
/// ```yaml
/// thread_count: 8
/// iterations: 200
/// seed: 42
/// duration: 30
/// cancel_on_fatal: true
/// target: kill_sessions
/// ```
#[serde_as]
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RunOptions {
    pub thread_count: Option<usize>,
    pub iterations: Option<u64>,
    pub seed: Option<u64>,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub duration: Option<Duration>,
    pub cancel_on_fatal: bool,
    pub target: Option<String>,
}

#[derive(Debug, Error)]
pub enum OptionsError {
    #[error("failed to read run options from {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse run options: {source}")]
    Parse {
        #[source]
        source: serde_yaml::Error,
    },
}

/// Options with every default applied, as used by one run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedOptions {
    pub thread_count: usize,
    pub iterations: u64,
    pub seed: u64,
    pub duration: Option<Duration>,
    pub cancel_on_fatal: bool,
    pub target: String,
}

impl RunOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Options from the YAML file named by `FSM_CONFIG_PATH` (if set), with
    /// the `FSM_*` overrides applied on top.
    pub fn from_env() -> Result<Self, OptionsError> {
        let base = match tf_env::fsm_config_path() {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        Ok(base.with_env_overrides())
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, OptionsError> {
        serde_yaml::from_str(yaml).map_err(|source| OptionsError::Parse { source })
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, OptionsError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| OptionsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    /// Apply `FSM_*` environment variables on top of these options.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(thread_count) = tf_env::fsm_thread_count() {
            self.thread_count = Some(thread_count);
        }
        if let Some(iterations) = tf_env::fsm_iterations() {
            self.iterations = Some(iterations);
        }
        if let Some(seed) = tf_env::fsm_seed() {
            self.seed = Some(seed);
        }
        if let Some(secs) = tf_env::fsm_run_duration_secs() {
            self.duration = Some(Duration::from_secs(secs));
        }
        self
    }

    #[must_use]
    pub const fn thread_count(mut self, thread_count: usize) -> Self {
        self.thread_count = Some(thread_count);
        self
    }

    #[must_use]
    pub const fn iterations(mut self, iterations: u64) -> Self {
        self.iterations = Some(iterations);
        self
    }

    #[must_use]
    pub const fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    #[must_use]
    pub const fn duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    #[must_use]
    pub const fn cancel_on_fatal(mut self, cancel: bool) -> Self {
        self.cancel_on_fatal = cancel;
        self
    }

    #[must_use]
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Fill unset fields from `definition`. A missing seed is drawn at
    /// random; the duration is stretched in slow test environments.
    pub fn resolve<D>(&self, definition: &WorkloadDefinition<D>) -> Result<ResolvedOptions, ConfigError> {
        let thread_count = self.thread_count.unwrap_or_else(|| definition.thread_count());
        if thread_count == 0 {
            return Err(ConfigError::ZeroValue {
                field: "thread_count",
            });
        }
        let iterations = self.iterations.unwrap_or_else(|| definition.iterations());
        if iterations == 0 {
            return Err(ConfigError::ZeroValue {
                field: "iterations",
            });
        }

        Ok(ResolvedOptions {
            thread_count,
            iterations,
            seed: self.seed.unwrap_or_else(rand::random),
            duration: self.duration.map(adjust_timeout),
            cancel_on_fatal: self.cancel_on_fatal,
            target: self
                .target
                .clone()
                .unwrap_or_else(|| definition.name().to_owned()),
        })
    }
}
