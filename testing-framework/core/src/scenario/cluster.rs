use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;

use super::{DynError, runtime::connections::ConnectionCache};

/// Label servers attach to errors that abort a whole transaction.
pub const TRANSIENT_TRANSACTION_LABEL: &str = "TransientTransactionError";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServerErrorKind {
    /// The server answered with an error reply.
    Command,
    /// The request or its reply was lost in transit.
    Network,
}

/// Error returned by a [`ServerHandle`]. Carries the server's numeric code,
/// code name and error labels so retry policies can classify it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerError {
    pub kind: ServerErrorKind,
    pub code: Option<i32>,
    pub code_name: Option<String>,
    pub message: String,
    pub labels: Vec<String>,
}

impl ServerError {
    #[must_use]
    pub fn command(code: i32, code_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ServerErrorKind::Command,
            code: Some(code),
            code_name: Some(code_name.into()),
            message: message.into(),
            labels: Vec::new(),
        }
    }

    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            kind: ServerErrorKind::Network,
            code: None,
            code_name: None,
            message: message.into(),
            labels: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.push(label.into());
        self
    }

    #[must_use]
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    #[must_use]
    pub fn is_network(&self) -> bool {
        self.kind == ServerErrorKind::Network
    }

    /// Parses an `{ ok: 0, code, codeName, errmsg, errorLabels }` reply.
    /// Returns `None` for successful replies.
    #[must_use]
    pub fn from_reply(reply: &Value) -> Option<Self> {
        let ok = reply.get("ok").and_then(Value::as_f64).unwrap_or(0.0);
        if ok >= 1.0 {
            return None;
        }

        let code = reply
            .get("code")
            .and_then(Value::as_i64)
            .and_then(|code| i32::try_from(code).ok());
        let labels = reply
            .get("errorLabels")
            .and_then(Value::as_array)
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        Some(Self {
            kind: ServerErrorKind::Command,
            code,
            code_name: reply
                .get("codeName")
                .and_then(Value::as_str)
                .map(str::to_owned),
            message: reply
                .get("errmsg")
                .and_then(Value::as_str)
                .unwrap_or("command failed")
                .to_owned(),
            labels,
        })
    }

    /// Turns an error reply into `Err`, passing successful replies through.
    pub fn check_reply(reply: Value) -> Result<Value, Self> {
        match Self::from_reply(&reply) {
            Some(error) => Err(error),
            None => Ok(reply),
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.kind, &self.code_name, self.code) {
            (ServerErrorKind::Network, _, _) => write!(f, "network error: {}", self.message),
            (_, Some(name), Some(code)) => write!(f, "{name} ({code}): {}", self.message),
            (_, None, Some(code)) => write!(f, "error {code}: {}", self.message),
            _ => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ServerError {}

/// Opaque command endpoint of the server under test.
#[async_trait]
pub trait ServerHandle: Send + Sync {
    /// Human readable address used in logs.
    fn address(&self) -> &str;

    async fn run_command(&self, database: &str, command: Value) -> Result<Value, ServerError>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ClusterKind {
    #[default]
    Standalone,
    ReplicaSet,
    Sharded,
}

/// Fixture handle for the deployment a workload runs against. Passed to
/// lifecycle hooks and `skip` predicates.
#[async_trait]
pub trait Cluster: Send + Sync {
    fn kind(&self) -> ClusterKind {
        ClusterKind::Standalone
    }

    /// Opens a connection. Called once for shared connections and once per
    /// worker when connections are not shared.
    async fn connect(&self) -> Result<Arc<dyn ServerHandle>, DynError>;

    /// Named groups of direct connections (e.g. routers, shards) handed to
    /// state handlers of workloads that ask for them.
    fn connection_cache(&self) -> Option<ConnectionCache> {
        None
    }
}
