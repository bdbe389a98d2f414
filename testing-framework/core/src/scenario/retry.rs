use std::{error::Error, fmt, sync::Arc, time::Duration};

use super::{
    DynError,
    cluster::{ServerError, TRANSIENT_TRANSACTION_LABEL},
};

const DEFAULT_MAX_RETRIES: u32 = 5;

// NotWritablePrimary, NotPrimaryNoSecondaryOk, PrimarySteppedDown,
// InterruptedDueToReplStateChange, ShutdownInProgress.
const NOT_PRIMARY_CODES: &[i32] = &[10107, 13435, 189, 11602, 91];
// Interrupted, CursorKilled, QueryPlanKilled, NoSuchTransaction.
const SESSION_KILLED_CODES: &[i32] = &[11601, 237, 175, 251];
// ConflictingOperationInProgress.
const CONFLICTING_OPERATION_CODES: &[i32] = &[117];
// StaleConfig, StaleShardVersion, StaleEpoch.
const STALE_ROUTING_CODES: &[i32] = &[13388, 63, 150];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    Retryable,
    Fatal,
}

/// What the runner does after a retryable failure.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RetryMode {
    /// Re-invoke the same state.
    #[default]
    SameState,
    /// Treat the invocation as done and pick the next state.
    Advance,
}

/// Families of server errors a workload may expect while racing other
/// operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Network,
    NotPrimary,
    SessionKilled,
    ConflictingOperation,
    StaleRouting,
    TransientTransaction,
}

impl ErrorCategory {
    #[must_use]
    pub fn matches(self, error: &ServerError) -> bool {
        let code_in = |codes: &[i32]| error.code.is_some_and(|code| codes.contains(&code));
        match self {
            Self::Network => error.is_network(),
            Self::NotPrimary => code_in(NOT_PRIMARY_CODES),
            Self::SessionKilled => code_in(SESSION_KILLED_CODES),
            Self::ConflictingOperation => code_in(CONFLICTING_OPERATION_CODES),
            Self::StaleRouting => code_in(STALE_ROUTING_CODES),
            Self::TransientTransaction => error.has_label(TRANSIENT_TRANSACTION_LABEL),
        }
    }
}

/// Workload-side context for [`RetryPolicy::should_count_as_dirty`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DirtyFlags {
    /// The failed call could have modified data.
    pub write_in_flight: bool,
    /// The failed call ran inside a multi-statement transaction.
    pub in_transaction: bool,
}

type Classifier = Arc<dyn Fn(&DynError) -> Option<Disposition> + Send + Sync>;

/// Decides which handler errors are expected races with the server and may be
/// retried. Supplied per workload; the default treats every error as fatal.
#[derive(Clone)]
pub struct RetryPolicy {
    categories: Vec<ErrorCategory>,
    classifier: Option<Classifier>,
    max_retries: u32,
    mode: RetryMode,
    backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            categories: Vec::new(),
            classifier: None,
            max_retries: DEFAULT_MAX_RETRIES,
            mode: RetryMode::SameState,
            backoff: Duration::ZERO,
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("categories", &self.categories)
            .field("custom_classifier", &self.classifier.is_some())
            .field("max_retries", &self.max_retries)
            .field("mode", &self.mode)
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn retry_on(mut self, category: ErrorCategory) -> Self {
        if !self.categories.contains(&category) {
            self.categories.push(category);
        }
        self
    }

    #[must_use]
    pub fn retry_on_all(self, categories: impl IntoIterator<Item = ErrorCategory>) -> Self {
        categories.into_iter().fold(self, Self::retry_on)
    }

    /// Consulted before the categories. Returning `None` defers to them.
    #[must_use]
    pub fn with_classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&DynError) -> Option<Disposition> + Send + Sync + 'static,
    {
        self.classifier = Some(Arc::new(classifier));
        self
    }

    /// Bound on consecutive retryable failures before the worker gives up.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub const fn mode(mut self, mode: RetryMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub const fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn categories(&self) -> &[ErrorCategory] {
        &self.categories
    }

    #[must_use]
    pub const fn retry_limit(&self) -> u32 {
        self.max_retries
    }

    #[must_use]
    pub const fn retry_mode(&self) -> RetryMode {
        self.mode
    }

    #[must_use]
    pub const fn retry_backoff(&self) -> Duration {
        self.backoff
    }

    #[must_use]
    pub fn classify(&self, error: &DynError) -> Disposition {
        if let Some(disposition) = self.classifier.as_ref().and_then(|classify| classify(error)) {
            return disposition;
        }

        match find_server_error(error) {
            Some(server_error)
                if self
                    .categories
                    .iter()
                    .any(|category| category.matches(server_error)) =>
            {
                Disposition::Retryable
            }
            _ => Disposition::Fatal,
        }
    }

    /// Whether a retryable failure leaves the outcome of a write unknown: the
    /// connection dropped or the operation was interrupted after the server
    /// may have applied it. Aborted transactions apply nothing.
    #[must_use]
    pub fn should_count_as_dirty(&self, error: &DynError, flags: DirtyFlags) -> bool {
        if !flags.write_in_flight || self.classify(error) != Disposition::Retryable {
            return false;
        }
        let Some(server_error) = find_server_error(error) else {
            return false;
        };
        if flags.in_transaction && ErrorCategory::TransientTransaction.matches(server_error) {
            return false;
        }

        ErrorCategory::Network.matches(server_error)
            || ErrorCategory::SessionKilled.matches(server_error)
            || ErrorCategory::NotPrimary.matches(server_error)
    }
}

/// Finds a [`ServerError`] anywhere in the error's source chain.
fn find_server_error(error: &DynError) -> Option<&ServerError> {
    let root: &(dyn Error + 'static) = &**error;
    std::iter::successors(Some(root), |err| (*err).source())
        .find_map(|err| err.downcast_ref::<ServerError>())
}
