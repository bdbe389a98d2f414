use std::time::Duration;

use fsm_framework_core::scenario::{ErrorCategory, RetryMode, RetryPolicy, WorkloadBuilder};

const STEPDOWN_BACKOFF: Duration = Duration::from_millis(50);

/// Retry presets for workloads that run next to background interference.
pub trait WorkloadBuilderExt: Sized {
    /// Sessions may be killed underneath running operations.
    #[must_use]
    fn tolerate_killed_sessions(self) -> Self;

    /// The primary may step down; aborted transactions are retried too.
    #[must_use]
    fn tolerate_stepdowns(self) -> Self;

    /// Chunks may migrate, so routers can hold stale routing tables.
    #[must_use]
    fn tolerate_migrations(self) -> Self;

    #[must_use]
    fn tolerate_network_errors(self) -> Self;

    /// Give up on an interrupted state and move on instead of re-running it.
    #[must_use]
    fn advance_on_retryable_error(self) -> Self;
}

impl<D: Send + Sync + 'static> WorkloadBuilderExt for WorkloadBuilder<D> {
    fn tolerate_killed_sessions(self) -> Self {
        self.map_retry_policy(|policy| policy.retry_on(ErrorCategory::SessionKilled))
    }

    fn tolerate_stepdowns(self) -> Self {
        self.map_retry_policy(|policy| {
            with_min_backoff(
                policy.retry_on_all([
                    ErrorCategory::NotPrimary,
                    ErrorCategory::Network,
                    ErrorCategory::TransientTransaction,
                ]),
                STEPDOWN_BACKOFF,
            )
        })
    }

    fn tolerate_migrations(self) -> Self {
        self.map_retry_policy(|policy| {
            policy.retry_on_all([
                ErrorCategory::StaleRouting,
                ErrorCategory::ConflictingOperation,
            ])
        })
    }

    fn tolerate_network_errors(self) -> Self {
        self.map_retry_policy(|policy| policy.retry_on(ErrorCategory::Network))
    }

    fn advance_on_retryable_error(self) -> Self {
        self.map_retry_policy(|policy| policy.mode(RetryMode::Advance))
    }
}

fn with_min_backoff(policy: RetryPolicy, min: Duration) -> RetryPolicy {
    if policy.retry_backoff() >= min {
        policy
    } else {
        policy.backoff(min)
    }
}
