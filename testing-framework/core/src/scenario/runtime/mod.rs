pub mod connections;
pub mod report;
pub mod runner;
pub mod scheduler;

use std::{
    any::Any,
    sync::{Arc, OnceLock},
};

use report::StopReason;

/// Cooperative stop request shared by the workers of one run. Workers observe
/// it at iteration boundaries; in-flight calls are never interrupted.
#[derive(Clone, Debug, Default)]
pub(crate) struct StopSignal {
    reason: Arc<OnceLock<StopReason>>,
}

impl StopSignal {
    /// Returns `false` if a stop had already been requested.
    pub(crate) fn request(&self, reason: StopReason) -> bool {
        self.reason.set(reason).is_ok()
    }

    pub(crate) fn reason(&self) -> Option<StopReason> {
        self.reason.get().copied()
    }

    pub(crate) fn is_requested(&self) -> bool {
        self.reason.get().is_some()
    }
}

/// Attempts to turn a panic payload into a readable string for diagnostics.
pub(crate) fn panic_message(panic: Box<dyn Any + Send>) -> String {
    panic.downcast::<String>().map_or_else(
        |panic| {
            panic.downcast::<&'static str>().map_or_else(
                |_| "unknown panic".to_owned(),
                |message| (*message).to_owned(),
            )
        },
        |message| *message,
    )
}
