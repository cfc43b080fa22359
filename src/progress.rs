//! User-facing progress reporting.
//!
//! Steps narrate what they are doing through a [`ProgressSink`]. The default
//! sink forwards to `tracing`; tests record the lines instead.

use tracing::{error, info};

/// Receives human-readable progress notices.
pub trait ProgressSink: Send + Sync {
    /// Announces a new phase of work.
    fn say(&self, message: &str);

    /// Reports a detail within the current phase.
    fn message(&self, message: &str);

    /// Reports a failure.
    fn error(&self, message: &str);
}

/// Sink that emits progress as `tracing` events.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn say(&self, message: &str) {
        info!(target: "olvm_builder::progress", "==> {message}");
    }

    fn message(&self, message: &str) {
        info!(target: "olvm_builder::progress", "    {message}");
    }

    fn error(&self, message: &str) {
        error!(target: "olvm_builder::progress", "{message}");
    }
}
