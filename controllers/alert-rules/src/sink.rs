//! Failure reporting sink.
//!
//! Skipped directives and dropped queue keys are surfaced through an
//! injected sink rather than a process-wide singleton, so tests can assert
//! on reported failures deterministically.

use tracing::warn;

/// Receives operator-visible failure reports (skipped directives, dropped
/// queue keys). Implementations must be cheap; reporting happens on the
/// reconciliation hot path.
pub trait AlertSink: Send + Sync {
    /// Reports one failure message.
    fn report(&self, message: &str);
}

/// Default sink: a structured warning log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl AlertSink for TracingSink {
    fn report(&self, message: &str) {
        warn!("{message}");
    }
}
