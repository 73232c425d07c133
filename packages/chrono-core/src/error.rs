//! Configuration and lifecycle errors for the scheduler.
//!
//! These are the errors the synchronous API surface raises at
//! registration/installation time. Runtime failures never use these types:
//! store failures flow through [`TaskStoreError`](crate::TaskStoreError) and
//! handler failures through the retry state machine.

use std::time::Duration;

use thiserror::Error;

/// Structured error type for scheduler configuration and lifecycle.
#[derive(Debug, Error)]
pub enum ChronoError {
    /// A task handler is already registered for this kind.
    #[error("a task handler is already registered for kind {kind}")]
    HandlerAlreadyRegistered {
        /// The task kind that was registered twice.
        kind: String,
    },

    /// Handlers must be registered before the scheduler is started.
    #[error("cannot register a task handler after the scheduler has started")]
    RegisterAfterStart,

    /// Plugins must be installed before the scheduler is started.
    #[error("cannot install a plugin after the scheduler has started")]
    PluginAfterStart,

    /// The handler timeout must be strictly less than the claim stale
    /// timeout, otherwise a slow handler's task would be re-offered for
    /// claim while the handler is still running.
    #[error(
        "task handler timeout {handler_timeout:?} must be strictly less than \
         the claim stale timeout {claim_stale_timeout:?}"
    )]
    HandlerTimeoutTooLarge {
        handler_timeout: Duration,
        claim_stale_timeout: Duration,
    },

    /// Processors did not shut down within the exit deadline.
    #[error("processors did not stop within {timeout:?}")]
    StopTimedOut { timeout: Duration },

    /// A plugin start hook returned an error; the scheduler was not started.
    #[error("start hook {index} failed: {source}")]
    StartHookFailed {
        /// Zero-based position of the hook in registration (FIFO) order.
        index: usize,
        #[source]
        source: anyhow::Error,
    },
}
