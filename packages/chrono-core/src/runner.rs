//! Task runner: a supervised async unit of work.
//!
//! A runner executes a caller-supplied future exactly once on the tokio
//! runtime and reports completion (normal or error) through a single-shot
//! signal. Processors use runners for their poll loops: a runner that
//! returns an error can be replaced with a fresh one without tearing the
//! processor down.

use anyhow::{anyhow, Result};
use std::future::Future;
use tokio::sync::oneshot;

/// Handle to a spawned async unit.
///
/// Dropping the handle does not cancel the unit; cancellation is the
/// responsibility of the future itself (processors thread a stop token
/// through their loops).
pub struct TaskRunner {
    completion: oneshot::Receiver<Result<()>>,
}

impl TaskRunner {
    /// Spawn the unit onto the runtime.
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = future.await;
            // Receiver may be gone if the owner was abandoned at shutdown.
            let _ = tx.send(result);
        });
        Self { completion: rx }
    }

    /// Wait for the unit to finish and return its result.
    ///
    /// A dropped signal (the unit panicked before reporting) is surfaced as
    /// an error rather than a hang.
    pub async fn wait(self) -> Result<()> {
        match self.completion.await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("task runner terminated without signaling completion")),
        }
    }
}

impl std::fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner").finish()
    }
}
