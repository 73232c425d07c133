//! Per-kind task processor.
//!
//! A processor turns the store's atomic claim primitive plus a user handler
//! into a bounded-concurrency execution service for one task kind. It owns
//! N runner loops, enforces the handler timeout, translates handler
//! outcomes into store transitions and emits lifecycle events on its own
//! bus.
//!
//! # Architecture
//!
//! ```text
//! Processor (one per kind)
//!     │
//!     ├─► runner loop × max_concurrency
//!     │       ├─► store.claim(kind, claim_stale_timeout)
//!     │       ├─► handler(task) under task_handler_timeout
//!     │       └─► store.complete / store.retry / store.fail
//!     │
//!     └─► EventBus<ProcessorEvent>
//! ```
//!
//! A runner that hits an unexpected store error is replaced after a cooldown
//! rather than terminating the processor.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffStrategyOptions;
use crate::bus::EventBus;
use crate::error::ChronoError;
use crate::events::ProcessorEvent;
use crate::handler::BoxedTaskHandler;
use crate::runner::TaskRunner;
use crate::store::{ClaimQuery, TaskStore};
use crate::task::Task;

/// Configuration for a per-kind processor.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Number of parallel claim loops.
    pub max_concurrency: usize,
    /// Pause after a successful claim+handle, before the next claim.
    pub claim_interval: Duration,
    /// Pause after an empty claim.
    pub idle_interval: Duration,
    /// Passed to the store on every claim; also the ceiling the handler
    /// timeout is validated against at registration.
    pub claim_stale_timeout: Duration,
    /// Hard deadline around one handler invocation. Must be strictly less
    /// than `claim_stale_timeout`.
    pub task_handler_timeout: Duration,
    /// Inclusive upper bound on `retry_count` past which a task is
    /// terminally failed instead of retried.
    pub task_handler_max_retries: u32,
    /// Cooldown after an unexpected loop error before a replacement runner
    /// starts.
    pub process_loop_retry_interval: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 1,
            claim_interval: Duration::from_millis(50),
            idle_interval: Duration::from_secs(5),
            claim_stale_timeout: Duration::from_secs(10),
            task_handler_timeout: Duration::from_secs(5),
            task_handler_max_retries: 5,
            process_loop_retry_interval: Duration::from_secs(20),
        }
    }
}

impl ProcessorConfig {
    /// Check the timeout ordering against this configuration and the
    /// store's claim-stale ceiling.
    pub(crate) fn validate(&self, store_ceiling: Duration) -> Result<(), ChronoError> {
        if self.task_handler_timeout >= self.claim_stale_timeout {
            return Err(ChronoError::HandlerTimeoutTooLarge {
                handler_timeout: self.task_handler_timeout,
                claim_stale_timeout: self.claim_stale_timeout,
            });
        }
        if self.task_handler_timeout >= store_ceiling {
            return Err(ChronoError::HandlerTimeoutTooLarge {
                handler_timeout: self.task_handler_timeout,
                claim_stale_timeout: store_ceiling,
            });
        }
        Ok(())
    }
}

/// Bounded-concurrency execution service for one task kind.
pub struct Processor<S> {
    inner: Arc<ProcessorInner<S>>,
    runners: Mutex<Vec<TaskRunner>>,
}

struct ProcessorInner<S> {
    kind: String,
    store: Arc<S>,
    handler: BoxedTaskHandler,
    config: ProcessorConfig,
    backoff: BackoffStrategyOptions,
    bus: EventBus<ProcessorEvent>,
    shutdown: CancellationToken,
}

impl<S: TaskStore> Processor<S> {
    pub(crate) fn new(
        kind: String,
        store: Arc<S>,
        handler: BoxedTaskHandler,
        config: ProcessorConfig,
        backoff: BackoffStrategyOptions,
    ) -> Self {
        Self {
            inner: Arc::new(ProcessorInner {
                kind,
                store,
                handler,
                config,
                backoff,
                bus: EventBus::new(),
                shutdown: CancellationToken::new(),
            }),
            runners: Mutex::new(Vec::new()),
        }
    }

    /// The task kind this processor serves.
    pub fn kind(&self) -> &str {
        &self.inner.kind
    }

    /// The processor's event bus.
    pub fn events(&self) -> &EventBus<ProcessorEvent> {
        &self.inner.bus
    }

    /// Spawn the claim loops.
    ///
    /// Idempotent: a second call while runners exist is a no-op, as is any
    /// call after stop has been requested.
    pub async fn start(&self) {
        if self.inner.shutdown.is_cancelled() {
            debug!(kind = %self.inner.kind, "stop already requested; not starting");
            return;
        }

        let mut runners = self.runners.lock().await;
        if !runners.is_empty() {
            return;
        }

        info!(
            kind = %self.inner.kind,
            max_concurrency = self.inner.config.max_concurrency,
            "starting processor"
        );
        for slot in 0..self.inner.config.max_concurrency {
            runners.push(TaskRunner::spawn(supervise(Arc::clone(&self.inner), slot)));
        }
    }

    /// Request stop and wait for every runner to exit.
    ///
    /// Idempotent. Runners observe the stop signal at loop boundaries;
    /// sleeps are interrupted, but an in-flight handler is awaited up to its
    /// own timeout.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();

        let runners: Vec<TaskRunner> = self.runners.lock().await.drain(..).collect();
        if runners.is_empty() {
            return;
        }

        debug!(kind = %self.inner.kind, count = runners.len(), "waiting for runners to exit");
        for runner in runners {
            if let Err(error) = runner.wait().await {
                warn!(
                    kind = %self.inner.kind,
                    error = %error,
                    "runner exited abnormally during shutdown"
                );
            }
        }
        info!(kind = %self.inner.kind, "processor stopped");
    }
}

impl<S> std::fmt::Debug for Processor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("kind", &self.inner.kind)
            .field("max_concurrency", &self.inner.config.max_concurrency)
            .finish()
    }
}

/// Keep one runner slot occupied until stop is requested.
///
/// A clean loop exit means stop; an error is emitted as
/// `UnknownProcessingError` and a replacement runner starts after the
/// cooldown.
async fn supervise<S: TaskStore>(inner: Arc<ProcessorInner<S>>, slot: usize) -> Result<()> {
    loop {
        let runner = TaskRunner::spawn(process_loop(Arc::clone(&inner), slot));
        match runner.wait().await {
            Ok(()) => break,
            Err(loop_error) => {
                let message = format!("{loop_error:#}");
                error!(
                    kind = %inner.kind,
                    slot,
                    error = %message,
                    "unexpected processing error; cooling down"
                );
                inner
                    .bus
                    .emit(ProcessorEvent::UnknownProcessingError { error: message });
                if !inner
                    .sleep_unless_stopped(inner.config.process_loop_retry_interval)
                    .await
                {
                    break;
                }
            }
        }
    }
    debug!(kind = %inner.kind, slot, "runner slot exited");
    Ok(())
}

/// Claim and handle one task at a time until stop is requested.
async fn process_loop<S: TaskStore>(inner: Arc<ProcessorInner<S>>, slot: usize) -> Result<()> {
    while !inner.shutdown.is_cancelled() {
        let query = ClaimQuery {
            kind: inner.kind.clone(),
            claim_stale_timeout: inner.config.claim_stale_timeout,
        };
        let claimed = inner.store.claim(query).await.context("claim failed")?;

        let Some(task) = claimed else {
            if !inner.sleep_unless_stopped(inner.config.idle_interval).await {
                break;
            }
            continue;
        };

        debug!(kind = %inner.kind, task_id = %task.id, slot, "claimed task");
        inner.bus.emit(ProcessorEvent::TaskClaimed {
            claimed_at: task.claimed_at.unwrap_or_else(Utc::now),
            task: task.clone(),
        });

        inner.handle_task(task).await?;

        if !inner.sleep_unless_stopped(inner.config.claim_interval).await {
            break;
        }
    }
    Ok(())
}

impl<S: TaskStore> ProcessorInner<S> {
    /// Sleep for `duration`, returning false if stop was requested first.
    async fn sleep_unless_stopped(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Run the handler for one claimed task and settle the outcome.
    ///
    /// Handler failures are settled here (retry or terminal failure); only a
    /// store-side failure of `retry`/`fail` escapes, onto the loop-error
    /// cooldown path.
    async fn handle_task(&self, task: Task) -> Result<()> {
        let started_at = Utc::now();

        match self.invoke_handler(task.clone()).await {
            Ok(()) => match self.store.complete(task.id).await {
                Ok(completed) => {
                    debug!(kind = %self.kind, task_id = %task.id, "task completed");
                    self.bus.emit(ProcessorEvent::TaskCompleted {
                        completed_at: completed.completed_at.unwrap_or_else(Utc::now),
                        task: completed,
                        started_at,
                    });
                }
                Err(complete_error) => {
                    // The work was done but the transition was not
                    // persisted; the stale claim will expire and the task
                    // may run again.
                    warn!(
                        kind = %self.kind,
                        task_id = %task.id,
                        error = %complete_error,
                        "handler succeeded but completion was not persisted"
                    );
                    self.bus.emit(ProcessorEvent::TaskCompletionFailure {
                        task,
                        error: complete_error.to_string(),
                    });
                }
            },
            Err(handler_error) => {
                let message = format!("{handler_error:#}");
                if task.retry_count >= self.config.task_handler_max_retries as i32 {
                    warn!(
                        kind = %self.kind,
                        task_id = %task.id,
                        retry_count = task.retry_count,
                        error = %message,
                        "handler failed with no retries remaining"
                    );
                    let failed = self
                        .store
                        .fail(task.id)
                        .await
                        .context("failed to mark task as failed")?;
                    self.bus.emit(ProcessorEvent::TaskFailed {
                        task: failed,
                        error: message,
                    });
                } else {
                    let delay = self.backoff.delay(task.retry_count.max(0) as u32);
                    let retry_scheduled_at = Utc::now()
                        + chrono::Duration::milliseconds(
                            delay.as_millis().min(i64::MAX as u128) as i64
                        );
                    debug!(
                        kind = %self.kind,
                        task_id = %task.id,
                        retry_count = task.retry_count,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "handler failed; scheduling retry"
                    );
                    let retried = self
                        .store
                        .retry(task.id, retry_scheduled_at)
                        .await
                        .context("failed to schedule task retry")?;
                    self.bus.emit(ProcessorEvent::TaskRetryScheduled {
                        task: retried,
                        error: message,
                        retry_scheduled_at,
                    });
                }
            }
        }

        Ok(())
    }

    /// Invoke the handler under the configured deadline.
    ///
    /// The handler future is spawned: a timeout stops the wait but does not
    /// cancel the handler's outstanding work. A panic is reported as a
    /// handler failure.
    async fn invoke_handler(&self, task: Task) -> Result<()> {
        let timeout = self.config.task_handler_timeout;
        let handle = tokio::spawn((self.handler)(task));
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(anyhow!("task handler panicked: {join_error}")),
            Err(_) => Err(anyhow!("task handler timed out after {timeout:?}")),
        }
    }
}
