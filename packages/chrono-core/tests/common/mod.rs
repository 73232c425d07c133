//! Shared helpers for the end-to-end suite.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use chrono_core::{
    async_trait, ClaimQuery, DeleteTaskKey, DeleteTaskOptions, EventEnvelope, ProcessorConfig,
    ScheduleTaskInput, Task, TaskStore, TaskStoreError,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Tight intervals so the suite runs in milliseconds, with a generous stale
/// timeout so nothing is re-claimed mid-test.
pub fn fast_processor_config() -> ProcessorConfig {
    ProcessorConfig {
        max_concurrency: 1,
        claim_interval: Duration::from_millis(10),
        idle_interval: Duration::from_millis(25),
        claim_stale_timeout: Duration::from_secs(5),
        task_handler_timeout: Duration::from_secs(2),
        task_handler_max_retries: 5,
        process_loop_retry_interval: Duration::from_millis(50),
    }
}

/// Receive events until the predicate matches, returning everything seen
/// (the matching event last). Panics on timeout.
pub async fn collect_until<E, F>(
    receiver: &mut broadcast::Receiver<EventEnvelope<E>>,
    timeout: Duration,
    mut predicate: F,
) -> Vec<E>
where
    E: Clone + Send + 'static,
    F: FnMut(&E) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    let mut seen = Vec::new();
    loop {
        match tokio::time::timeout_at(deadline, receiver.recv()).await {
            Ok(Ok(envelope)) => {
                let matched = predicate(&envelope.event);
                seen.push(envelope.event);
                if matched {
                    return seen;
                }
            }
            Ok(Err(recv_error)) => panic!("event channel closed: {recv_error}"),
            Err(_) => panic!(
                "timed out waiting for event after {} events",
                seen.len()
            ),
        }
    }
}

/// Store wrapper that injects failures into `claim` and `complete`.
///
/// Used to drive the completion-failure and unknown-processing-error paths
/// without a misbehaving backend.
pub struct FaultyStore<S> {
    inner: S,
    fail_completes: AtomicBool,
    failing_claims_remaining: AtomicUsize,
}

impl<S> FaultyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_completes: AtomicBool::new(false),
            failing_claims_remaining: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Make every `complete` call fail until turned off again.
    pub fn set_fail_completes(&self, fail: bool) {
        self.fail_completes.store(fail, Ordering::SeqCst);
    }

    /// Make the next `count` claim calls fail.
    pub fn fail_next_claims(&self, count: usize) {
        self.failing_claims_remaining.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl<S: TaskStore> TaskStore for FaultyStore<S> {
    async fn schedule(&self, input: ScheduleTaskInput) -> Result<Task, TaskStoreError> {
        self.inner.schedule(input).await
    }

    async fn claim(&self, query: ClaimQuery) -> Result<Option<Task>, TaskStoreError> {
        let remaining = self.failing_claims_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_claims_remaining
                .store(remaining - 1, Ordering::SeqCst);
            return Err(anyhow!("injected claim failure").into());
        }
        self.inner.claim(query).await
    }

    async fn retry(
        &self,
        id: Uuid,
        next_scheduled_at: DateTime<Utc>,
    ) -> Result<Task, TaskStoreError> {
        self.inner.retry(id, next_scheduled_at).await
    }

    async fn complete(&self, id: Uuid) -> Result<Task, TaskStoreError> {
        if self.fail_completes.load(Ordering::SeqCst) {
            return Err(anyhow!("injected completion failure").into());
        }
        self.inner.complete(id).await
    }

    async fn fail(&self, id: Uuid) -> Result<Task, TaskStoreError> {
        self.inner.fail(id).await
    }

    async fn delete(
        &self,
        key: DeleteTaskKey,
        options: DeleteTaskOptions,
    ) -> Result<Option<Task>, TaskStoreError> {
        self.inner.delete(key, options).await
    }

    fn claim_stale_timeout(&self) -> Duration {
        self.inner.claim_stale_timeout()
    }
}
