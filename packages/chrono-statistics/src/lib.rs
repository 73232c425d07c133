//! Statistics-collector plugin.
//!
//! Subscribes to every registered processor's event stream and aggregates
//! per-kind counters. Collectors start with the scheduler's start hooks and
//! wind down on its stop hooks via a cancellation token; an aborted interval
//! is a normal exit, not an error.
//!
//! Counters are observational: events are delivered at-most-once, so a
//! lagged collector undercounts rather than blocking a processor.
//!
//! # Example
//!
//! ```ignore
//! let mut chrono = Chrono::new(MemoryTaskStore::new());
//! chrono.register_task_handler(/* ... */)?;
//!
//! let statistics = chrono.use_plugin(StatisticsPlugin::new())?;
//! chrono.start().await?;
//! // ...
//! let counts = statistics.for_kind("send-email").unwrap_or_default();
//! println!("completed: {}", counts.completed);
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chrono_core::{EventEnvelope, Plugin, PluginContext, ProcessorEvent, TaskStore};

/// Per-kind event counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskStatistics {
    pub claimed: u64,
    pub completed: u64,
    pub retries_scheduled: u64,
    pub failed: u64,
    pub completion_failures: u64,
    pub processing_errors: u64,
}

impl TaskStatistics {
    fn record(&mut self, event: &ProcessorEvent) {
        match event {
            ProcessorEvent::TaskClaimed { .. } => self.claimed += 1,
            ProcessorEvent::TaskCompleted { .. } => self.completed += 1,
            ProcessorEvent::TaskRetryScheduled { .. } => self.retries_scheduled += 1,
            ProcessorEvent::TaskFailed { .. } => self.failed += 1,
            ProcessorEvent::TaskCompletionFailure { .. } => self.completion_failures += 1,
            ProcessorEvent::UnknownProcessingError { .. } => self.processing_errors += 1,
        }
    }
}

/// Read handle to the aggregated counters; the plugin's API value.
#[derive(Clone)]
pub struct StatisticsHandle {
    counters: Arc<DashMap<String, TaskStatistics>>,
}

impl StatisticsHandle {
    /// Counters for one kind, if it was registered.
    pub fn for_kind(&self, kind: &str) -> Option<TaskStatistics> {
        self.counters.get(kind).map(|entry| *entry.value())
    }

    /// Snapshot of every kind's counters.
    pub fn snapshot(&self) -> HashMap<String, TaskStatistics> {
        self.counters
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}

impl std::fmt::Debug for StatisticsHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatisticsHandle")
            .field("kinds", &self.counters.len())
            .finish()
    }
}

/// The plugin: install with
/// [`Chrono::use_plugin`](chrono_core::Chrono::use_plugin) after registering
/// the task handlers you want observed.
pub struct StatisticsPlugin {
    report_interval: Option<Duration>,
}

impl StatisticsPlugin {
    /// Collect counters without periodic reporting.
    pub fn new() -> Self {
        Self {
            report_interval: None,
        }
    }

    /// Additionally log a per-kind summary on the given interval.
    pub fn with_report_interval(report_interval: Duration) -> Self {
        Self {
            report_interval: Some(report_interval),
        }
    }
}

impl Default for StatisticsPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: TaskStore> Plugin<S> for StatisticsPlugin {
    type Api = StatisticsHandle;

    fn name(&self) -> &str {
        "statistics"
    }

    fn register(self, ctx: &mut PluginContext<'_, S>) -> StatisticsHandle {
        let counters: Arc<DashMap<String, TaskStatistics>> = Arc::new(DashMap::new());

        // Subscribe at registration time so the streams cover everything
        // emitted from start onward; collectors drain them once started.
        let mut subscriptions = Vec::new();
        for kind in ctx.registered_task_kinds() {
            counters.insert(kind.clone(), TaskStatistics::default());
            if let Some(receiver) = ctx.subscribe_processor_events(&kind) {
                subscriptions.push((kind, receiver));
            }
        }

        let token = CancellationToken::new();
        let pending: Arc<Mutex<Option<Subscriptions>>> = Arc::new(Mutex::new(Some(subscriptions)));
        let workers: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));
        let report_interval = self.report_interval;

        {
            let counters = Arc::clone(&counters);
            let token = token.clone();
            let pending = Arc::clone(&pending);
            let workers = Arc::clone(&workers);
            ctx.on_start(move || {
                let counters = Arc::clone(&counters);
                let token = token.clone();
                let pending = Arc::clone(&pending);
                let workers = Arc::clone(&workers);
                async move {
                    let Some(subscriptions) = pending.lock().await.take() else {
                        // Collectors from a previous start were already
                        // consumed; nothing to do.
                        return Ok(());
                    };

                    let mut handles = workers.lock().await;
                    for (kind, receiver) in subscriptions {
                        handles.push(tokio::spawn(collect_events(
                            kind,
                            receiver,
                            Arc::clone(&counters),
                            token.child_token(),
                        )));
                    }
                    if let Some(interval) = report_interval {
                        handles.push(tokio::spawn(report_loop(
                            interval,
                            Arc::clone(&counters),
                            token.child_token(),
                        )));
                    }
                    Ok(())
                }
            });
        }

        {
            let token = token.clone();
            let workers = Arc::clone(&workers);
            ctx.on_stop(move || {
                let token = token.clone();
                let workers = Arc::clone(&workers);
                async move {
                    token.cancel();
                    let handles: Vec<JoinHandle<()>> = workers.lock().await.drain(..).collect();
                    for handle in handles {
                        if let Err(join_error) = handle.await {
                            warn!(error = %join_error, "statistics worker exited abnormally");
                        }
                    }
                    Ok(())
                }
            });
        }

        StatisticsHandle { counters }
    }
}

type Subscriptions = Vec<(String, broadcast::Receiver<EventEnvelope<ProcessorEvent>>)>;

/// Drain one processor's event stream into the counters until cancelled.
async fn collect_events(
    kind: String,
    mut receiver: broadcast::Receiver<EventEnvelope<ProcessorEvent>>,
    counters: Arc<DashMap<String, TaskStatistics>>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                // Drain whatever was already emitted before shutting down.
                while let Ok(envelope) = receiver.try_recv() {
                    counters
                        .entry(kind.clone())
                        .or_default()
                        .record(&envelope.event);
                }
                break;
            }
            received = receiver.recv() => match received {
                Ok(envelope) => {
                    counters
                        .entry(kind.clone())
                        .or_default()
                        .record(&envelope.event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(kind = %kind, skipped, "statistics collector lagged; counters undercount");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    debug!(kind = %kind, "statistics collector stopped");
}

/// Log a per-kind summary on an interval until cancelled.
async fn report_loop(
    interval: Duration,
    counters: Arc<DashMap<String, TaskStatistics>>,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // consume the immediate first tick
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                for entry in counters.iter() {
                    let stats = entry.value();
                    info!(
                        kind = %entry.key(),
                        claimed = stats.claimed,
                        completed = stats.completed,
                        retries_scheduled = stats.retries_scheduled,
                        failed = stats.failed,
                        completion_failures = stats.completion_failures,
                        processing_errors = stats.processing_errors,
                        "task statistics"
                    );
                }
            }
        }
    }
    debug!("statistics reporter stopped");
}
