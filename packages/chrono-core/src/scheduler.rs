//! Scheduler façade.
//!
//! [`Chrono`] owns the store handle, the kind→processor map, the plugin hook
//! registry and the scheduler-level event bus. Registration and plugin
//! installation mutate the map through `&mut self` and are rejected after
//! `start`; once started, the map is read-only and the hot path takes no
//! lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use typed_builder::TypedBuilder;

use crate::backoff::BackoffStrategyOptions;
use crate::bus::{EventBus, EventEnvelope};
use crate::error::ChronoError;
use crate::events::{ProcessorEvent, SchedulerEvent};
use crate::handler::box_task_handler;
use crate::plugin::{LifecycleHook, Plugin, PluginContext};
use crate::processor::{Processor, ProcessorConfig};
use crate::store::{DeleteTaskOptions, TaskStore, TaskStoreError};
use crate::task::{DeleteTaskKey, ScheduleTaskInput, Task};

/// Default deadline for processor shutdown during `stop`.
const DEFAULT_EXIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Options for registering a task handler.
#[derive(TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct RegisterTaskHandlerOptions {
    /// The task kind the handler serves.
    pub kind: String,

    /// Processor tuning; defaults per [`ProcessorConfig::default`].
    #[builder(default)]
    pub processor: ProcessorConfig,

    /// Retry backoff; defaults to immediate retries.
    #[builder(default)]
    pub backoff: BackoffStrategyOptions,
}

/// The scheduler façade.
///
/// # Example
///
/// ```ignore
/// let mut chrono = Chrono::new(MemoryTaskStore::new());
///
/// chrono.register_task_handler(
///     RegisterTaskHandlerOptions::builder().kind("send-email").build(),
///     |task| async move {
///         let email: Email = task.data_as()?;
///         deliver(email).await
///     },
/// )?;
///
/// chrono.schedule(
///     ScheduleTaskInput::builder()
///         .kind("send-email")
///         .data(serde_json::to_value(&email)?)
///         .build(),
/// ).await?;
///
/// chrono.start().await?;
/// // ...
/// chrono.stop().await;
/// ```
pub struct Chrono<S: TaskStore> {
    store: Arc<S>,
    processors: HashMap<String, Processor<S>>,
    bus: EventBus<SchedulerEvent>,
    start_hooks: Vec<LifecycleHook>,
    stop_hooks: Vec<LifecycleHook>,
    plugins: Vec<String>,
    started: AtomicBool,
    exit_timeout: Duration,
}

impl<S: TaskStore> Chrono<S> {
    /// Create a scheduler backed by the given store.
    pub fn new(store: S) -> Self {
        Self {
            store: Arc::new(store),
            processors: HashMap::new(),
            bus: EventBus::new(),
            start_hooks: Vec::new(),
            stop_hooks: Vec::new(),
            plugins: Vec::new(),
            started: AtomicBool::new(false),
            exit_timeout: DEFAULT_EXIT_TIMEOUT,
        }
    }

    /// Override the shutdown deadline applied by [`Chrono::stop`].
    pub fn with_exit_timeout(mut self, exit_timeout: Duration) -> Self {
        self.exit_timeout = exit_timeout;
        self
    }

    /// Shared handle to the store.
    pub fn datastore(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }

    /// The scheduler-level event bus.
    pub fn events(&self) -> &EventBus<SchedulerEvent> {
        &self.bus
    }

    /// Subscribe to a processor's event stream, if the kind is registered.
    pub fn processor_events(
        &self,
        kind: &str,
    ) -> Option<broadcast::Receiver<EventEnvelope<ProcessorEvent>>> {
        self.processors
            .get(kind)
            .map(|processor| processor.events().subscribe())
    }

    /// Snapshot of the registered task kinds, sorted.
    pub fn registered_task_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.processors.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Names of the installed plugins, in installation order.
    pub fn installed_plugins(&self) -> &[String] {
        &self.plugins
    }

    /// Persist a task for future (or immediate) execution.
    ///
    /// Emits `TaskScheduled` on success, `TaskScheduleFailed` on error; the
    /// error is returned to the caller either way.
    pub async fn schedule(&self, input: ScheduleTaskInput) -> Result<Task, TaskStoreError> {
        match self.store.schedule(input.clone()).await {
            Ok(task) => {
                debug!(kind = %task.kind, task_id = %task.id, "task scheduled");
                self.bus.emit(SchedulerEvent::TaskScheduled { task: task.clone() });
                Ok(task)
            }
            Err(schedule_error) => {
                warn!(kind = %input.kind, error = %schedule_error, "failed to schedule task");
                self.bus.emit(SchedulerEvent::TaskScheduleFailed {
                    error: schedule_error.to_string(),
                    input,
                });
                Err(schedule_error)
            }
        }
    }

    /// Remove a task by id or `(kind, idempotency_key)`.
    ///
    /// Emits `TaskDeleted` when a task was removed, `TaskDeleteFailed` on
    /// error. A forced miss returns `None` without an event.
    pub async fn delete(
        &self,
        key: impl Into<DeleteTaskKey>,
        options: DeleteTaskOptions,
    ) -> Result<Option<Task>, TaskStoreError> {
        let key = key.into();
        match self.store.delete(key.clone(), options).await {
            Ok(Some(task)) => {
                debug!(kind = %task.kind, task_id = %task.id, "task deleted");
                self.bus.emit(SchedulerEvent::TaskDeleted { task: task.clone() });
                Ok(Some(task))
            }
            Ok(None) => Ok(None),
            Err(delete_error) => {
                warn!(key = %key, error = %delete_error, "failed to delete task");
                self.bus.emit(SchedulerEvent::TaskDeleteFailed {
                    error: delete_error.to_string(),
                    key,
                });
                Err(delete_error)
            }
        }
    }

    /// Register a handler for a task kind and construct its processor.
    ///
    /// The processor is not started here; `start` starts every registered
    /// processor. Fails if the kind is already registered, if the scheduler
    /// has started, or if the handler timeout is not strictly below both the
    /// processor's and the store's claim-stale timeout.
    pub fn register_task_handler<F, Fut>(
        &mut self,
        options: RegisterTaskHandlerOptions,
        handler: F,
    ) -> Result<(), ChronoError>
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.started.load(Ordering::SeqCst) {
            return Err(ChronoError::RegisterAfterStart);
        }
        if self.processors.contains_key(&options.kind) {
            return Err(ChronoError::HandlerAlreadyRegistered { kind: options.kind });
        }
        options
            .processor
            .validate(self.store.claim_stale_timeout())?;

        info!(kind = %options.kind, "registered task handler");
        let processor = Processor::new(
            options.kind.clone(),
            Arc::clone(&self.store),
            box_task_handler(handler),
            options.processor,
            options.backoff,
        );
        self.processors.insert(options.kind, processor);
        Ok(())
    }

    /// Install a plugin and return its typed API.
    ///
    /// Must be called before `start`. The plugin's `register` runs
    /// synchronously against the current registration state.
    pub fn use_plugin<P: Plugin<S>>(&mut self, plugin: P) -> Result<P::Api, ChronoError> {
        if self.started.load(Ordering::SeqCst) {
            return Err(ChronoError::PluginAfterStart);
        }

        let name = plugin.name().to_string();
        info!(plugin = %name, "installing plugin");

        let mut ctx = PluginContext {
            start_hooks: &mut self.start_hooks,
            stop_hooks: &mut self.stop_hooks,
            store: Arc::clone(&self.store),
            processors: &self.processors,
        };
        let api = plugin.register(&mut ctx);
        self.plugins.push(name);
        Ok(api)
    }

    /// Run start hooks (FIFO) and start every processor.
    ///
    /// A failing hook aborts the start: no processors are started and the
    /// error is returned. Emits `Started` on success.
    pub async fn start(&self) -> Result<(), ChronoError> {
        self.started.store(true, Ordering::SeqCst);
        info!(kinds = self.processors.len(), "starting scheduler");

        for (index, hook) in self.start_hooks.iter().enumerate() {
            hook()
                .await
                .map_err(|source| ChronoError::StartHookFailed { index, source })?;
        }

        for processor in self.processors.values() {
            processor.start().await;
        }

        self.bus.emit(SchedulerEvent::Started);
        Ok(())
    }

    /// Stop every processor in parallel, bounded by the exit timeout, then
    /// run stop hooks (LIFO).
    ///
    /// Emits `Stopped` when shutdown completes in time, `StopAborted` when
    /// the deadline elapses (in-flight runners are abandoned at their next
    /// loop boundary), and `Close` at the end either way.
    pub async fn stop(&self) {
        info!(kinds = self.processors.len(), "stopping scheduler");

        let shutdowns = self.processors.values().map(|processor| processor.stop());
        match tokio::time::timeout(self.exit_timeout, join_all(shutdowns)).await {
            Ok(_) => {
                self.bus.emit(SchedulerEvent::Stopped);
            }
            Err(_) => {
                let stop_error = ChronoError::StopTimedOut {
                    timeout: self.exit_timeout,
                };
                error!(error = %stop_error, "processor shutdown exceeded the exit timeout");
                self.bus.emit(SchedulerEvent::StopAborted {
                    error: stop_error.to_string(),
                });
            }
        }

        for hook in self.stop_hooks.iter().rev() {
            if let Err(hook_error) = hook().await {
                error!(error = %format!("{hook_error:#}"), "stop hook failed");
            }
        }

        self.bus.emit(SchedulerEvent::Close);
        info!("scheduler closed");
    }
}

impl<S: TaskStore> std::fmt::Debug for Chrono<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chrono")
            .field("kinds", &self.registered_task_kinds())
            .field("plugins", &self.plugins)
            .field("started", &self.started.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_options_builder_defaults() {
        let options = RegisterTaskHandlerOptions::builder()
            .kind("send-email")
            .build();
        assert_eq!(options.kind, "send-email");
        assert_eq!(options.processor.max_concurrency, 1);
        assert_eq!(options.backoff, BackoffStrategyOptions::None);
    }
}
