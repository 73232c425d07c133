//! Plugin surface: lifecycle hooks and register-time context.
//!
//! A plugin packages cross-cutting behavior (statistics, instrumentation,
//! resource management) behind a single `use_plugin` call. Registration runs
//! synchronously before the scheduler starts; the context hands the plugin
//! hooks and read-only views, never mutable access to the processor
//! registry.
//!
//! Start hooks run in FIFO order, stop hooks in LIFO order: a plugin that
//! opens a resource in its start hook tears it down after everything that
//! was started later.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::broadcast;

use crate::bus::EventEnvelope;
use crate::events::ProcessorEvent;
use crate::processor::Processor;
use crate::store::TaskStore;

/// Future returned by a lifecycle hook.
pub type LifecycleHookFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// A boxed async lifecycle hook.
pub type LifecycleHook = Box<dyn Fn() -> LifecycleHookFuture + Send + Sync>;

/// An installable extension.
///
/// `register` receives the context exactly once; the returned [`Plugin::Api`]
/// is handed back to the caller of
/// [`Chrono::use_plugin`](crate::Chrono::use_plugin), typed per plugin.
pub trait Plugin<S: TaskStore> {
    /// The value `use_plugin` returns to the caller.
    type Api;

    /// Human-readable plugin name, used in logs.
    fn name(&self) -> &str;

    /// Install the plugin: register hooks and subscriptions, build the API.
    fn register(self, ctx: &mut PluginContext<'_, S>) -> Self::Api;
}

/// Register-time surface handed to [`Plugin::register`].
pub struct PluginContext<'a, S> {
    pub(crate) start_hooks: &'a mut Vec<LifecycleHook>,
    pub(crate) stop_hooks: &'a mut Vec<LifecycleHook>,
    pub(crate) store: Arc<S>,
    pub(crate) processors: &'a HashMap<String, Processor<S>>,
}

impl<S: TaskStore> PluginContext<'_, S> {
    /// Register an async hook to run during `start`, before processors are
    /// started. Hooks run sequentially, in registration order.
    pub fn on_start<F, Fut>(&mut self, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.start_hooks
            .push(Box::new(move || Box::pin(hook()) as LifecycleHookFuture));
    }

    /// Register an async hook to run during `stop`, after processors have
    /// shut down. Hooks run sequentially, in reverse registration order.
    pub fn on_stop<F, Fut>(&mut self, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.stop_hooks
            .push(Box::new(move || Box::pin(hook()) as LifecycleHookFuture));
    }

    /// Snapshot of the task kinds registered so far, sorted.
    pub fn registered_task_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.processors.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Shared handle to the scheduler's store.
    pub fn datastore(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }

    /// Subscribe to a processor's event stream, if the kind is registered.
    pub fn subscribe_processor_events(
        &self,
        kind: &str,
    ) -> Option<broadcast::Receiver<EventEnvelope<ProcessorEvent>>> {
        self.processors
            .get(kind)
            .map(|processor| processor.events().subscribe())
    }
}
