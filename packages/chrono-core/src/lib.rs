//! # Chrono
//!
//! A durable background-task scheduler: producers schedule typed tasks for
//! future (or immediate) execution, and per-kind processors claim and
//! execute them with at-least-once semantics, configurable retry backoff,
//! idempotency, priority ordering and optional FIFO grouping.
//!
//! Durability is delegated to a pluggable [`TaskStore`]; the scheduler is
//! storage-agnostic. The store's atomic `claim` is the only coordination
//! primitive: there is no in-process locking on the hot path and multiple
//! scheduler processes can share one store.
//!
//! ## Architecture
//!
//! ```text
//! Producers ──schedule()──► Chrono (façade) ──► TaskStore
//!                               │                  ▲
//!                               │ start()/stop()   │ claim / complete /
//!                               ▼                  │ retry / fail
//!                    Processor (one per kind) ─────┘
//!                        │
//!                        ├─► runner loop × max_concurrency
//!                        │       claim → handle (timeout) → settle
//!                        │
//!                        └─► EventBus<ProcessorEvent>
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Claims are exclusive**: the store hands each eligible task to at
//!    most one runner at a time.
//! 2. **At-least-once**: a claim whose completion was not persisted is
//!    re-offered after the stale timeout; handlers must be idempotent.
//! 3. **Events are facts**: in-memory, at-most-once, never load-bearing
//!    for durability.
//! 4. **Registration is pre-start**: the kind→processor map is immutable
//!    once the scheduler starts.
//!
//! ## Example
//!
//! ```ignore
//! use chrono_core::{Chrono, RegisterTaskHandlerOptions, ScheduleTaskInput};
//! use chrono_memory_datastore::MemoryTaskStore;
//!
//! let mut chrono = Chrono::new(MemoryTaskStore::new());
//!
//! chrono.register_task_handler(
//!     RegisterTaskHandlerOptions::builder().kind("send-email").build(),
//!     |task| async move {
//!         let email: Email = task.data_as()?;
//!         deliver(email).await
//!     },
//! )?;
//!
//! chrono.schedule(
//!     ScheduleTaskInput::builder()
//!         .kind("send-email")
//!         .data(serde_json::json!({ "to": "someone@example.com" }))
//!         .build(),
//! ).await?;
//!
//! chrono.start().await?;
//! // ... later
//! chrono.stop().await;
//! ```

mod backoff;
mod bus;
mod error;
mod events;
mod handler;
mod plugin;
mod processor;
mod runner;
mod scheduler;
mod store;
mod task;

pub use backoff::{BackoffStrategyOptions, Jitter};
pub use bus::{EventBus, EventEnvelope};
pub use error::ChronoError;
pub use events::{ProcessorEvent, SchedulerEvent};
pub use handler::{BoxedTaskHandler, TaskHandlerFuture};
pub use plugin::{LifecycleHook, LifecycleHookFuture, Plugin, PluginContext};
pub use processor::{Processor, ProcessorConfig};
pub use runner::TaskRunner;
pub use scheduler::{Chrono, RegisterTaskHandlerOptions};
pub use store::{ClaimQuery, DeleteTaskOptions, TaskStore, TaskStoreError};
pub use task::{DeleteTaskKey, ScheduleTaskInput, Task, TaskStatus};

// Re-export commonly used external types
pub use async_trait::async_trait;
